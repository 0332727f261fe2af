//! Core types and traits for persistgraph.
//!
//! This crate provides the foundational abstractions shared by the unit of work:
//!
//! - [`Value`] for dynamically-typed property and key values
//! - [`MetadataRegistry`] describing entity types, keys and relations
//! - [`Entity`] records with tri-state [`Relation`] values
//! - [`Persister`] and [`RelationLoader`] contracts for the backing store
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod entity;
pub mod error;
pub mod loader;
pub mod metadata;
pub mod persister;
pub mod value;

pub use entity::{Entity, EntityData, EntityId, FieldData, PropertyValue, Relation};
pub use error::{
    ConcurrencyError, Error, NotFoundError, PersistenceError, PersistenceErrorKind, Result,
    StateError, StateErrorKind, ValidationError, ValidationErrorKind,
};
pub use loader::RelationLoader;
pub use metadata::{
    Cascade, CascadeSet, EntityMetadata, EntityProperty, MetadataRegistry,
    MetadataRegistryBuilder, ReferenceKind,
};
pub use persister::{
    BatchResult, DeleteRow, InsertRow, Operation, Persister, RowOutcome, UpdateRow,
};
pub use value::{KEY_SEPARATOR, Value};
