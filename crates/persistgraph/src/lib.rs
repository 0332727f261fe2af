//! persistgraph - persist graphs of in-memory objects through a unit of work.
//!
//! persistgraph keeps one instance per stored row, tracks what changed since
//! it was loaded, and writes new, changed and removed entities through a
//! [`Persister`] in foreign-key-safe order:
//!
//! - Identity map with stable [`EntityId`]s and composite-key support
//! - Snapshot-based change sets with optimistic locking
//! - Persist/remove cascades over relations
//! - Commit ordering by dependency graph, breaking cycles with deferred
//!   nullable foreign keys
//! - A flush state machine with retry after partial failure
//!
//! # Quick Start
//!
//! ```ignore
//! use persistgraph::prelude::*;
//!
//! let registry = Arc::new(
//!     MetadataRegistry::builder()
//!         .entity(
//!             EntityMetadata::new("Author")
//!                 .primary_key(&["id"])
//!                 .property(EntityProperty::scalar("id").generated(true))
//!                 .property(EntityProperty::scalar("name")),
//!         )
//!         .entity(
//!             EntityMetadata::new("Book")
//!                 .primary_key(&["id"])
//!                 .property(EntityProperty::scalar("id").generated(true))
//!                 .property(EntityProperty::scalar("title"))
//!                 .property(EntityProperty::many_to_one("author", "Author")),
//!         )
//!         .build()?,
//! );
//!
//! let mut uow = UnitOfWork::new(registry, persister);
//! let author = uow.create(Entity::new("Author").with("name", "Ann"))?;
//! let book = uow.create(
//!     Entity::new("Book")
//!         .with("title", "Dune")
//!         .with_reference("author", Some(author.id())),
//! )?;
//! uow.persist(&book)?;
//!
//! // The author is inserted first; the book row carries its generated key.
//! let report = uow.flush(&cx).await;
//! ```

// Re-export all public types from sub-crates
pub use persistgraph_core::{
    BatchResult, Cascade, CascadeSet, ConcurrencyError, Cx, DeleteRow, Entity, EntityData,
    EntityId, EntityMetadata, EntityProperty, Error, FieldData, InsertRow, KEY_SEPARATOR,
    MetadataRegistry, MetadataRegistryBuilder, NotFoundError, Operation, Outcome,
    PersistenceError, PersistenceErrorKind, Persister, PropertyValue, ReferenceKind, Relation,
    RelationLoader, Result, RowOutcome, StateError, StateErrorKind, UpdateRow, ValidationError,
    ValidationErrorKind, Value,
};
pub use persistgraph_session::{
    BatchEntry, BatchSummary, CascadeResolver, ChangeSet, ChangeSetComputer, ChangeValue,
    CommitBatch, CommitOrderScheduler, CommitPlan, DependencyEdge, EntityRef, FlushEvent,
    FlushFailure, FlushPlan, FlushReport, FlushState, IdentityKey, IdentityMap, ManagedEntity,
    PendingCounts, Snapshot, UnitOfWork, UnitOfWorkConfig,
};

/// Render a flush report as pretty JSON, for logs and diagnostics.
pub fn report_json(report: &FlushReport) -> Result<String> {
    serde_json::to_string_pretty(report)
        .map_err(|e| Error::Custom(format!("failed to serialize flush report: {e}")))
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use persistgraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Metadata
        CascadeSet,
        // asupersync
        Cx,
        // Entities
        Entity,
        EntityData,
        EntityId,
        EntityMetadata,
        EntityProperty,
        EntityRef,
        Error,
        FieldData,
        FlushReport,
        MetadataRegistry,
        Outcome,
        // Store contracts
        Persister,
        RelationLoader,
        Result,
        RowOutcome,
        // Unit of work
        UnitOfWork,
        UnitOfWorkConfig,
        Value,
    };
    pub use std::sync::Arc;
}
