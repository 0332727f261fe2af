//! Error types for persistgraph operations.

use std::fmt;

use crate::entity::EntityId;
use crate::persister::Operation;

/// The primary error type for all persistgraph operations.
#[derive(Debug)]
pub enum Error {
    /// Metadata, key or graph-shape problems detected before any I/O
    Validation(ValidationError),
    /// Optimistic-lock version mismatch reported by the persister
    Concurrency(ConcurrencyError),
    /// A key or entity id that has no managed entity
    NotFound(NotFoundError),
    /// Any other persister failure
    Persistence(PersistenceError),
    /// Operation rejected in the current unit-of-work state
    State(StateError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message (event callbacks, loaders)
    Custom(String),
}

/// A validation failure.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub entity_type: Option<&'static str>,
    pub property: Option<&'static str>,
    pub message: String,
    /// Entity types participating in a dependency cycle, in discovery order.
    pub cycle: Vec<&'static str>,
}

/// The kind of validation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Cycle of non-nullable foreign keys between pending types
    DependencyCycle,
    /// Primary key part cannot be serialized into an identity key
    KeyEncoding,
    /// Non-nullable many-to-one left unset
    MissingRequiredRelation,
    /// Non-generated primary key part missing on create
    MissingPrimaryKey,
    /// Primary key of a persisted entity was modified
    PrimaryKeyChanged,
    /// Entity type not present in the metadata registry
    UnknownEntityType,
    /// Property not declared on the entity type
    UnknownProperty,
    /// Property value does not match the declared reference kind
    PropertyShape,
    /// Relation points at a new entity that is not being persisted
    UnpersistedReference,
    /// Two managed instances claim the same identity key
    DuplicateIdentity,
    /// Metadata registry failed validation
    InvalidSchema,
}

/// A version mismatch for one batch.
#[derive(Debug, Clone)]
pub struct ConcurrencyError {
    pub entity_type: &'static str,
    pub operation: Operation,
    /// Entities whose expected version did not match the stored version.
    pub entities: Vec<EntityId>,
    pub batch_index: usize,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity_type: Option<&'static str>,
    pub key: Option<String>,
    pub entity: Option<EntityId>,
    pub message: String,
}

#[derive(Debug)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    pub entity_type: &'static str,
    pub operation: Operation,
    /// Entities whose rows were not applied.
    pub entities: Vec<EntityId>,
    pub batch_index: usize,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// The whole batch was rejected
    Batch,
    /// Individual rows failed inside an otherwise applied batch
    Row,
    /// Transient failure (lock timeout, dropped connection); retry may succeed
    Transient,
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// A flush is already in progress or was abandoned mid-flight
    FlushInProgress,
    /// The previous flush failed; call retry() or reset()
    FlushFailed,
    /// retry() called while nothing failed
    NothingToRetry,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity_type: None,
            property: None,
            message: message.into(),
            cycle: Vec::new(),
        }
    }

    pub fn for_entity(mut self, entity_type: &'static str) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn for_property(mut self, property: &'static str) -> Self {
        self.property = Some(property);
        self
    }

    /// Build a dependency-cycle error naming the types involved.
    pub fn cycle(types: Vec<&'static str>) -> Self {
        let message = format!(
            "dependency cycle without a nullable foreign key: {}",
            types.join(" -> ")
        );
        Self {
            kind: ValidationErrorKind::DependencyCycle,
            entity_type: types.first().copied(),
            property: None,
            message,
            cycle: types,
        }
    }
}

impl NotFoundError {
    pub fn entity(id: EntityId) -> Self {
        Self {
            entity_type: None,
            key: None,
            entity: Some(id),
            message: format!("entity {id} is not managed by this unit of work"),
        }
    }

    pub fn key(entity_type: &'static str, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("no managed {entity_type} with key '{key}'"),
            entity_type: Some(entity_type),
            key: Some(key),
            entity: None,
        }
    }
}

impl Error {
    /// Is this a failure a later retry may get past?
    ///
    /// Version mismatches are never retryable: the caller must reload.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Persistence(p) => p.kind == PersistenceErrorKind::Transient,
            _ => false,
        }
    }

    /// Was this raised before any I/O, from metadata or graph validation?
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Entities the error is about, if it names any.
    pub fn entities(&self) -> &[EntityId] {
        match self {
            Error::Concurrency(c) => &c.entities,
            Error::Persistence(p) => &p.entities,
            Error::NotFound(n) => n.entity.as_slice(),
            _ => &[],
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Error::Validation(ValidationError::new(kind, message))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Concurrency(e) => write!(f, "Concurrency error: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e.message),
            Error::Persistence(e) => write!(f, "Persistence error: {}", e),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.entity_type, self.property) {
            (Some(ty), Some(prop)) => write!(f, "{}.{}: {}", ty, prop, self.message),
            (Some(ty), None) if self.cycle.is_empty() => write!(f, "{}: {}", ty, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version mismatch on {} {} (batch {}, {} row(s))",
            self.operation,
            self.entity_type,
            self.batch_index,
            self.entities.len()
        )
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed in batch {}: {}",
            self.operation, self.entity_type, self.batch_index, self.message
        )
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<ConcurrencyError> for Error {
    fn from(err: ConcurrencyError) -> Self {
        Error::Concurrency(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

/// Result type alias for persistgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
