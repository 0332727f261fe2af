//! Persister contract.
//!
//! The unit of work never talks to a store directly. It hands ordered,
//! per-type batches to a [`Persister`], which reports one [`RowOutcome`] per
//! row. Rows carry plain [`Value`]s: relation targets are already resolved
//! to their primary key values (composite keys as [`Value::Array`]).
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`.

use std::fmt;

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::Error;
use crate::metadata::EntityMetadata;
use crate::value::Value;

/// Kind of write a change set or batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub entity: EntityId,
    /// Column values in property declaration order. Store-generated key
    /// parts that are still unknown are omitted.
    pub values: Vec<(&'static str, Value)>,
}

/// One row to update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRow {
    pub entity: EntityId,
    pub key: Vec<Value>,
    /// Changed columns only; includes the next version when versioned.
    pub values: Vec<(&'static str, Value)>,
    /// Version the row must still carry for the update to apply.
    pub expected_version: Option<Value>,
}

/// One row to delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRow {
    pub entity: EntityId,
    pub key: Vec<Value>,
    pub expected_version: Option<Value>,
}

impl InsertRow {
    /// Value of column `name`, if present.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

impl UpdateRow {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

/// Per-row result of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Applied {
        /// Full primary key when the store generated any part of it.
        generated_key: Option<Vec<Value>>,
        /// Version now stored, when the store assigns it.
        version: Option<Value>,
    },
    /// Expected version did not match.
    VersionMismatch,
    /// Row rejected for another reason.
    Failed(String),
}

impl RowOutcome {
    pub const fn applied() -> Self {
        RowOutcome::Applied {
            generated_key: None,
            version: None,
        }
    }

    pub fn with_key(key: Vec<Value>) -> Self {
        RowOutcome::Applied {
            generated_key: Some(key),
            version: None,
        }
    }

    pub const fn is_applied(&self) -> bool {
        matches!(self, RowOutcome::Applied { .. })
    }
}

/// Result of one persister call: one outcome per input row, same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub rows: Vec<RowOutcome>,
}

impl BatchResult {
    pub fn new(rows: Vec<RowOutcome>) -> Self {
        Self { rows }
    }

    /// Every row applied without generated values.
    pub fn all_applied(count: usize) -> Self {
        Self {
            rows: vec![RowOutcome::applied(); count],
        }
    }

    pub fn applied_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_applied()).count()
    }
}

/// Executes ordered batches against a backing store.
///
/// A whole-batch failure is reported as `Outcome::Err`; individual row
/// failures are reported through [`RowOutcome`].
pub trait Persister: Send + Sync {
    /// Insert rows of one entity type.
    fn execute_insert_batch(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        rows: &[InsertRow],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send;

    /// Update rows of one entity type, by primary key.
    fn execute_update_batch(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        rows: &[UpdateRow],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send;

    /// Delete rows of one entity type, by primary key.
    fn execute_delete_batch(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        rows: &[DeleteRow],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send;
}
