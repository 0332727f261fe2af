//! In-memory persister shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use asupersync::Outcome;
use persistgraph::{
    BatchResult, DeleteRow, EntityMetadata, Error, InsertRow, Operation, PersistenceError,
    PersistenceErrorKind, Persister, RowOutcome, UpdateRow, Value,
};
use persistgraph::{Cx, Result};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Err(e) => e,
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub type Row = BTreeMap<&'static str, Value>;

/// One persister call, as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub entity_type: &'static str,
    pub operation: Operation,
    pub rows: usize,
}

impl Call {
    pub fn new(entity_type: &'static str, operation: Operation, rows: usize) -> Self {
        Self {
            entity_type,
            operation,
            rows,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    next_key: i64,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<&'static str, Table>,
    calls: Vec<Call>,
    fail_batch: Option<(&'static str, Operation)>,
    fail_rows: Vec<(&'static str, &'static str, Value)>,
}

/// Rows keyed by primary key, auto-increment keys per type, and
/// optimistic version checks.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    store: Mutex<Store>,
}

fn key_text(key: &[Value]) -> String {
    key.iter()
        .map(|v| format!("{v:?}"))
        .collect::<Vec<_>>()
        .join("|")
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fail the next batch of `entity_type`/`operation` as a whole.
    pub fn fail_next_batch(&self, entity_type: &'static str, operation: Operation) {
        self.store().fail_batch = Some((entity_type, operation));
    }

    /// Reject every row whose `property` equals `value`.
    pub fn fail_rows_where(&self, entity_type: &'static str, property: &'static str, value: Value) {
        self.store().fail_rows.push((entity_type, property, value));
    }

    pub fn clear_failures(&self) {
        let mut store = self.store();
        store.fail_batch = None;
        store.fail_rows.clear();
    }

    /// Put a row in place without going through a unit of work.
    pub fn seed(&self, entity_type: &'static str, key: &[Value], values: Row) {
        let mut store = self.store();
        let table = store.tables.entry(entity_type).or_default();
        table.rows.insert(key_text(key), values);
    }

    pub fn row(&self, entity_type: &str, key: &[Value]) -> Option<Row> {
        self.store()
            .tables
            .get(entity_type)
            .and_then(|t| t.rows.get(&key_text(key)).cloned())
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.store()
            .tables
            .get(entity_type)
            .map_or(0, |t| t.rows.len())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.store().calls.clone()
    }

    fn begin(&self, meta: &EntityMetadata, operation: Operation, rows: usize) -> Result<()> {
        let mut store = self.store();
        store.calls.push(Call::new(meta.name, operation, rows));
        if store.fail_batch == Some((meta.name, operation)) {
            store.fail_batch = None;
            return Err(PersistenceError {
                kind: PersistenceErrorKind::Transient,
                entity_type: meta.name,
                operation,
                entities: Vec::new(),
                batch_index: 0,
                message: "connection reset".to_string(),
                source: None,
            }
            .into());
        }
        Ok(())
    }

    fn rejects(&self, entity_type: &str, values: &[(&'static str, Value)]) -> bool {
        self.store().fail_rows.iter().any(|(ty, property, value)| {
            *ty == entity_type && values.iter().any(|(n, v)| n == property && v == value)
        })
    }
}

fn version_matches(meta: &EntityMetadata, row: &Row, expected: Option<&Value>) -> bool {
    match (meta.version_property, expected) {
        (Some(property), Some(expected)) => row.get(property) == Some(expected),
        _ => true,
    }
}

impl Persister for MemoryPersister {
    fn execute_insert_batch(
        &self,
        _cx: &Cx,
        meta: &EntityMetadata,
        rows: &[InsertRow],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        let outcome = self.begin(meta, Operation::Create, rows.len()).map(|()| {
            let generated = meta
                .primary_key
                .iter()
                .any(|pk| meta.get_property(pk).is_some_and(|p| p.generated));
            let mut outcomes = Vec::with_capacity(rows.len());
            for row in rows {
                if self.rejects(meta.name, &row.values) {
                    outcomes.push(RowOutcome::Failed("rejected by store".to_string()));
                    continue;
                }
                let mut store = self.store();
                let table = store.tables.entry(meta.name).or_default();
                let mut values: Row = row.values.iter().cloned().collect();
                let key = if generated {
                    table.next_key += 1;
                    let key = vec![Value::BigInt(table.next_key)];
                    values.insert(meta.primary_key[0], key[0].clone());
                    key
                } else {
                    meta.primary_key
                        .iter()
                        .map(|pk| values.get(pk).cloned().unwrap_or(Value::Null))
                        .collect()
                };
                table.rows.insert(key_text(&key), values);
                outcomes.push(if generated {
                    RowOutcome::with_key(key)
                } else {
                    RowOutcome::applied()
                });
            }
            BatchResult::new(outcomes)
        });
        async move {
            match outcome {
                Ok(result) => Outcome::Ok(result),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn execute_update_batch(
        &self,
        _cx: &Cx,
        meta: &EntityMetadata,
        rows: &[UpdateRow],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        let outcome = self.begin(meta, Operation::Update, rows.len()).map(|()| {
            let mut outcomes = Vec::with_capacity(rows.len());
            for row in rows {
                if self.rejects(meta.name, &row.values) {
                    outcomes.push(RowOutcome::Failed("rejected by store".to_string()));
                    continue;
                }
                let mut store = self.store();
                let table = store.tables.entry(meta.name).or_default();
                let Some(stored) = table.rows.get_mut(&key_text(&row.key)) else {
                    outcomes.push(RowOutcome::Failed("no such row".to_string()));
                    continue;
                };
                if !version_matches(meta, stored, row.expected_version.as_ref()) {
                    outcomes.push(RowOutcome::VersionMismatch);
                    continue;
                }
                for (name, value) in &row.values {
                    stored.insert(*name, value.clone());
                }
                outcomes.push(RowOutcome::applied());
            }
            BatchResult::new(outcomes)
        });
        async move {
            match outcome {
                Ok(result) => Outcome::Ok(result),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn execute_delete_batch(
        &self,
        _cx: &Cx,
        meta: &EntityMetadata,
        rows: &[DeleteRow],
    ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
        let outcome = self.begin(meta, Operation::Delete, rows.len()).map(|()| {
            let mut store = self.store();
            let table = store.tables.entry(meta.name).or_default();
            let outcomes = rows
                .iter()
                .map(|row| {
                    let key = key_text(&row.key);
                    let outcome = match table.rows.get(&key) {
                        None => RowOutcome::Failed("no such row".to_string()),
                        Some(stored)
                            if !version_matches(meta, stored, row.expected_version.as_ref()) =>
                        {
                            RowOutcome::VersionMismatch
                        }
                        Some(_) => RowOutcome::applied(),
                    };
                    if outcome.is_applied() {
                        table.rows.remove(&key);
                    }
                    outcome
                })
                .collect();
            BatchResult::new(outcomes)
        });
        async move {
            match outcome {
                Ok(result) => Outcome::Ok(result),
                Err(e) => Outcome::Err(e),
            }
        }
    }
}
