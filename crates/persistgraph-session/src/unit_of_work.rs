//! Unit of Work pattern for coordinated persistence.
//!
//! The Unit of Work owns one [`IdentityMap`] and the pending persist/remove
//! intent for a logical session. A flush walks through fixed states:
//!
//! ```text
//! IDLE -> COMPUTING_CHANGESETS -> CASCADING -> ORDERING -> COMMITTING -> IDLE
//!                                                              |
//!                                                              v
//!                                                           FAILED
//! ```
//!
//! Everything before COMMITTING is synchronous and side-effect free: an error
//! there returns the unit of work to IDLE with its pending set intact. Once
//! batches are dispatched, applied rows stay applied; a failing batch stops
//! the flush in FAILED until [`UnitOfWork::retry`] or [`UnitOfWork::reset`].
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry, persister);
//! let author = uow.create(Entity::new("Author").with("name", "Ann"))?;
//! let book = uow.create(
//!     Entity::new("Book")
//!         .with("title", "Dune")
//!         .with_reference("author", Some(author.id())),
//! )?;
//! uow.persist(&book)?;
//! let report = uow.flush(&cx).await;
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use asupersync::{Cx, Outcome};
use persistgraph_core::{
    BatchResult, Cascade, ConcurrencyError, DeleteRow, Entity, EntityData, EntityId,
    EntityMetadata, EntityProperty, Error, FieldData, InsertRow, MetadataRegistry, NotFoundError,
    Operation, PersistenceError, PersistenceErrorKind, Persister, PropertyValue, Relation,
    RelationLoader, Result, RowOutcome, StateError, StateErrorKind, UpdateRow, ValidationError,
    ValidationErrorKind, Value,
};
use serde::Serialize;

use crate::cascade::CascadeResolver;
use crate::change_tracker::{ChangeSet, ChangeSetComputer, ChangeValue};
use crate::flush::{BatchEntry, CommitBatch, CommitOrderScheduler, CommitPlan};
use crate::identity_map::{EntityRef, IdentityMap, ManagedEntity, Snapshot, key_values};

// ============================================================================
// Flush events
// ============================================================================

/// Flush event callback. Returning `Err` aborts the flush when fired before I/O.
type FlushEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Callbacks registered on a unit of work.
#[derive(Default)]
pub struct FlushEventCallbacks {
    before_flush: Vec<FlushEventFn>,
    on_flush: Vec<FlushEventFn>,
    after_flush: Vec<FlushEventFn>,
    flush_failed: Vec<FlushEventFn>,
}

impl fmt::Debug for FlushEventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("on_flush", &self.on_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("flush_failed", &self.flush_failed.len())
            .finish()
    }
}

impl FlushEventCallbacks {
    fn fire(&mut self, event: FlushEvent) -> Result<()> {
        let callbacks = match event {
            FlushEvent::BeforeFlush => &mut self.before_flush,
            FlushEvent::OnFlush => &mut self.on_flush,
            FlushEvent::AfterFlush => &mut self.after_flush,
            FlushEvent::FlushFailed => &mut self.flush_failed,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Flush lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    /// Before any change set is computed.
    BeforeFlush,
    /// After planning, before the first batch is dispatched.
    OnFlush,
    /// After every batch applied.
    AfterFlush,
    /// After a batch failed and the unit of work entered FAILED.
    FlushFailed,
}

// ============================================================================
// Configuration and state
// ============================================================================

/// Configuration for unit-of-work behavior.
#[derive(Debug, Clone)]
pub struct UnitOfWorkConfig {
    /// Rows per persister call.
    pub batch_size: usize,
    /// Diff every managed entity with a snapshot at flush, not only those
    /// passed to `persist`.
    pub track_changes: bool,
    /// `create` also schedules a persist.
    pub persist_on_create: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            batch_size: 300,
            track_changes: true,
            persist_on_create: false,
        }
    }
}

impl UnitOfWorkConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size (builder pattern).
    #[must_use]
    pub fn batch_size(mut self, value: usize) -> Self {
        self.batch_size = value;
        self
    }

    /// Set implicit change tracking (builder pattern).
    #[must_use]
    pub fn track_changes(mut self, value: bool) -> Self {
        self.track_changes = value;
        self
    }

    /// Set persist-on-create (builder pattern).
    #[must_use]
    pub fn persist_on_create(mut self, value: bool) -> Self {
        self.persist_on_create = value;
        self
    }
}

/// Where a unit of work is in its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushState {
    Idle,
    ComputingChangeSets,
    Cascading,
    Ordering,
    Committing,
    Failed,
}

impl FlushState {
    pub const fn as_str(self) -> &'static str {
        match self {
            FlushState::Idle => "IDLE",
            FlushState::ComputingChangeSets => "COMPUTING_CHANGESETS",
            FlushState::Cascading => "CASCADING",
            FlushState::Ordering => "ORDERING",
            FlushState::Committing => "COMMITTING",
            FlushState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FlushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Reports
// ============================================================================

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub entity_type: &'static str,
    pub operation: Operation,
    pub deferred: bool,
    pub rows: usize,
    pub applied: usize,
}

impl BatchSummary {
    fn planned(batch: &CommitBatch) -> Self {
        Self {
            entity_type: batch.entity_type,
            operation: batch.operation,
            deferred: batch.deferred,
            rows: batch.len(),
            applied: 0,
        }
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows touched by deferred foreign-key fills.
    pub deferred_updates: usize,
    pub batches: Vec<BatchSummary>,
}

impl FlushReport {
    /// Total number of rows written, deferred fills excluded.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    fn record(&mut self, summary: BatchSummary) {
        match (summary.operation, summary.deferred) {
            (Operation::Create, _) => self.inserted += summary.applied,
            (Operation::Update, true) => self.deferred_updates += summary.applied,
            (Operation::Update, false) => self.updated += summary.applied,
            (Operation::Delete, _) => self.deleted += summary.applied,
        }
        self.batches.push(summary);
    }
}

/// Batches of the flush that left the unit of work FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushFailure {
    pub completed: Vec<BatchSummary>,
    pub failed: BatchSummary,
    /// Batches never dispatched.
    pub remaining: Vec<BatchSummary>,
    pub failed_entities: Vec<EntityId>,
    pub message: String,
}

/// Change sets and batches a flush would run right now.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushPlan {
    pub change_sets: Vec<ChangeSet>,
    pub commit: CommitPlan,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    /// Change set for `id`, if the flush would write it.
    pub fn change_set(&self, id: EntityId) -> Option<&ChangeSet> {
        self.change_sets.iter().find(|cs| cs.entity == id)
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

enum BatchRows {
    Insert(Vec<InsertRow>),
    Update(Vec<UpdateRow>),
    Delete(Vec<DeleteRow>),
}

// ============================================================================
// Unit of work
// ============================================================================

/// Coordinates identity, change tracking, cascades and ordered commits.
pub struct UnitOfWork<P: Persister> {
    registry: Arc<MetadataRegistry>,
    identity_map: IdentityMap,
    persister: P,
    config: UnitOfWorkConfig,
    state: FlushState,
    pending_persist: BTreeSet<EntityId>,
    pending_remove: BTreeSet<EntityId>,
    last_failure: Option<FlushFailure>,
    event_callbacks: FlushEventCallbacks,
}

impl<P: Persister> fmt::Debug for UnitOfWork<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("managed", &self.identity_map.len())
            .field("pending_persist", &self.pending_persist.len())
            .field("pending_remove", &self.pending_remove.len())
            .field("config", &self.config)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<P: Persister> UnitOfWork<P> {
    pub fn new(registry: Arc<MetadataRegistry>, persister: P) -> Self {
        Self::with_config(registry, persister, UnitOfWorkConfig::default())
    }

    pub fn with_config(
        registry: Arc<MetadataRegistry>,
        persister: P,
        config: UnitOfWorkConfig,
    ) -> Self {
        Self {
            identity_map: IdentityMap::new(Arc::clone(&registry)),
            registry,
            persister,
            config,
            state: FlushState::Idle,
            pending_persist: BTreeSet::new(),
            pending_remove: BTreeSet::new(),
            last_failure: None,
            event_callbacks: FlushEventCallbacks::default(),
        }
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn persister(&self) -> &P {
        &self.persister
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Batches of the last failed flush, until the next successful one.
    pub fn last_failure(&self) -> Option<&FlushFailure> {
        self.last_failure.as_ref()
    }

    // ==================== Events ====================

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Fired after planning; an error here still prevents any I/O.
    pub fn on_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.on_flush.push(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    pub fn on_flush_failed(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.flush_failed.push(Box::new(f));
    }

    // ==================== Intent ====================

    /// Start managing a new entity instance.
    ///
    /// Returns the existing instance when the entity's key is already managed.
    pub fn create(&mut self, entity: Entity) -> Result<EntityRef> {
        let entity = self.identity_map.register(entity)?;
        if self.config.persist_on_create {
            self.pending_persist.insert(entity.id());
        }
        Ok(entity)
    }

    /// Schedule a managed entity for persistence at the next flush.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.identity_map.require(entity.id())?;
        self.pending_persist.insert(entity.id());
        Ok(())
    }

    /// Schedule a managed entity for deletion at the next flush.
    ///
    /// Removal wins over any persist of the same entity.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.identity_map.require(entity.id())?;
        self.pending_remove.insert(entity.id());
        Ok(())
    }

    /// Schedule the managed entity with `key` for deletion.
    pub fn remove_by_key(&mut self, entity_type: &str, key: &[Value]) -> Result<()> {
        let meta = self.registry.get_metadata(entity_type)?;
        let entity = self.identity_map.lookup(meta.name, key)?.ok_or_else(|| {
            NotFoundError::key(
                meta.name,
                key.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>().join(", "),
            )
        })?;
        self.remove(&entity)
    }

    /// Stop managing an entity and drop any pending intent for it.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        let id = entity.id();
        self.pending_persist.remove(&id);
        self.pending_remove.remove(&id);
        self.identity_map.forget(id).is_some()
    }

    // ==================== Identity ====================

    /// Apply loaded field values to the instance for `key`.
    pub fn merge(
        &mut self,
        entity_type: &str,
        key: &[Value],
        fields: Vec<(&'static str, FieldData)>,
    ) -> Result<EntityRef> {
        self.identity_map.merge(entity_type, key, fields)
    }

    pub fn merge_data(&mut self, data: EntityData) -> Result<EntityRef> {
        self.identity_map
            .merge(data.entity_type, &data.key, data.fields)
    }

    /// Managed instance for `key`, or an uninitialized stub.
    pub fn reference(&mut self, entity_type: &str, key: &[Value]) -> Result<EntityRef> {
        self.identity_map.reference(entity_type, key)
    }

    pub fn find(&self, entity_type: &str, key: &[Value]) -> Result<Option<EntityRef>> {
        self.identity_map.lookup(entity_type, key)
    }

    pub fn get(&self, id: EntityId) -> Option<EntityRef> {
        self.identity_map.get(id)
    }

    // ==================== Inspection ====================

    /// Would the next flush write this entity (ignoring cascades)?
    pub fn is_dirty(&self, entity: &EntityRef) -> Result<bool> {
        let managed = self.identity_map.require(entity.id())?;
        ChangeSetComputer::new(&self.registry).is_dirty(managed)
    }

    /// Change set for one entity, honoring a pending removal.
    pub fn compute_change_set(&self, entity: &EntityRef) -> Result<Option<ChangeSet>> {
        let managed = self.identity_map.require(entity.id())?;
        ChangeSetComputer::new(&self.registry)
            .compute(managed, self.pending_remove.contains(&entity.id()))
    }

    /// Plan the next flush without touching state or the store.
    pub fn compute_flush_plan(&self) -> Result<FlushPlan> {
        let (persist_roots, remove_roots) = self.collect_roots();
        let change_sets = self.compute_change_sets(&persist_roots, &remove_roots)?;
        let commit = CommitOrderScheduler::new(&self.registry, self.config.batch_size)
            .schedule(&change_sets)?;
        Ok(FlushPlan {
            change_sets,
            commit,
        })
    }

    /// Pending work from explicit intent and tracked entities, before cascades.
    pub fn pending_counts(&self) -> PendingCounts {
        let computer = ChangeSetComputer::new(&self.registry);
        let mut counts = PendingCounts::default();
        for managed in self.identity_map.iter() {
            let id = managed.id();
            if self.pending_remove.contains(&id) {
                if !managed.is_new() {
                    counts.deleted += 1;
                }
                continue;
            }
            if managed.is_new() {
                if self.pending_persist.contains(&id) {
                    counts.new += 1;
                }
                continue;
            }
            let tracked = self.config.track_changes || self.pending_persist.contains(&id);
            if tracked && computer.is_dirty(managed).unwrap_or(true) {
                counts.dirty += 1;
            }
        }
        counts
    }

    // ==================== Relation loading ====================

    /// Load an unloaded relation through `loader` and merge the results.
    ///
    /// The relation value and the snapshot are updated together, so loading
    /// never shows up as a change.
    #[tracing::instrument(level = "debug", skip(self, cx, loader, entity), fields(id = %entity.id()))]
    pub async fn fetch_relation<L: RelationLoader>(
        &mut self,
        cx: &Cx,
        loader: &L,
        entity: &EntityRef,
        property: &'static str,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(&self.registry);
        let (meta, prop, key) = match self.loadable(&registry, entity, property) {
            Ok(target) => target,
            Err(e) => return Outcome::Err(e),
        };

        let previous = entity.read().property(prop.name).cloned();
        let loading = if prop.is_collection() {
            PropertyValue::Collection(Relation::Loading)
        } else {
            PropertyValue::Reference(Relation::Loading)
        };
        entity.write().set_property(prop.name, loading);

        let rows = match loader.load_relation(cx, meta, &key, prop).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => {
                restore(entity, prop.name, previous);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                restore(entity, prop.name, previous);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                restore(entity, prop.name, previous);
                return Outcome::Panicked(p);
            }
        };

        let mut ids = Vec::with_capacity(rows.len());
        for data in rows {
            match self.merge_data(data) {
                Ok(target) => ids.push(target.id()),
                Err(e) => {
                    restore(entity, prop.name, previous);
                    return Outcome::Err(e);
                }
            }
        }
        tracing::debug!(property, loaded = ids.len(), "Relation loaded");

        let value = if prop.is_collection() {
            PropertyValue::Collection(Relation::Loaded(ids))
        } else {
            PropertyValue::Reference(Relation::Loaded(ids.first().copied()))
        };
        entity.write().set_property(prop.name, value.clone());
        if let Some(snapshot) = self
            .identity_map
            .managed_mut(entity.id())
            .and_then(|m| m.snapshot.as_mut())
        {
            snapshot.values.insert(prop.name, value);
        }
        Outcome::Ok(())
    }

    fn loadable<'r>(
        &self,
        registry: &'r MetadataRegistry,
        entity: &EntityRef,
        property: &str,
    ) -> Result<(&'r EntityMetadata, &'r EntityProperty, Vec<Value>)> {
        let managed = self.identity_map.require(entity.id())?;
        let meta = registry.get_metadata(managed.entity_type)?;
        let prop = meta.require_property(property)?;
        if !prop.kind.is_relation() {
            return Err(ValidationError::new(
                ValidationErrorKind::PropertyShape,
                "only relation properties can be fetched",
            )
            .for_entity(meta.name)
            .for_property(prop.name)
            .into());
        }
        let key = managed.key_values.clone().ok_or_else(|| {
            Error::from(
                ValidationError::new(
                    ValidationErrorKind::MissingPrimaryKey,
                    "cannot load relations of an entity without a key",
                )
                .for_entity(meta.name),
            )
        })?;
        Ok((meta, prop, key))
    }

    // ==================== Flush ====================

    /// Write all pending work to the persister.
    ///
    /// Rejected with a `StateError` unless the unit of work is IDLE.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        match self.state {
            FlushState::Idle => self.run_flush(cx).await,
            FlushState::Failed => Outcome::Err(
                StateError {
                    kind: StateErrorKind::FlushFailed,
                    message: "previous flush failed; call retry() or reset()".to_string(),
                }
                .into(),
            ),
            other => Outcome::Err(
                StateError {
                    kind: StateErrorKind::FlushInProgress,
                    message: format!("flush rejected while {other}"),
                }
                .into(),
            ),
        }
    }

    /// Resume a FAILED flush.
    ///
    /// Applied rows already carry refreshed snapshots, so the plan is
    /// recomputed and only the unapplied work is dispatched.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn retry(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        if self.state != FlushState::Failed {
            return Outcome::Err(
                StateError {
                    kind: StateErrorKind::NothingToRetry,
                    message: format!("retry() called while {}", self.state),
                }
                .into(),
            );
        }
        tracing::info!(
            remaining = self.last_failure.as_ref().map_or(0, |f| f.remaining.len() + 1),
            "Retrying failed flush"
        );
        self.transition(FlushState::Idle);
        self.run_flush(cx).await
    }

    /// Discard pending intent and leave FAILED (or an abandoned flush).
    ///
    /// Managed entities and their snapshots are kept.
    pub fn reset(&mut self) {
        self.pending_persist.clear();
        self.pending_remove.clear();
        self.last_failure = None;
        self.transition(FlushState::Idle);
    }

    /// Reset and stop managing every entity.
    pub fn clear(&mut self) {
        self.reset();
        self.identity_map.clear();
    }

    fn transition(&mut self, next: FlushState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "Flush state change");
            self.state = next;
        }
    }

    async fn run_flush(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        let start = Instant::now();
        if let Err(e) = self.event_callbacks.fire(FlushEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        let (change_sets, plan) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::debug!(error = %e, "Flush aborted before commit");
                self.transition(FlushState::Idle);
                return Outcome::Err(e);
            }
        };

        if let Some(reason) = cx.cancel_reason() {
            self.transition(FlushState::Idle);
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = self.event_callbacks.fire(FlushEvent::OnFlush) {
            self.transition(FlushState::Idle);
            return Outcome::Err(e);
        }

        tracing::info!(
            change_sets = change_sets.len(),
            batches = plan.len(),
            rows = plan.row_count(),
            deferred_edges = plan.deferred_edges.len(),
            "Executing flush plan"
        );
        self.transition(FlushState::Committing);

        let mut report = FlushReport::default();
        let mut completed = Vec::with_capacity(plan.len());
        for (index, batch) in plan.batches.iter().enumerate() {
            let (summary, outcome) = self.commit_batch(cx, index, batch, &change_sets).await;
            let remaining = || {
                plan.batches[index + 1..]
                    .iter()
                    .map(BatchSummary::planned)
                    .collect::<Vec<_>>()
            };
            match outcome {
                Outcome::Ok(()) => {
                    completed.push(summary.clone());
                    report.record(summary);
                }
                Outcome::Err(e) => {
                    let e = self.fail(e, completed, summary, remaining());
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.fail(Error::Cancelled, completed, summary, remaining());
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.fail(
                        Error::Custom("persister panicked".to_string()),
                        completed,
                        summary,
                        remaining(),
                    );
                    return Outcome::Panicked(p);
                }
            }
        }

        self.finish_flush();
        if let Err(e) = self.event_callbacks.fire(FlushEvent::AfterFlush) {
            return Outcome::Err(e);
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            deferred_updates = report.deferred_updates,
            "Flush complete"
        );
        Outcome::Ok(report)
    }

    /// Steps before any I/O: collect, cascade, compute, order.
    fn prepare(&mut self) -> Result<(Vec<ChangeSet>, CommitPlan)> {
        self.transition(FlushState::ComputingChangeSets);
        let (persist_roots, remove_roots) = self.collect_roots();

        self.transition(FlushState::Cascading);
        let change_sets = self.compute_change_sets(&persist_roots, &remove_roots)?;

        self.transition(FlushState::Ordering);
        let plan = CommitOrderScheduler::new(&self.registry, self.config.batch_size)
            .schedule(&change_sets)?;
        Ok((change_sets, plan))
    }

    /// Persist roots (explicit plus tracked) and remove roots.
    fn collect_roots(&self) -> (Vec<EntityId>, Vec<EntityId>) {
        let mut persist = self.pending_persist.clone();
        if self.config.track_changes {
            persist.extend(
                self.identity_map
                    .iter()
                    .filter(|m| !m.is_new())
                    .map(ManagedEntity::id),
            );
        }
        let persist = persist
            .into_iter()
            .filter(|id| !self.pending_remove.contains(id))
            .collect();
        (persist, self.pending_remove.iter().copied().collect())
    }

    fn compute_change_sets(
        &self,
        persist_roots: &[EntityId],
        remove_roots: &[EntityId],
    ) -> Result<Vec<ChangeSet>> {
        let mut resolver = CascadeResolver::new(&self.identity_map);

        let mut removal: BTreeSet<EntityId> = remove_roots.iter().copied().collect();
        removal.extend(resolver.expand_all(remove_roots.iter().copied(), Cascade::Remove)?);

        let roots: Vec<EntityId> = persist_roots
            .iter()
            .copied()
            .filter(|id| !removal.contains(id))
            .collect();
        let mut closure: BTreeSet<EntityId> = roots.iter().copied().collect();
        closure.extend(resolver.expand_all(roots, Cascade::Persist)?);
        closure.extend(removal.iter().copied());
        tracing::debug!(
            closure = closure.len(),
            removals = removal.len(),
            "Cascades expanded"
        );

        let computer = ChangeSetComputer::new(&self.registry);
        let mut change_sets = Vec::new();
        for id in &closure {
            let managed = self.identity_map.require(*id)?;
            if let Some(cs) = computer.compute(managed, removal.contains(id))? {
                change_sets.push(cs);
            }
        }

        self.validate_references(&change_sets)?;
        Ok(change_sets)
    }

    /// Every written reference must target the declared type, and an entity
    /// that is persisted or created in this flush.
    fn validate_references(&self, change_sets: &[ChangeSet]) -> Result<()> {
        let creating: HashSet<EntityId> = change_sets
            .iter()
            .filter(|cs| cs.operation == Operation::Create)
            .map(|cs| cs.entity)
            .collect();

        for cs in change_sets.iter().filter(|cs| cs.operation != Operation::Delete) {
            let meta = self.registry.get_metadata(cs.entity_type)?;
            for (property, target) in cs.references() {
                let prop = meta.require_property(property)?;
                let managed = self.identity_map.require(target)?;
                match prop.target {
                    Some(expected) if expected != managed.entity_type => {
                        return Err(ValidationError::new(
                            ValidationErrorKind::PropertyShape,
                            format!(
                                "references a {} where {} is expected",
                                managed.entity_type, expected
                            ),
                        )
                        .for_entity(meta.name)
                        .for_property(prop.name)
                        .into());
                    }
                    _ => {}
                }
                if managed.is_new() && !creating.contains(&target) {
                    return Err(ValidationError::new(
                        ValidationErrorKind::UnpersistedReference,
                        format!(
                            "references entity {target}, which is neither persisted nor scheduled for persist"
                        ),
                    )
                    .for_entity(meta.name)
                    .for_property(prop.name)
                    .into());
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, batch, change_sets),
        fields(entity_type = batch.entity_type, operation = %batch.operation, rows = batch.len())
    )]
    async fn commit_batch(
        &mut self,
        cx: &Cx,
        index: usize,
        batch: &CommitBatch,
        change_sets: &[ChangeSet],
    ) -> (BatchSummary, Outcome<(), Error>) {
        let mut summary = BatchSummary::planned(batch);
        let registry = Arc::clone(&self.registry);
        let meta = match registry.get_metadata(batch.entity_type) {
            Ok(meta) => meta,
            Err(e) => return (summary, Outcome::Err(e)),
        };
        let rows = match self.build_rows(meta, batch, change_sets) {
            Ok(rows) => rows,
            Err(e) => return (summary, Outcome::Err(e)),
        };

        let entities = batch_entities(batch, change_sets);
        let result = match self.dispatch(cx, meta, &rows).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => {
                return (summary, Outcome::Err(batch_error(e, batch, index, entities)));
            }
            Outcome::Cancelled(r) => return (summary, Outcome::Cancelled(r)),
            Outcome::Panicked(p) => return (summary, Outcome::Panicked(p)),
        };

        if result.rows.len() != batch.len() {
            let message = format!(
                "persister returned {} outcome(s) for {} row(s)",
                result.rows.len(),
                batch.len()
            );
            let error = PersistenceError {
                kind: PersistenceErrorKind::Batch,
                entity_type: batch.entity_type,
                operation: batch.operation,
                entities,
                batch_index: index,
                message,
                source: None,
            };
            return (summary, Outcome::Err(error.into()));
        }

        let mut mismatched = Vec::new();
        let mut failed = Vec::new();
        for (entry, row) in batch.entries.iter().zip(result.rows) {
            let cs = &change_sets[entry.change_set];
            match row {
                RowOutcome::Applied {
                    generated_key,
                    version,
                } => {
                    if let Err(e) = self.apply_row(meta, batch, entry, cs, generated_key, version) {
                        return (summary, Outcome::Err(e));
                    }
                    summary.applied += 1;
                }
                RowOutcome::VersionMismatch => mismatched.push(cs.entity),
                RowOutcome::Failed(message) => failed.push((cs.entity, message)),
            }
        }

        if !mismatched.is_empty() {
            let error = ConcurrencyError {
                entity_type: batch.entity_type,
                operation: batch.operation,
                entities: mismatched,
                batch_index: index,
            };
            return (summary, Outcome::Err(error.into()));
        }
        if let Some((_, first)) = failed.first() {
            let error = PersistenceError {
                kind: PersistenceErrorKind::Row,
                entity_type: batch.entity_type,
                operation: batch.operation,
                message: format!("{} row(s) failed: {first}", failed.len()),
                entities: failed.iter().map(|(id, _)| *id).collect(),
                batch_index: index,
                source: None,
            };
            return (summary, Outcome::Err(error.into()));
        }

        tracing::debug!(applied = summary.applied, "Batch committed");
        (summary, Outcome::Ok(()))
    }

    async fn dispatch(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        rows: &BatchRows,
    ) -> Outcome<BatchResult, Error> {
        match rows {
            BatchRows::Insert(rows) => self.persister.execute_insert_batch(cx, meta, rows).await,
            BatchRows::Update(rows) => self.persister.execute_update_batch(cx, meta, rows).await,
            BatchRows::Delete(rows) => self.persister.execute_delete_batch(cx, meta, rows).await,
        }
    }

    fn build_rows(
        &self,
        meta: &EntityMetadata,
        batch: &CommitBatch,
        change_sets: &[ChangeSet],
    ) -> Result<BatchRows> {
        let entries = batch
            .entries
            .iter()
            .map(|entry| (entry, &change_sets[entry.change_set]));

        let rows = match (batch.operation, batch.deferred) {
            (Operation::Create, _) => BatchRows::Insert(
                entries
                    .map(|(entry, cs)| {
                        Ok(InsertRow {
                            entity: cs.entity,
                            values: self.column_values(meta, cs, &entry.deferred_properties)?,
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
            (Operation::Update, true) => BatchRows::Update(
                entries
                    .map(|(entry, cs)| {
                        if cs.operation == Operation::Delete {
                            return Ok(UpdateRow {
                                entity: cs.entity,
                                key: self.row_key(cs)?,
                                values: entry
                                    .deferred_properties
                                    .iter()
                                    .map(|name| (*name, Value::Null))
                                    .collect(),
                                expected_version: None,
                            });
                        }
                        let values = entry
                            .deferred_properties
                            .iter()
                            .filter_map(|name| cs.changes.get(name).map(|c| (*name, c)))
                            .map(|(name, change)| Ok((name, self.column_value(change)?)))
                            .collect::<Result<Vec<_>>>()?;
                        Ok(UpdateRow {
                            entity: cs.entity,
                            key: self.current_key(cs.entity)?,
                            values,
                            expected_version: None,
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
            (Operation::Update, false) => BatchRows::Update(
                entries
                    .map(|(_, cs)| {
                        Ok(UpdateRow {
                            entity: cs.entity,
                            key: self.row_key(cs)?,
                            values: self.column_values(meta, cs, &[])?,
                            expected_version: cs.original_version.clone(),
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
            (Operation::Delete, _) => BatchRows::Delete(
                entries
                    .map(|(_, cs)| {
                        Ok(DeleteRow {
                            entity: cs.entity,
                            key: self.row_key(cs)?,
                            expected_version: cs.original_version.clone(),
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
        };
        Ok(rows)
    }

    /// Changed columns in declaration order; `deferred` ones are sent as NULL.
    fn column_values(
        &self,
        meta: &EntityMetadata,
        cs: &ChangeSet,
        deferred: &[&'static str],
    ) -> Result<Vec<(&'static str, Value)>> {
        let mut values = Vec::with_capacity(cs.changes.len());
        for prop in &meta.properties {
            let Some(change) = cs.changes.get(prop.name) else {
                continue;
            };
            let value = if deferred.contains(&prop.name) {
                Value::Null
            } else {
                self.column_value(change)?
            };
            values.push((prop.name, value));
        }
        Ok(values)
    }

    /// Relation targets become their key: single keys as-is, composite
    /// keys as `Value::Array`, collections as an array of those.
    fn column_value(&self, change: &ChangeValue) -> Result<Value> {
        match change {
            ChangeValue::Value(v) => Ok(v.clone()),
            ChangeValue::Reference(None) => Ok(Value::Null),
            ChangeValue::Reference(Some(target)) => self.reference_value(*target),
            ChangeValue::Collection(targets) => targets
                .iter()
                .map(|t| self.reference_value(*t))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
        }
    }

    fn reference_value(&self, target: EntityId) -> Result<Value> {
        let key = self.current_key(target)?;
        Ok(match key.as_slice() {
            [single] => single.clone(),
            parts => Value::Array(parts.to_vec()),
        })
    }

    fn current_key(&self, id: EntityId) -> Result<Vec<Value>> {
        let managed = self.identity_map.require(id)?;
        managed.key_values.clone().ok_or_else(|| {
            ValidationError::new(
                ValidationErrorKind::UnpersistedReference,
                format!("entity {id} has no primary key yet"),
            )
            .for_entity(managed.entity_type)
            .into()
        })
    }

    fn row_key(&self, cs: &ChangeSet) -> Result<Vec<Value>> {
        match &cs.primary_key {
            Some(key) => Ok(key.clone()),
            None => self.current_key(cs.entity),
        }
    }

    fn apply_row(
        &mut self,
        meta: &EntityMetadata,
        batch: &CommitBatch,
        entry: &BatchEntry,
        cs: &ChangeSet,
        generated_key: Option<Vec<Value>>,
        version: Option<Value>,
    ) -> Result<()> {
        match (batch.operation, batch.deferred) {
            (Operation::Create, _) => self.apply_insert(meta, entry, cs, generated_key, version),
            (Operation::Update, true) => {
                let managed = self
                    .identity_map
                    .managed_mut(cs.entity)
                    .ok_or(NotFoundError::entity(cs.entity))?;
                let snapshot = managed.snapshot.get_or_insert_with(Snapshot::empty);
                if cs.operation == Operation::Delete {
                    // Unlinked ahead of its delete; stays pending removal.
                    for name in &entry.deferred_properties {
                        snapshot
                            .values
                            .insert(*name, PropertyValue::Reference(Relation::Loaded(None)));
                    }
                    snapshot.taken_at = Instant::now();
                    return Ok(());
                }
                for name in &entry.deferred_properties {
                    if let Some(change) = cs.changes.get(name) {
                        snapshot.values.insert(*name, change.to_property());
                    }
                }
                snapshot.taken_at = Instant::now();
                self.pending_persist.remove(&cs.entity);
                Ok(())
            }
            (Operation::Update, false) => {
                let managed = self
                    .identity_map
                    .managed_mut(cs.entity)
                    .ok_or(NotFoundError::entity(cs.entity))?;
                let entity = managed.entity.clone();
                let snapshot = managed.snapshot.get_or_insert_with(Snapshot::empty);
                for (name, change) in &cs.changes {
                    snapshot.values.insert(*name, change.to_property());
                }
                record_version(meta, &entity, snapshot, cs, version);
                snapshot.taken_at = Instant::now();
                self.pending_persist.remove(&cs.entity);
                Ok(())
            }
            (Operation::Delete, _) => {
                self.identity_map.forget(cs.entity);
                self.pending_remove.remove(&cs.entity);
                self.pending_persist.remove(&cs.entity);
                Ok(())
            }
        }
    }

    fn apply_insert(
        &mut self,
        meta: &EntityMetadata,
        entry: &BatchEntry,
        cs: &ChangeSet,
        generated_key: Option<Vec<Value>>,
        version: Option<Value>,
    ) -> Result<()> {
        let entity = self.identity_map.require(cs.entity)?.entity.clone();
        let key = match generated_key {
            Some(key) => {
                if key.len() != meta.primary_key.len() {
                    return Err(ValidationError::new(
                        ValidationErrorKind::KeyEncoding,
                        format!(
                            "persister returned {} key part(s), expected {}",
                            key.len(),
                            meta.primary_key.len()
                        ),
                    )
                    .for_entity(meta.name)
                    .into());
                }
                let mut guard = entity.write();
                for (name, value) in meta.primary_key.iter().zip(&key) {
                    guard.set(*name, value.clone());
                }
                key
            }
            None => key_values(meta, &entity.read()).ok_or_else(|| {
                Error::from(
                    ValidationError::new(
                        ValidationErrorKind::MissingPrimaryKey,
                        "persister returned no key for a generated primary key",
                    )
                    .for_entity(meta.name),
                )
            })?,
        };

        let mut snapshot = Snapshot::empty();
        for (name, change) in &cs.changes {
            if !entry.deferred_properties.contains(name) {
                snapshot.values.insert(*name, change.to_property());
            }
        }
        for (name, value) in meta.primary_key.iter().zip(&key) {
            snapshot.values.insert(*name, PropertyValue::Scalar(value.clone()));
        }
        record_version(meta, &entity, &mut snapshot, cs, version);

        self.identity_map.rekey(cs.entity, key)?;
        self.identity_map.set_snapshot(cs.entity, snapshot)?;
        if entry.deferred_properties.is_empty() {
            self.pending_persist.remove(&cs.entity);
        }
        Ok(())
    }

    /// Enter FAILED and keep the batch breakdown for the caller.
    fn fail(
        &mut self,
        error: Error,
        completed: Vec<BatchSummary>,
        failed: BatchSummary,
        remaining: Vec<BatchSummary>,
    ) -> Error {
        tracing::warn!(
            error = %error,
            entity_type = failed.entity_type,
            operation = %failed.operation,
            completed = completed.len(),
            remaining = remaining.len(),
            "Flush failed"
        );
        self.last_failure = Some(FlushFailure {
            completed,
            failed,
            remaining,
            failed_entities: error.entities().to_vec(),
            message: error.to_string(),
        });
        self.transition(FlushState::Failed);
        if let Err(e) = self.event_callbacks.fire(FlushEvent::FlushFailed) {
            tracing::warn!(error = %e, "flush_failed callback returned an error");
        }
        error
    }

    fn finish_flush(&mut self) {
        // Removed entities that were never written have nothing to delete.
        for id in std::mem::take(&mut self.pending_remove) {
            if self.identity_map.managed(id).is_some_and(ManagedEntity::is_new) {
                self.identity_map.forget(id);
            }
        }
        self.pending_persist.clear();
        self.last_failure = None;
        self.transition(FlushState::Idle);
    }
}

fn record_version(
    meta: &EntityMetadata,
    entity: &EntityRef,
    snapshot: &mut Snapshot,
    cs: &ChangeSet,
    stored: Option<Value>,
) {
    let Some(property) = meta.version_property else {
        return;
    };
    let written = match cs.get(property) {
        Some(ChangeValue::Value(v)) => Some(v.clone()),
        _ => None,
    };
    if let Some(version) = stored.or(written) {
        entity.set(property, version.clone());
        snapshot.values.insert(property, PropertyValue::Scalar(version));
    }
}

fn restore(entity: &EntityRef, property: &'static str, previous: Option<PropertyValue>) {
    let mut guard = entity.write();
    match previous {
        Some(value) => guard.set_property(property, value),
        None => {
            guard.unset(property);
        }
    }
}

fn batch_entities(batch: &CommitBatch, change_sets: &[ChangeSet]) -> Vec<EntityId> {
    batch
        .entries
        .iter()
        .map(|entry| change_sets[entry.change_set].entity)
        .collect()
}

/// Attach batch context to a whole-batch persister failure.
fn batch_error(error: Error, batch: &CommitBatch, index: usize, entities: Vec<EntityId>) -> Error {
    match error {
        Error::Persistence(mut p) => {
            if p.entities.is_empty() {
                p.entities = entities;
            }
            p.entity_type = batch.entity_type;
            p.operation = batch.operation;
            p.batch_index = index;
            Error::Persistence(p)
        }
        Error::Concurrency(mut c) => {
            c.batch_index = index;
            Error::Concurrency(c)
        }
        other => PersistenceError {
            kind: PersistenceErrorKind::Batch,
            entity_type: batch.entity_type,
            operation: batch.operation,
            entities,
            batch_index: index,
            message: other.to_string(),
            source: Some(Box::new(other)),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::types::CancelKind;
    use persistgraph_core::CascadeSet;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected error, got: {other:?}")),
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        Arc::new(
            MetadataRegistry::builder()
                .entity(
                    EntityMetadata::new("Author")
                        .primary_key(&["id"])
                        .property(EntityProperty::scalar("id").generated(true))
                        .property(EntityProperty::scalar("name"))
                        .property(EntityProperty::scalar("version"))
                        .property(
                            EntityProperty::one_to_many("books", "Book", "author")
                                .cascade(CascadeSet::ALL),
                        )
                        .version("version"),
                )
                .entity(
                    EntityMetadata::new("Book")
                        .primary_key(&["id"])
                        .property(EntityProperty::scalar("id").generated(true))
                        .property(EntityProperty::scalar("title"))
                        .property(EntityProperty::many_to_one("author", "Author")),
                )
                .build()
                .unwrap(),
        )
    }

    #[derive(Default)]
    struct RecordingPersister {
        keys: Mutex<HashMap<&'static str, i64>>,
        log: Mutex<Vec<String>>,
        reject_updates: AtomicBool,
        /// Update batches never complete while set.
        stall_updates: AtomicBool,
    }

    impl RecordingPersister {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl Persister for RecordingPersister {
        fn execute_insert_batch(
            &self,
            _cx: &Cx,
            meta: &EntityMetadata,
            rows: &[InsertRow],
        ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
            let mut keys = self.keys.lock().unwrap();
            let next = keys.entry(meta.name).or_insert(0);
            let outcomes = rows
                .iter()
                .map(|_| {
                    *next += 1;
                    RowOutcome::with_key(vec![Value::BigInt(*next)])
                })
                .collect();
            self.log
                .lock()
                .unwrap()
                .push(format!("INSERT {} x{}", meta.name, rows.len()));
            async move { Outcome::Ok(BatchResult::new(outcomes)) }
        }

        fn execute_update_batch(
            &self,
            _cx: &Cx,
            meta: &EntityMetadata,
            rows: &[UpdateRow],
        ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
            let result = if self.reject_updates.load(Ordering::SeqCst) {
                BatchResult::new(vec![RowOutcome::VersionMismatch; rows.len()])
            } else {
                BatchResult::all_applied(rows.len())
            };
            for row in rows {
                self.log.lock().unwrap().push(format!(
                    "UPDATE {} {:?} expected={:?}",
                    meta.name,
                    row.values.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
                    row.expected_version
                ));
            }
            let stall = self.stall_updates.load(Ordering::SeqCst);
            async move {
                if stall {
                    std::future::pending::<()>().await;
                }
                Outcome::Ok(result)
            }
        }

        fn execute_delete_batch(
            &self,
            _cx: &Cx,
            meta: &EntityMetadata,
            rows: &[DeleteRow],
        ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
            self.log
                .lock()
                .unwrap()
                .push(format!("DELETE {} x{}", meta.name, rows.len()));
            let result = BatchResult::all_applied(rows.len());
            async move { Outcome::Ok(result) }
        }
    }

    struct BookLoader;

    impl RelationLoader for BookLoader {
        fn load_relation(
            &self,
            _cx: &Cx,
            _owner: &EntityMetadata,
            owner_key: &[Value],
            _property: &EntityProperty,
        ) -> impl Future<Output = Outcome<Vec<EntityData>, Error>> + Send {
            let owner = owner_key.to_vec();
            let rows = vec![
                EntityData::new("Book", vec![Value::BigInt(10)])
                    .field("title", "Dune")
                    .reference("author", Some(owner.clone())),
                EntityData::new("Book", vec![Value::BigInt(11)])
                    .field("title", "Emma")
                    .reference("author", Some(owner)),
            ];
            async move { Outcome::Ok(rows) }
        }
    }

    fn uow() -> UnitOfWork<RecordingPersister> {
        UnitOfWork::new(registry(), RecordingPersister::default())
    }

    fn loaded_author(uow: &mut UnitOfWork<RecordingPersister>) -> EntityRef {
        uow.merge(
            "Author",
            &[Value::BigInt(1)],
            vec![
                ("name", FieldData::Value(Value::Text("Ann".to_string()))),
                ("version", FieldData::Value(Value::Int(1))),
                ("books", FieldData::Unloaded),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = UnitOfWorkConfig::default();
        assert_eq!(config.batch_size, 300);
        assert!(config.track_changes);
        assert!(!config.persist_on_create);

        let config = UnitOfWorkConfig::new()
            .batch_size(10)
            .track_changes(false)
            .persist_on_create(true);
        assert_eq!(config.batch_size, 10);
        assert!(!config.track_changes);
        assert!(config.persist_on_create);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();

        rt.block_on(async {
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report, FlushReport::default());
            assert_eq!(uow.state(), FlushState::Idle);
            assert!(uow.persister().log().is_empty());
        });
    }

    #[test]
    fn test_persist_cascades_and_assigns_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();

        let author = uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        let book = uow
            .create(
                Entity::new("Book")
                    .with("title", "Dune")
                    .with_reference("author", Some(author.id())),
            )
            .unwrap();
        uow.persist(&book).unwrap();
        assert_eq!(uow.pending_counts().new, 1);

        rt.block_on(async {
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.inserted, 2);
            assert_eq!(report.batches.len(), 2);
            assert_eq!(
                uow.persister().log(),
                vec!["INSERT Author x1".to_string(), "INSERT Book x1".to_string()]
            );

            assert_eq!(author.get("id"), Some(Value::BigInt(1)));
            assert_eq!(author.get("version"), Some(Value::Int(1)));
            let found = uow.find("Book", &[Value::BigInt(1)]).unwrap().unwrap();
            assert!(EntityRef::ptr_eq(&found, &book));

            // Nothing changed since: the second flush writes nothing.
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.total(), 0);
            assert!(uow.pending_counts().is_empty());
        });
    }

    #[test]
    fn test_tracked_update_bumps_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);

        assert!(!uow.is_dirty(&author).unwrap());
        author.set("name", "Anna");
        assert!(uow.is_dirty(&author).unwrap());
        assert_eq!(uow.pending_counts().dirty, 1);

        rt.block_on(async {
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.updated, 1);
            assert_eq!(
                uow.persister().log(),
                vec![r#"UPDATE Author ["name", "version"] expected=Some(Int(1))"#.to_string()]
            );
            assert_eq!(author.get("version"), Some(Value::Int(2)));
            assert!(!uow.is_dirty(&author).unwrap());
        });
    }

    #[test]
    fn test_untracked_changes_need_explicit_persist() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = UnitOfWork::with_config(
            registry(),
            RecordingPersister::default(),
            UnitOfWorkConfig::new().track_changes(false),
        );
        let author = loaded_author(&mut uow);
        author.set("name", "Anna");

        rt.block_on(async {
            assert_eq!(unwrap_outcome(uow.flush(&cx).await).total(), 0);
            uow.persist(&author).unwrap();
            assert_eq!(unwrap_outcome(uow.flush(&cx).await).updated, 1);
        });
    }

    #[test]
    fn test_remove_deletes_and_detaches() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);
        uow.remove_by_key("Author", &[Value::BigInt(1)]).unwrap();
        assert_eq!(uow.pending_counts().deleted, 1);

        rt.block_on(async {
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.deleted, 1);
            assert!(uow.get(author.id()).is_none());
            assert!(uow.find("Author", &[Value::BigInt(1)]).unwrap().is_none());
        });
    }

    #[test]
    fn test_removing_new_entity_writes_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        uow.persist(&author).unwrap();
        uow.remove(&author).unwrap();

        rt.block_on(async {
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.total(), 0);
            assert!(uow.persister().log().is_empty());
            assert!(uow.get(author.id()).is_none());
        });
    }

    #[test]
    fn test_dangling_reference_aborts_before_io() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);
        // The collection still points at the detached book.
        let stray = uow
            .create(
                Entity::new("Book")
                    .with("title", "Stray")
                    .with_reference("author", Some(author.id())),
            )
            .unwrap();
        author.set_collection("books", vec![stray.id()]);
        uow.detach(&stray);

        rt.block_on(async {
            let err = expect_err(uow.flush(&cx).await);
            assert!(matches!(err, Error::NotFound(_)));
            assert_eq!(uow.state(), FlushState::Idle);
            assert!(uow.persister().log().is_empty());
        });
    }

    #[test]
    fn test_version_mismatch_fails_then_retry_succeeds() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);
        let failures = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&failures);
        uow.on_flush_failed(move || {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        author.set("name", "Anna");
        uow.persister().reject_updates.store(true, Ordering::SeqCst);

        rt.block_on(async {
            let err = expect_err(uow.flush(&cx).await);
            assert!(matches!(err, Error::Concurrency(ref c) if c.entities == vec![author.id()]));
            assert!(!err.is_retryable());
            assert_eq!(uow.state(), FlushState::Failed);
            assert_eq!(*failures.lock().unwrap(), 1);

            let failure = uow.last_failure().unwrap();
            assert_eq!(failure.failed.operation, Operation::Update);
            assert_eq!(failure.failed.applied, 0);
            assert_eq!(failure.failed_entities, vec![author.id()]);
            let json = serde_json::to_value(failure).unwrap();
            assert_eq!(json["failed"]["entity_type"], "Author");
            assert_eq!(json["failed"]["operation"], "Update");
            assert!(json["remaining"].as_array().unwrap().is_empty());

            let err = expect_err(uow.flush(&cx).await);
            assert!(matches!(err, Error::State(ref s) if s.kind == StateErrorKind::FlushFailed));

            uow.persister().reject_updates.store(false, Ordering::SeqCst);
            let report = unwrap_outcome(uow.retry(&cx).await);
            assert_eq!(report.updated, 1);
            assert_eq!(uow.state(), FlushState::Idle);
            assert!(uow.last_failure().is_none());
        });
    }

    #[test]
    fn test_cancellation_before_io_keeps_pending_work() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let mut uow = uow();
        let author = uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        uow.persist(&author).unwrap();

        let cancelled = Cx::for_testing();
        cancelled.cancel_with(CancelKind::User, Some("shutting down"));
        rt.block_on(async {
            match uow.flush(&cancelled).await {
                Outcome::Cancelled(reason) => assert_eq!(reason.kind, CancelKind::User),
                other => std::panic::panic_any(format!("expected cancellation, got: {other:?}")),
            }
        });
        assert_eq!(uow.state(), FlushState::Idle);
        assert!(uow.persister().log().is_empty());
        assert_eq!(uow.pending_counts().new, 1);

        let cx = Cx::for_testing();
        rt.block_on(async {
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.inserted, 1);
        });
        assert_eq!(uow.persister().log(), vec!["INSERT Author x1".to_string()]);
    }

    #[test]
    fn test_abandoned_flush_is_rejected_until_reset() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);
        author.set("name", "Anna");
        uow.persister().stall_updates.store(true, Ordering::SeqCst);

        {
            let mut flush = std::pin::pin!(uow.flush(&cx));
            let mut task = std::task::Context::from_waker(std::task::Waker::noop());
            assert!(flush.as_mut().poll(&mut task).is_pending());
        }
        assert_eq!(uow.state(), FlushState::Committing);
        uow.persister().stall_updates.store(false, Ordering::SeqCst);

        rt.block_on(async {
            let err = expect_err(uow.flush(&cx).await);
            assert!(matches!(err, Error::State(ref s) if s.kind == StateErrorKind::FlushInProgress));
            let err = expect_err(uow.retry(&cx).await);
            assert!(matches!(err, Error::State(ref s) if s.kind == StateErrorKind::NothingToRetry));

            uow.reset();
            assert_eq!(uow.state(), FlushState::Idle);
            // The abandoned update never applied, so the edit is still pending.
            let report = unwrap_outcome(uow.flush(&cx).await);
            assert_eq!(report.updated, 1);
        });
        assert!(!uow.is_dirty(&author).unwrap());
    }

    #[test]
    fn test_retry_outside_failed_state_is_rejected() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        rt.block_on(async {
            let err = expect_err(uow.retry(&cx).await);
            assert!(matches!(err, Error::State(ref s) if s.kind == StateErrorKind::NothingToRetry));
        });
    }

    #[test]
    fn test_before_flush_error_aborts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        uow.persist(&author).unwrap();
        uow.on_before_flush(|| Err(Error::Custom("blocked".to_string())));

        rt.block_on(async {
            let err = expect_err(uow.flush(&cx).await);
            assert!(matches!(err, Error::Custom(_)));
            assert_eq!(uow.state(), FlushState::Idle);
            assert_eq!(uow.pending_counts().new, 1);
        });
    }

    #[test]
    fn test_flush_plan_preview_leaves_state_alone() {
        let mut uow = uow();
        let author = uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        uow.persist(&author).unwrap();

        let plan = uow.compute_flush_plan().unwrap();
        assert_eq!(plan.change_sets.len(), 1);
        let cs = plan.change_set(author.id()).unwrap();
        assert_eq!(cs.operation, Operation::Create);
        assert_eq!(plan.commit.len(), 1);
        assert_eq!(uow.state(), FlushState::Idle);
        assert_eq!(uow.pending_counts().new, 1);
    }

    #[test]
    fn test_reset_discards_pending_intent() {
        let mut uow = uow();
        let author = uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        uow.persist(&author).unwrap();
        uow.reset();
        assert!(uow.pending_counts().is_empty());
        assert!(uow.get(author.id()).is_some());

        uow.clear();
        assert!(uow.get(author.id()).is_none());
        assert!(uow.identity_map().is_empty());
    }

    #[test]
    fn test_persist_on_create() {
        let mut uow = UnitOfWork::with_config(
            registry(),
            RecordingPersister::default(),
            UnitOfWorkConfig::new().persist_on_create(true),
        );
        uow.create(Entity::new("Author").with("name", "Ann")).unwrap();
        assert_eq!(uow.pending_counts().new, 1);
    }

    #[test]
    fn test_fetch_relation_merges_without_dirtying() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);
        assert_eq!(author.collection("books"), None);

        rt.block_on(async {
            unwrap_outcome(uow.fetch_relation(&cx, &BookLoader, &author, "books").await);
        });

        let books = author.collection("books").unwrap();
        assert_eq!(books.len(), 2);
        let dune = uow.find("Book", &[Value::BigInt(10)]).unwrap().unwrap();
        assert_eq!(books[0], dune.id());
        assert_eq!(dune.reference("author"), Some(Some(author.id())));
        assert!(!uow.is_dirty(&author).unwrap());
        assert!(uow.compute_flush_plan().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_relation_rejects_scalars() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut uow = uow();
        let author = loaded_author(&mut uow);

        rt.block_on(async {
            let err = expect_err(uow.fetch_relation(&cx, &BookLoader, &author, "name").await);
            assert!(err.is_validation());
        });
    }
}
