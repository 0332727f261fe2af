//! Unit of work for persistgraph.
//!
//! `persistgraph-session` is the **commit engine**. It keeps one in-memory
//! instance per stored row, works out what changed, and writes those changes
//! through a [`Persister`](persistgraph_core::Persister) in an order the
//! store's foreign keys accept.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one managed instance per (type, primary key).
//! - **Change tracking**: diffs against snapshots of the last persisted state.
//! - **Cascades**: persist/remove follow relations marked cascading.
//! - **Commit ordering**: a type-level dependency graph, with nullable foreign
//!   keys deferred to break cycles.
//!
//! # Design Philosophy
//!
//! - **Ids, not pointers**: relations hold [`EntityId`](persistgraph_core::EntityId)s.
//! - **Plan, then write**: every check runs before the first batch is sent.
//! - **Cancel-correct**: async operations use `Cx` + `Outcome`.

pub mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod unit_of_work;

pub use cascade::CascadeResolver;
pub use change_tracker::{ChangeSet, ChangeSetComputer, ChangeValue};
pub use flush::{BatchEntry, CommitBatch, CommitOrderScheduler, CommitPlan, DependencyEdge};
pub use identity_map::{EntityRef, IdentityKey, IdentityMap, ManagedEntity, Snapshot, key_values};
pub use unit_of_work::{
    BatchSummary, FlushEvent, FlushEventCallbacks, FlushFailure, FlushPlan, FlushReport,
    FlushState, PendingCounts, UnitOfWork, UnitOfWorkConfig,
};
