//! Task module - client-side model of backend download jobs.
//!
//! - `task`: the Task entry and its status/kind/progress types
//! - `snapshot`: the backend's wire representation and sequence derivation
//! - `registry`: pure in-memory store keyed by task id
//! - `reconcile`: the single writer that merges push, poll and local updates

pub mod task;
mod snapshot;
mod registry;
mod reconcile;

pub use task::{
    Sequence, Task, TaskError, TaskId, TaskKind, TaskProgress, TaskStatus, TaskUpdate,
    UpdateSource,
};
pub use snapshot::{TaskErrorNotice, TaskSnapshot};
pub use registry::TaskRegistry;
pub use reconcile::{reconcile, Applied, IgnoreReason, Reconciler, TaskChange, Verdict};
