//! Reconciliation of task updates.
//!
//! Two independent sources describe the same job: push events (fast, lossy
//! across disconnects) and poll responses (authoritative, slower). On top of
//! those the client itself proposes a pending entry on submission and an
//! optimistic `cancelled` after a cancel is acknowledged. All of them funnel
//! through [`reconcile`], and [`Reconciler`] is the only code that writes the
//! [`TaskRegistry`].
//!
//! Precedence:
//! 1. an unknown id is created from whatever arrives first
//! 2. a submission never overwrites an existing entry
//! 3. a local cancel only lands on a non-terminal entry and keeps its sequence
//! 4. otherwise `(sequence, authority)` must not go backwards, with
//!    poll > push > local at equal sequence
//! 5. push cannot move a terminal entry, except a terminal push replacing an
//!    optimistic local cancel

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::broadcast;

use super::registry::TaskRegistry;
use super::task::{
    Sequence, Task, TaskError, TaskId, TaskKind, TaskProgress, TaskStatus, TaskUpdate,
    UpdateSource,
};

const GENERIC_FAILURE: &str = "task failed without an error message";

/// Why an update was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Older than the stored state, or a push tying with a poll
    Stale,
    /// The entry is terminal and this source may not move it
    Terminal,
    /// A submission for an id that is already tracked
    AlreadyTracked,
    /// Local cancel for an id that is not tracked
    Unknown,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => write!(f, "stale"),
            Self::Terminal => write!(f, "terminal"),
            Self::AlreadyTracked => write!(f, "already tracked"),
            Self::Unknown => write!(f, "unknown task"),
        }
    }
}

/// Decision for one update against the current entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Ignore(IgnoreReason),
}

/// Decide whether `update` may replace `existing`.
pub fn reconcile(existing: Option<&Task>, update: &TaskUpdate) -> Verdict {
    let Some(current) = existing else {
        return Verdict::Accept;
    };

    match update.source {
        UpdateSource::Submission => Verdict::Ignore(IgnoreReason::AlreadyTracked),
        UpdateSource::LocalCancel => {
            if current.is_terminal() {
                Verdict::Ignore(IgnoreReason::Terminal)
            } else {
                Verdict::Accept
            }
        }
        UpdateSource::Push | UpdateSource::Poll => {
            let incoming = (update.sequence, update.source.authority());
            let stored = (current.last_updated, current.origin.authority());
            if incoming < stored {
                return Verdict::Ignore(IgnoreReason::Stale);
            }

            // The backend marks a job cancelled before acknowledging the
            // cancel, so a non-terminal report after the ack predates it.
            if current.origin == UpdateSource::LocalCancel && !update.status.is_terminal() {
                return Verdict::Ignore(IgnoreReason::Terminal);
            }

            if update.source == UpdateSource::Push && current.is_terminal() {
                let supersedes_optimistic_cancel =
                    current.origin == UpdateSource::LocalCancel && update.status.is_terminal();
                if !supersedes_optimistic_cancel {
                    return Verdict::Ignore(IgnoreReason::Terminal);
                }
            }

            Verdict::Accept
        }
    }
}

/// Build the entry that results from accepting `update`.
fn merge(existing: Option<&Task>, update: TaskUpdate) -> Task {
    let kind = match (update.kind, existing) {
        (Some(kind), _) if kind != TaskKind::Unknown => kind,
        (_, Some(task)) => task.kind,
        (kind, None) => kind.unwrap_or(TaskKind::Unknown),
    };

    let last_updated = match (update.source, existing) {
        (UpdateSource::LocalCancel, Some(task)) => task.last_updated,
        _ => update.sequence,
    };

    let progress = update
        .progress
        .or_else(|| existing.map(|t| t.progress.clone()))
        .unwrap_or_else(TaskProgress::default);

    let error = if update.status == TaskStatus::Failed {
        let message = update
            .error
            .filter(|m| !m.trim().is_empty())
            .or_else(|| existing.and_then(|t| t.error.as_ref().map(|e| e.message.clone())))
            .unwrap_or_else(|| GENERIC_FAILURE.to_string());
        Some(TaskError::new(message))
    } else {
        None
    };

    Task {
        id: update.id,
        kind,
        status: update.status,
        progress,
        last_updated,
        error,
        origin: update.source,
        observed_at: Utc::now(),
    }
}

/// Result of applying one update.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Created(Task),
    Updated { previous: TaskStatus, task: Task },
    Ignored(IgnoreReason),
}

impl Applied {
    /// The stored entry, if the update was accepted.
    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::Created(task) | Self::Updated { task, .. } => Some(task),
            Self::Ignored(_) => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Change notification for registry consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskChange {
    Upserted(Task),
    Removed(TaskId),
    Cleared,
}

/// Sole writer of the task registry.
///
/// Every mutation is a short synchronous critical section, so updates to the
/// same id are applied strictly one after another and listeners running on
/// the channel task can call straight into it.
pub struct Reconciler {
    registry: RwLock<TaskRegistry>,
    changes: broadcast::Sender<TaskChange>,
}

impl Reconciler {
    pub fn new(change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        Self {
            registry: RwLock::new(TaskRegistry::new()),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TaskRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TaskRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to every stored change.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.changes.subscribe()
    }

    /// Apply one update under the precedence rules.
    pub fn apply(&self, update: TaskUpdate) -> Applied {
        let applied = {
            let mut registry = self.write();
            let existing = registry.get(&update.id);

            match reconcile(existing, &update) {
                Verdict::Ignore(reason) => {
                    tracing::debug!(
                        task_id = %update.id,
                        source = ?update.source,
                        sequence = %update.sequence,
                        status = %update.status,
                        reason = %reason,
                        "Ignoring task update"
                    );
                    return Applied::Ignored(reason);
                }
                Verdict::Accept => {
                    let task = merge(existing, update);
                    match registry.upsert(task.clone()) {
                        Some(previous) => Applied::Updated {
                            previous: previous.status,
                            task,
                        },
                        None => Applied::Created(task),
                    }
                }
            }
        };

        match &applied {
            Applied::Created(task) => {
                tracing::debug!(task_id = %task.id, status = %task.status, origin = ?task.origin, "Tracking new task");
            }
            Applied::Updated { previous, task } if *previous != task.status => {
                tracing::info!(
                    task_id = %task.id,
                    from = %previous,
                    to = %task.status,
                    origin = ?task.origin,
                    "Task status changed"
                );
            }
            _ => {}
        }

        if let Some(task) = applied.task() {
            let _ = self.changes.send(TaskChange::Upserted(task.clone()));
        }
        applied
    }

    /// Apply updates in order.
    pub fn apply_all(&self, updates: impl IntoIterator<Item = TaskUpdate>) -> Vec<Applied> {
        updates.into_iter().map(|u| self.apply(u)).collect()
    }

    /// Track a freshly submitted job as pending.
    pub fn register_submitted(&self, id: TaskId, kind: TaskKind) -> Applied {
        let update = TaskUpdate::new(
            id,
            TaskStatus::Pending,
            Sequence::ZERO,
            UpdateSource::Submission,
        )
        .with_kind(kind);
        self.apply(update)
    }

    /// Optimistically mark a job cancelled after the backend acknowledged the
    /// cancel request. Later push/poll reports for the job still apply.
    pub fn cancel_locally(&self, id: &TaskId) -> Applied {
        if self.read().get(id).is_none() {
            return Applied::Ignored(IgnoreReason::Unknown);
        }
        let update = TaskUpdate::new(
            id.clone(),
            TaskStatus::Cancelled,
            Sequence::ZERO,
            UpdateSource::LocalCancel,
        );
        self.apply(update)
    }

    /// Drop every cancelled entry. Other statuses are untouched.
    pub fn clear_cancelled(&self) -> Vec<TaskId> {
        let removed: Vec<TaskId> = self
            .write()
            .remove_cancelled()
            .into_iter()
            .map(|t| t.id)
            .collect();
        for id in &removed {
            let _ = self.changes.send(TaskChange::Removed(id.clone()));
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Cleared cancelled tasks");
        }
        removed
    }

    /// Forget everything; used on teardown.
    pub fn reset(&self) {
        self.write().clear();
        let _ = self.changes.send(TaskChange::Cleared);
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        self.read().list()
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.read().list_by_status(status)
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.read().active_ids()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(256)
    }
}
