//! Backend wire representation of a task.
//!
//! The same shape arrives from `GET /tasks`, `GET /tasks/{id}` and the
//! `task_progress` push event; only the poll responses carry timestamps and
//! `result`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::{Sequence, TaskId, TaskKind, TaskProgress, TaskStatus, TaskUpdate, UpdateSource};

const ITEMS_MASK: u64 = (1 << 24) - 1;

/// Task state as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    #[serde(default = "unknown_kind")]
    pub task_type: TaskKind,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    /// Explicit update counter, if the backend provides one.
    #[serde(default, alias = "sequence", skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Explicit update time in seconds, if the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<f64>,
}

fn unknown_kind() -> TaskKind {
    TaskKind::Unknown
}

impl TaskSnapshot {
    /// Minimal snapshot, mostly useful for building fixtures.
    pub fn new(task_id: impl Into<TaskId>, task_type: TaskKind, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            status,
            progress: 0.0,
            total_items: 0,
            processed_items: 0,
            error_message: None,
            metadata: Value::Null,
            result: Value::Null,
            created_at: None,
            started_at: None,
            completed_at: None,
            seq: None,
            last_updated: None,
        }
    }

    /// Ordering key for this snapshot.
    ///
    /// An explicit `seq` wins, then `last_updated` (microseconds). Without
    /// either, the key is a progress ordinal: status rank in the top byte,
    /// processed item count below it, progress in basis points at the bottom.
    pub fn sequence(&self) -> Sequence {
        if let Some(seq) = self.seq {
            return Sequence(seq);
        }
        if let Some(ts) = self.last_updated.filter(|t| t.is_finite() && *t >= 0.0) {
            return Sequence((ts * 1_000_000.0) as u64);
        }
        let rank = u64::from(self.status.rank());
        let items = self.processed_items.min(ITEMS_MASK);
        let basis_points = (super::task::clamp_percent(self.progress) * 100.0).round() as u64;
        Sequence((rank << 56) | (items << 32) | basis_points)
    }

    /// Metadata and result folded into one opaque value.
    fn detail(&self) -> Value {
        let mut detail = Map::new();
        if !self.metadata.is_null() {
            detail.insert("metadata".to_string(), self.metadata.clone());
        }
        if !self.result.is_null() {
            detail.insert("result".to_string(), self.result.clone());
        }
        if detail.is_empty() {
            Value::Null
        } else {
            Value::Object(detail)
        }
    }

    /// Turn this snapshot into a proposed update from `source`.
    pub fn into_update(self, source: UpdateSource) -> TaskUpdate {
        let sequence = self.sequence();
        let progress = TaskProgress::new(self.progress, self.processed_items, self.total_items)
            .with_detail(self.detail());
        TaskUpdate {
            id: self.task_id,
            kind: Some(self.task_type),
            status: self.status,
            progress: Some(progress),
            error: self.error_message,
            sequence,
            source,
        }
    }
}

/// Payload of a `task_error` push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorNotice {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}
