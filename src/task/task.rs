//! Task entry and the value types it is built from.
//!
//! Invariants:
//! - `Task::id` never changes once the entry exists
//! - `Task::error` is `Some` only while `status == Failed`
//! - `Task::last_updated` never decreases for a given entry

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque backend-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a job downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "music_download")]
    SingleTrack,
    #[serde(rename = "playlist_download")]
    PlaylistBatch,
    #[serde(rename = "artist_download")]
    ArtistBatch,
    /// The backend reported a job type this client does not know.
    #[serde(other)]
    Unknown,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleTrack => "music_download",
            Self::PlaylistBatch => "playlist_download",
            Self::ArtistBatch => "artist_download",
            Self::Unknown => "unknown",
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled accept no further forward transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position along pending -> running -> terminal.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Ordering key for updates to one task. Larger is newer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an update came from. Ordered by authority at equal sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// Entry created from a submission response
    Submission,
    /// Optimistic status set after a cancel was acknowledged
    LocalCancel,
    /// `task_progress` frame from the push channel
    Push,
    /// `GET /tasks` or `GET /tasks/{id}` response
    Poll,
}

impl UpdateSource {
    pub(crate) fn authority(&self) -> u8 {
        match self {
            Self::Submission | Self::LocalCancel => 0,
            Self::Push => 1,
            Self::Poll => 2,
        }
    }
}

/// Progress payload. Stored last-write-wins, never interpreted further.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Percentage in `0.0..=100.0`
    pub percent: f64,
    pub processed_items: u64,
    pub total_items: u64,
    /// Backend metadata and result, as sent
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl TaskProgress {
    pub fn new(percent: f64, processed_items: u64, total_items: u64) -> Self {
        Self {
            percent: clamp_percent(percent),
            processed_items,
            total_items,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

pub(crate) fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Backend-acknowledged job failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One tracked job, as last reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub last_updated: Sequence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub origin: UpdateSource,
    pub observed_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Equality over everything the backend owns; ignores `observed_at`.
    pub fn same_state(&self, other: &Task) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.status == other.status
            && self.progress == other.progress
            && self.last_updated == other.last_updated
            && self.error == other.error
    }
}

/// A proposed change to one task. Only the reconciler turns these into state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub id: TaskId,
    pub kind: Option<TaskKind>,
    pub status: TaskStatus,
    pub progress: Option<TaskProgress>,
    pub error: Option<String>,
    pub sequence: Sequence,
    pub source: UpdateSource,
}

impl TaskUpdate {
    pub fn new(
        id: impl Into<TaskId>,
        status: TaskStatus,
        sequence: Sequence,
        source: UpdateSource,
    ) -> Self {
        Self {
            id: id.into(),
            kind: None,
            status,
            progress: None,
            error: None,
            sequence,
            source,
        }
    }

    pub fn push(id: impl Into<TaskId>, status: TaskStatus, sequence: u64) -> Self {
        Self::new(id, status, Sequence(sequence), UpdateSource::Push)
    }

    pub fn poll(id: impl Into<TaskId>, status: TaskStatus, sequence: u64) -> Self {
        Self::new(id, status, Sequence(sequence), UpdateSource::Poll)
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_progress(mut self, progress: TaskProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}
