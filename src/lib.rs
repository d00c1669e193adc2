//! # musicdl-tasks
//!
//! Client-side task tracking for a music download backend.
//!
//! This library provides:
//! - A typed HTTP client for job submission, task queries and cancellation
//! - A Socket.IO push channel with automatic reconnect
//! - A reconciler that merges push and poll reports into one task registry
//!
//! ## Architecture
//!
//! ```text
//!   submit / cancel / poll            task_progress / task_error
//!          │                                    │
//!          ▼                                    ▼
//!   ┌─────────────┐                    ┌─────────────────┐
//!   │  ApiClient  │                    │  EventChannel   │
//!   │   (HTTP)    │                    │  (Socket.IO)    │
//!   └──────┬──────┘                    └────────┬────────┘
//!          │ Poll / Submission / LocalCancel    │ Push
//!          └───────────────┐     ┌──────────────┘
//!                          ▼     ▼
//!                   ┌─────────────────┐
//!                   │   Reconciler    │──▶ TaskChange broadcast
//!                   │ (TaskRegistry)  │
//!                   └─────────────────┘
//! ```
//!
//! ## Update Flow
//! 1. Submit a job; the task is registered as pending and subscribed
//! 2. Push progress updates it as the backend works
//! 3. On every (re)connect the full task list is polled
//! 4. Stale or out-of-order reports are dropped by the reconciler
//!
//! ## Modules
//! - `api`: HTTP client and request/response types
//! - `channel`: push channel, frame codec and listener dispatch
//! - `task`: task model, registry and reconciliation
//! - `tracker`: composition of the above

pub mod api;
pub mod channel;
pub mod config;
pub mod task;
pub mod tracker;

pub use api::{ApiClient, ApiError};
pub use channel::{ChannelEvent, ChannelState, EventChannel, EventKind};
pub use config::{ClientConfig, ReconnectPolicy};
pub use task::{Task, TaskChange, TaskId, TaskKind, TaskStatus};
pub use tracker::{TaskTracker, TrackerError};
