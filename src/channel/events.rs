//! Typed push events and their per-kind listener lists.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::task::{TaskErrorNotice, TaskSnapshot};

/// Something that happened on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The Socket.IO session is up. Subscriptions have been re-sent.
    Connected,
    /// A connected session ended.
    Disconnected { reason: String },
    TaskProgress(TaskSnapshot),
    TaskError(TaskErrorNotice),
    /// Server greeting (`connected` event) or an acknowledgement packet.
    ServerAck(Value),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::TaskProgress(_) => EventKind::TaskProgress,
            Self::TaskError(_) => EventKind::TaskError,
            Self::ServerAck(_) => EventKind::ServerAck,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    TaskProgress,
    TaskError,
    ServerAck,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::TaskProgress => "task_progress",
            Self::TaskError => "task_error",
            Self::ServerAck => "server_ack",
        };
        f.write_str(name)
    }
}

/// Handle returned by [`EventBus::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync>;

/// Ordered listener lists keyed by event kind.
///
/// Dispatch is synchronous. Each emit works on a snapshot of the list, so a
/// listener may register or remove listeners without deadlocking.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Run every listener for the event's kind, in registration order.
    pub fn emit(&self, event: &ChannelEvent) {
        let kind = event.kind();
        let snapshot: Vec<(ListenerId, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(event = %kind, listener = ?id, "Event listener failed: {:#}", e);
                }
                Err(_) => {
                    tracing::error!(event = %kind, listener = ?id, "Event listener panicked");
                }
            }
        }
    }
}
