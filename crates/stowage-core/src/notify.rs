//! Notification channel for sync events.
//!
//! A single [`Notifier`] is shared by every repository of a registry so a UI
//! layer can observe all endpoints through one subscription.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::queue::ActionQueueItem;

/// Buffer size for the event channel.
/// Slow subscribers past this many events see a lag error rather than blocking sync.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCode {
    SyncFailed,
    SyncHalted,
    SyncResumed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEvent {
    /// The remote rejected an action; it has been dropped from the queue.
    SyncFailed {
        endpoint: String,
        message: String,
        action: ActionQueueItem<Value>,
        reason: String,
    },
    /// Too many errors in one pass; remote traffic is halted.
    SyncHalted { endpoint: String, errors: u32 },
    /// Remote traffic resumed after a successful probe or a manual reset.
    SyncResumed { endpoint: String },
}

impl SyncEvent {
    pub fn code(&self) -> EventCode {
        match self {
            SyncEvent::SyncFailed { .. } => EventCode::SyncFailed,
            SyncEvent::SyncHalted { .. } => EventCode::SyncHalted,
            SyncEvent::SyncResumed { .. } => EventCode::SyncResumed,
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            SyncEvent::SyncFailed { endpoint, .. }
            | SyncEvent::SyncHalted { endpoint, .. }
            | SyncEvent::SyncResumed { endpoint } => endpoint,
        }
    }
}

/// Cheap to clone; clones publish on the same channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(code = ?e.0.code(), "No subscribers for sync event");
        }
    }
}
