//! Ordered list of pending mutations awaiting transmission.
//!
//! The queue is FIFO at enqueue time. Items that fail transiently are pushed
//! back at the tail, so after a retry the order reflects transmission order
//! rather than request order. Several actions for the same id may be queued
//! at once; they are replayed in the order they are dequeued.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::KeyValueStore;

/// Key suffix for the queue snapshot
const QUEUE_KEY_SUFFIX: &str = "queue";

pub(crate) fn queue_key(prefix: &str) -> String {
    format!("{}.{}", prefix, QUEUE_KEY_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Update,
    Delete,
}

/// A queued mutation. `value` is present for updates and `None` for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionQueueItem<T> {
    pub kind: ActionKind,
    pub id: String,
    pub value: Option<T>,
    pub requested_at: DateTime<Utc>,
}

impl<T> ActionQueueItem<T> {
    pub fn update(id: impl Into<String>, value: T) -> Self {
        Self {
            kind: ActionKind::Update,
            id: id.into(),
            value: Some(value),
            requested_at: Utc::now(),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Delete,
            id: id.into(),
            value: None,
            requested_at: Utc::now(),
        }
    }
}

impl<T: Serialize> ActionQueueItem<T> {
    /// Type-erased copy used for wire payloads and notifications.
    pub fn to_value_item(&self) -> Result<ActionQueueItem<serde_json::Value>, serde_json::Error> {
        let value = match &self.value {
            Some(v) => Some(serde_json::to_value(v)?),
            None => None,
        };
        Ok(ActionQueueItem {
            kind: self.kind,
            id: self.id.clone(),
            value,
            requested_at: self.requested_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActionQueue<T> {
    items: VecDeque<ActionQueueItem<T>>,
}

impl<T> Default for ActionQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T: Serialize + DeserializeOwned> ActionQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the queue saved under `<prefix>.queue`, empty on absence or corruption.
    pub fn load(store: &dyn KeyValueStore, prefix: &str) -> Self {
        let key = queue_key(prefix);
        let contents = match store.load(&key) {
            Ok(Some(contents)) => contents,
            Ok(None) => return Self::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read action queue, starting empty");
                return Self::new();
            }
        };

        match serde_json::from_str::<VecDeque<ActionQueueItem<T>>>(&contents) {
            Ok(items) => {
                debug!(key = %key, pending = items.len(), "Action queue restored");
                Self { items }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt action queue, starting empty");
                Self::new()
            }
        }
    }

    /// Serialize the queue for storage with `in_flight` ahead of it.
    ///
    /// Actions that were dequeued but not yet settled belong at the head of
    /// the stored queue so a crash mid-flush replays them.
    pub fn snapshot_json(&self, in_flight: &VecDeque<ActionQueueItem<T>>) -> Result<String, serde_json::Error> {
        let items: Vec<&ActionQueueItem<T>> = in_flight.iter().chain(self.items.iter()).collect();
        serde_json::to_string(&items)
    }

    pub fn enqueue(&mut self, item: ActionQueueItem<T>) {
        self.items.push_back(item);
    }

    /// Remove and return at most `n` items from the head.
    pub fn dequeue_up_to(&mut self, n: usize) -> Vec<ActionQueueItem<T>> {
        let count = n.min(self.items.len());
        self.items.drain(..count).collect()
    }

    /// Put a transiently failed item back at the tail.
    pub fn requeue(&mut self, item: ActionQueueItem<T>) {
        self.items.push_back(item);
    }

    /// Return dequeued-but-unattempted items to the head, keeping their order.
    pub fn restore_front(&mut self, items: Vec<ActionQueueItem<T>>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionQueueItem<T>> {
        self.items.iter()
    }
}
