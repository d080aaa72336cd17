//! Public CRUD contract over a local cache and a queue of pending actions.
//!
//! Every operation returns immediately with locally consistent results.
//! Remote consistency is eventual and best-effort: the background sync
//! engine delivers queued actions and reports failures on the notifier.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::config::SyncSettings;
use crate::error::{StoreError, SyncError};
use crate::notify::Notifier;
use crate::queue::ActionQueueItem;
use crate::remote::RemoteService;
use crate::store::KeyValueStore;
use crate::sync::task::SyncTask;
use crate::sync::{EngineState, SyncEngine, TickReport};

/// A domain value stored in a repository.
///
/// Ids are strings assigned by the repository on [`Repository::create`].
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
}

/// Untyped JSON objects carry their id in an `"id"` field.
impl Entity for Value {
    fn id(&self) -> &str {
        self.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    fn set_id(&mut self, id: String) {
        if let Value::Object(map) = self {
            map.insert("id".to_string(), Value::String(id));
        }
    }
}

pub struct Repository<T: Entity> {
    engine: Arc<SyncEngine<T>>,
    task: Mutex<Option<SyncTask>>,
}

impl<T: Entity> Repository<T> {
    pub fn new(
        endpoint: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteService>,
        notifier: Notifier,
        settings: SyncSettings,
    ) -> Self {
        Self {
            engine: Arc::new(SyncEngine::new(endpoint, store, remote, notifier, settings)),
            task: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.engine.endpoint()
    }

    pub fn find_by_id(&self, id: &str) -> Option<T> {
        self.engine.state().cache.find_by_id(id).cloned()
    }

    /// Cached value together with the time it was stored locally.
    pub fn find_entry(&self, id: &str) -> Option<CacheEntry<T>> {
        self.engine.state().cache.entry(id).cloned()
    }

    /// Snapshot of all cached values, in unspecified order.
    pub fn find_all(&self) -> Vec<T> {
        self.engine.state().cache.find_all()
    }

    /// Snapshot of all cache entries with their storage times.
    pub fn entries(&self) -> Vec<CacheEntry<T>> {
        self.engine.state().cache.entries().cloned().collect()
    }

    /// Assign a fresh id to `value` and store it as an update.
    pub fn create(&self, value: T) -> T {
        let id = Uuid::new_v4().to_string();
        debug!(endpoint = %self.endpoint(), id = %id, "Creating entity");
        self.update(&id, value)
    }

    /// Store `value` under `id`, overwriting the value's own id.
    pub fn update(&self, id: &str, mut value: T) -> T {
        value.set_id(id.to_string());
        let mut state = self.engine.state();
        state.cache.put(id, value.clone());
        state
            .queue
            .enqueue(ActionQueueItem::update(id, value.clone()));
        value
    }

    pub fn delete(&self, id: &str) {
        let mut state = self.engine.state();
        state.cache.remove(id);
        state.queue.enqueue(ActionQueueItem::delete(id));
    }

    /// Number of actions not yet accepted by the remote.
    pub fn pending_actions(&self) -> usize {
        self.engine.pending()
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.engine_state()
    }

    /// Run one sync cycle now instead of waiting for the timer.
    pub async fn flush_now(&self) -> TickReport {
        self.engine.tick().await
    }

    /// Clear a latched engine. Returns whether it was latched.
    pub fn reset_sync(&self) -> bool {
        self.engine.reset()
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        self.engine.persist()
    }

    pub fn is_syncing(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the background sync timer. Requires a tokio runtime.
    pub fn start_sync(&self) -> Result<(), SyncError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(SyncError::AlreadyRunning(self.endpoint().to_string()));
        }
        let period = self.engine.settings().interval();
        *task = Some(SyncTask::spawn(self.engine.clone(), period)?);
        info!(endpoint = %self.endpoint(), "Background sync started");
        Ok(())
    }

    /// Stop the background timer, if any, and persist the current state.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.shutdown().await;
        }
        self.engine.persist()
    }
}
