//! Offline-tolerant client-side data layer.
//!
//! A [`Repository`] answers reads and applies writes instantly against a
//! local cache while every mutation is appended to a durable action queue.
//! A background [`SyncEngine`](sync::SyncEngine) persists the cache and
//! drains the queue to the remote service on a fixed timer, requeuing
//! transient failures, dropping rejected actions with a notification, and
//! latching after too many errors in a single pass.
//!
//! Repositories are obtained from a [`Registry`], which memoizes one
//! instance per remote endpoint for the lifetime of the registry.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod repository;
pub mod store;
pub mod sync;

pub use cache::{CacheEntry, LocalCache};
pub use config::{Config, SyncSettings};
pub use error::{RegistryError, RemoteError, StoreError, SyncError};
pub use notify::{EventCode, Notifier, SyncEvent};
pub use queue::{ActionKind, ActionQueue, ActionQueueItem};
pub use registry::{Registry, RegistrySettings};
pub use remote::{HttpRemote, Outcome, RemoteResponse, RemoteService};
pub use repository::{Entity, Repository};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{EngineState, TickReport};
