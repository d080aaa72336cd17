//! Persistent key-value storage for repository snapshots.
//!
//! Each repository writes whole serialized blobs under keys derived from its
//! cache-key prefix (`<prefix>.cache`, `<prefix>.queue`, `<prefix>.sync`).
//! Stores are shared across repositories; every repository only touches its
//! own keys.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;

/// A durable, synchronous, string-keyed store.
pub trait KeyValueStore: Send + Sync {
    /// Load the blob stored under `key`, or `None` if nothing was saved.
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the blob stored under `key`.
    fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove the blob under `key`. Missing keys are not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}
