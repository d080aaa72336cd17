//! In-memory entity cache mirrored to the persistent store.
//!
//! The cache is the read path of a repository: lookups never block and
//! never touch the network. The whole map is written to the store as one
//! JSON blob under `<prefix>.cache` on every sync tick.

pub mod local;

pub use local::{CacheEntry, LocalCache};
