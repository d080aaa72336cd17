use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::KeyValueStore;

/// Key suffix for the cache snapshot
const CACHE_KEY_SUFFIX: &str = "cache";

pub(crate) fn cache_key(prefix: &str) -> String {
    format!("{}.{}", prefix, CACHE_KEY_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub id: String,
    pub value: T,
    pub storage_time: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(id: String, value: T) -> Self {
        Self {
            id,
            value,
            storage_time: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.storage_time).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

/// Mapping of entity id to the latest locally known value.
#[derive(Debug, Clone)]
pub struct LocalCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
}

impl<T> Default for LocalCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone + Serialize + DeserializeOwned> LocalCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the snapshot saved under `<prefix>.cache`.
    ///
    /// Absent, unreadable or malformed snapshots yield an empty cache.
    pub fn load(store: &dyn KeyValueStore, prefix: &str) -> Self {
        let key = cache_key(prefix);
        let contents = match store.load(&key) {
            Ok(Some(contents)) => contents,
            Ok(None) => return Self::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache snapshot, starting empty");
                return Self::new();
            }
        };

        match Self::from_json(&contents) {
            Ok(cache) => {
                debug!(key = %key, entries = cache.len(), "Cache snapshot restored");
                cache
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt cache snapshot, starting empty");
                Self::new()
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.entries)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: HashMap<String, CacheEntry<T>> = serde_json::from_str(json)?;
        Ok(Self { entries })
    }

    pub fn find_by_id(&self, id: &str) -> Option<&T> {
        self.entries.get(id).map(|entry| &entry.value)
    }

    pub fn entry(&self, id: &str) -> Option<&CacheEntry<T>> {
        self.entries.get(id)
    }

    /// Snapshot of all values, in unspecified order.
    pub fn find_all(&self) -> Vec<T> {
        self.entries.values().map(|entry| entry.value.clone()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry<T>> {
        self.entries.values()
    }

    pub fn put(&mut self, id: &str, value: T) {
        self.entries
            .insert(id.to_string(), CacheEntry::new(id.to_string(), value));
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
