//! Generic key/value store consumed by the section cache.
//!
//! Any provider that can get, put with a TTL and forget strings satisfies
//! [`KeyValueStore`]. [`MemoryStore`] is the bundled in-process provider.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::kv";

pub trait KeyValueStore: Send + Sync {
    /// Fresh value for `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value`; `ttl` of `None` keeps it until evicted or forgotten.
    fn put(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Remove `key`. Returns whether anything was removed.
    fn forget(&self, key: &str) -> bool;

    /// Read-through memoization. `compute` runs only on a miss and without
    /// any store lock held, so it may call back into the store.
    fn remember<F>(&self, key: &str, ttl: Option<Duration>, compute: F) -> String
    where
        F: FnOnce() -> String,
        Self: Sized,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = compute();
        self.put(key, value.clone(), ttl);
        value
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: String, ttl: Option<Duration>) {
        (**self).put(key, value, ttl)
    }

    fn forget(&self, key: &str) -> bool {
        (**self).forget(key)
    }
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// In-memory LRU store with per-entry TTL.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, including ones that expired but were not read since.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let fresh = entries.get(key).map(|stored| stored.is_fresh(Instant::now()))?;
        if fresh {
            entries.get(key).map(|stored| stored.value.clone())
        } else {
            entries.pop(key);
            None
        }
    }

    fn put(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        rw_write(&self.entries, SOURCE, "put").put(key.to_string(), StoredValue { value, expires_at });
    }

    fn forget(&self, key: &str) -> bool {
        rw_write(&self.entries, SOURCE, "forget").pop(key).is_some()
    }
}
