//! Bounded in-memory cache tier.
//!
//! Holds decoded JSON values with per-entry TTL and a hard size bound.
//! Eviction is strictly insertion-ordered: when full, the oldest key goes,
//! and re-setting a key refreshes its value and timestamp without moving it
//! in the queue. Expired entries are dropped lazily on access.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct MemoryEntry {
    value: serde_json::Value,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    order: VecDeque<String>,
}

/// Insertion-ordered bounded cache of JSON values.
#[derive(Debug)]
pub struct MemoryCache {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<MemoryInner>,
}

impl MemoryCache {
    /// Create a cache holding at most `max_size` entries for up to `ttl`.
    ///
    /// A `max_size` of zero evicts every insert immediately; callers that
    /// want an unbounded tier should pick a large bound instead.
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Read a fresh entry, dropping it instead when its TTL has passed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let entry = inner.entries.get(key)?;
        if entry.inserted_at.elapsed() < self.ttl {
            return Some(entry.value.clone());
        }
        // Expired; drop it on the way out.
        inner.entries.remove(key);
        inner.order.retain(|queued| queued != key);
        None
    }

    /// Store `value` under `key`, returning the key evicted to make room.
    ///
    /// Re-setting an existing key refreshes its value and timestamp but
    /// keeps its place in the eviction queue.
    pub fn insert(&self, key: &str, value: serde_json::Value) -> Option<String> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let entry = MemoryEntry {
            value,
            inserted_at: Instant::now(),
        };
        if inner.entries.insert(key.to_string(), entry).is_some() {
            return None;
        }
        inner.order.push_back(key.to_string());
        if inner.order.len() > self.max_size
            && let Some(oldest) = inner.order.pop_front()
        {
            inner.entries.remove(&oldest);
            return Some(oldest);
        }
        None
    }

    /// Remove `key`, reporting whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|queued| queued != key);
            true
        } else {
            false
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut guard = self.lock_inner();
        guard.entries.clear();
        guard.order.clear();
    }

    /// Number of entries currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_inner().entries.is_empty()
    }

    fn lock_inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn cache(max_size: usize) -> MemoryCache {
        MemoryCache::new(max_size, Duration::from_secs(60))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = cache(4);
        assert!(cache.insert("iv:SPY", json!({"iv": 0.21})).is_none());

        assert_eq!(cache.get("iv:SPY"), Some(json!({"iv": 0.21})));
        assert!(cache.get("iv:QQQ").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oldest_key_evicted_at_capacity() {
        let cache = cache(2);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));

        let evicted = cache.insert("c", json!(3));

        assert_eq!(evicted.as_deref(), Some("a"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_refresh_keeps_queue_position() {
        let cache = cache(2);
        cache.insert("a", json!("stale"));
        cache.insert("b", json!(2));

        // Refresh does not move "a" to the back of the queue.
        assert!(cache.insert("a", json!("fresh")).is_none());
        assert_eq!(cache.get("a"), Some(json!("fresh")));

        let evicted = cache.insert("c", json!(3));
        assert_eq!(evicted.as_deref(), Some("a"));
    }

    #[test]
    fn test_expired_entry_dropped_on_access() {
        let cache = MemoryCache::new(4, Duration::from_millis(20));
        cache.insert("short", json!(true));
        assert!(cache.get("short").is_some());

        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.get("short").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache(4);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_removed_key_frees_queue_slot() {
        let cache = cache(2);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.remove("a");

        // "a" must not be the eviction victim after removal.
        assert!(cache.insert("c", json!(3)).is_none());
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn test_zero_capacity_evicts_immediately() {
        let cache = cache(0);
        let evicted = cache.insert("a", json!(1));
        assert_eq!(evicted.as_deref(), Some("a"));
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(keys in proptest::collection::vec("[a-e]", 1..100)) {
            let cache = MemoryCache::new(3, Duration::from_secs(60));
            for key in keys {
                cache.insert(&key, serde_json::Value::Bool(true));
                prop_assert!(cache.len() <= 3);
            }
        }
    }
}
