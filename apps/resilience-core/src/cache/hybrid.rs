//! Two-tier read-through cache.
//!
//! Reads check the bounded in-memory tier first, then the durable
//! key/value table, promoting durable hits back into memory. Writes go
//! through both tiers. The durable tier carries its own longer TTL and
//! survives process restarts, which is what makes warm-up after a redeploy
//! cheap: the first read of each key lands in the database instead of a
//! provider call.
//!
//! Damage in the durable tier (unreadable rows, bytes that no longer
//! decode) is treated as a miss: the entry is dropped, a warning is
//! logged, and the caller re-fetches from source.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::metrics::{
    record_cache_eviction, record_cache_hit, record_cache_miss, record_cache_sweep,
};
use crate::storage::{KvStore, StorageError, TursoPool};

use super::memory::MemoryCache;

/// Hybrid cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry bound for the in-memory tier.
    pub max_l1_size: usize,
    /// Lifetime of in-memory entries.
    pub l1_ttl: Duration,
    /// Lifetime of durable entries; whole seconds, matching the stored
    /// timestamps.
    pub l2_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_l1_size: 1024,
            l1_ttl: Duration::from_secs(60),
            l2_ttl: Duration::from_secs(86_400),
        }
    }
}

impl CacheConfig {
    /// Reject values that would disable one of the tiers.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_l1_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_l1_size must be at least 1".to_string(),
            ));
        }
        if self.l1_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "l1_ttl must be non-zero".to_string(),
            ));
        }
        if self.l2_ttl.as_secs() == 0 {
            return Err(CacheError::InvalidConfig(
                "l2_ttl must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hybrid cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Configuration rejected at construction.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    /// The value could not be serialized; nothing was written.
    #[error("failed to serialize cache value: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The durable tier failed in a way the cache cannot paper over.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Point-in-time view of cache occupancy and hit rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries in the in-memory tier.
    pub l1_count: usize,
    /// Rows in the durable tier, including not-yet-swept expired ones.
    pub l2_count: u64,
    /// Configured in-memory bound.
    pub max_l1_size: usize,
    /// Reads served from memory.
    pub l1_hits: u64,
    /// Reads served from the durable tier.
    pub l2_hits: u64,
    /// Reads served from neither tier.
    pub misses: u64,
}

/// Bounded in-memory tier over a durable key/value tier.
#[derive(Debug)]
pub struct HybridCache {
    memory: MemoryCache,
    store: KvStore,
    config: CacheConfig,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
}

impl HybridCache {
    /// Create a cache over `pool`, applying the durable schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] for an unusable configuration,
    /// or [`CacheError::Storage`] when the schema cannot be applied.
    pub async fn new(pool: Arc<TursoPool>, config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let store = KvStore::new(pool).await?;
        Ok(Self {
            memory: MemoryCache::new(config.max_l1_size, config.l1_ttl),
            store,
            config,
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Read `key`, checking memory first and falling back to the durable
    /// tier, promoting a durable hit back into memory.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] when the durable tier fails outright.
    /// Expired, unreadable, or wrongly-shaped entries are not errors; they
    /// are dropped and reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        if let Some(value) = self.memory.get(key) {
            match serde_json::from_value::<T>(value) {
                Ok(decoded) => {
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    record_cache_hit("l1");
                    return Ok(Some(decoded));
                }
                Err(error) => {
                    tracing::warn!(key, error = %error, "Dropping undecodable in-memory cache entry");
                    self.memory.remove(key);
                }
            }
        }

        let entry = match self.store.fetch(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.note_miss();
                return Ok(None);
            }
            Err(StorageError::Corrupt { .. }) => {
                tracing::warn!(key, "Corrupt cache entry in durable tier, treating as miss");
                self.discard(key).await;
                self.note_miss();
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        if self.is_expired(entry.timestamp, Utc::now().timestamp()) {
            self.discard(key).await;
            self.note_miss();
            return Ok(None);
        }

        let value = match serde_json::from_slice::<serde_json::Value>(&entry.value) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key, error = %error, "Dropping undecodable persisted cache entry");
                self.discard(key).await;
                self.note_miss();
                return Ok(None);
            }
        };
        match serde_json::from_value::<T>(value.clone()) {
            Ok(decoded) => {
                self.promote(key, value);
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                record_cache_hit("l2");
                Ok(Some(decoded))
            }
            Err(error) => {
                tracing::warn!(key, error = %error, "Persisted cache entry does not match requested type");
                self.discard(key).await;
                self.note_miss();
                Ok(None)
            }
        }
    }

    /// Write `value` through both tiers.
    ///
    /// A durable-tier failure degrades to memory-only service with a
    /// warning; the research pipeline keeps moving on a broken disk.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialize`] when the value cannot be encoded;
    /// nothing is written in that case.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let json = serde_json::to_value(value)?;
        let bytes = serde_json::to_vec(&json)?;

        self.promote(key, json);
        let timestamp = Utc::now().timestamp();
        if let Err(error) = self.store.upsert(key, &bytes, timestamp).await {
            tracing::warn!(key, error = %error, "Failed to persist cache entry, serving from memory only");
        }
        Ok(())
    }

    /// Remove `key` from both tiers, reporting whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] when the durable delete fails; the
    /// entry may still exist in that case.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        // Durable tier first so a concurrent read cannot re-promote the row
        // into memory behind our back.
        let removed_durable = self.store.delete(key).await? > 0;
        let removed_memory = self.memory.remove(key);
        Ok(removed_durable || removed_memory)
    }

    /// Drop every entry in both tiers, reporting the durable rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] when the durable clear fails.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        let removed = self.store.clear().await?;
        self.memory.clear();
        tracing::info!(removed, "Cache cleared");
        Ok(removed)
    }

    /// Sweep durable rows older than the durable TTL, reporting the count.
    ///
    /// Run this periodically; reads already ignore expired rows, the sweep
    /// just reclaims the space.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] when the sweep fails.
    pub async fn cleanup_expired(&self) -> Result<u64, CacheError> {
        let ttl_secs = i64::try_from(self.config.l2_ttl.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(ttl_secs);
        let removed = self.store.delete_older_than(cutoff).await?;
        if removed > 0 {
            record_cache_sweep(removed);
            tracing::info!(removed, "Swept expired cache entries");
        }
        Ok(removed)
    }

    /// Snapshot occupancy and hit counters.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] when the durable row count fails.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            l1_count: self.memory.len(),
            l2_count: self.store.count().await?,
            max_l1_size: self.config.max_l1_size,
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    fn promote(&self, key: &str, value: serde_json::Value) {
        if let Some(evicted) = self.memory.insert(key, value) {
            record_cache_eviction();
            tracing::debug!(key = %evicted, "Evicted oldest in-memory cache entry");
        }
    }

    fn is_expired(&self, timestamp: i64, now: i64) -> bool {
        let age = now.saturating_sub(timestamp);
        age >= i64::try_from(self.config.l2_ttl.as_secs()).unwrap_or(i64::MAX)
    }

    fn note_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        record_cache_miss();
    }

    async fn discard(&self, key: &str) {
        if let Err(error) = self.store.delete(key).await {
            tracing::debug!(key, error = %error, "Failed to remove dead cache entry");
        }
    }
}
