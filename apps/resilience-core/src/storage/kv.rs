//! Durable key/value table used as the cache's second tier.
//!
//! One table, three columns: key, opaque value bytes, and a unix timestamp
//! written by the caller. Rows survive process restarts; expiry policy is
//! decided by the cache layer above, this module only stores and sweeps.

use std::sync::Arc;

use thiserror::Error;

use super::pool::{PoolError, TursoPool};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    timestamp INTEGER NOT NULL
)";

const CREATE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_cache_entries_timestamp ON cache_entries (timestamp)";

const UPSERT_SQL: &str = "INSERT INTO cache_entries (key, value, timestamp)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, timestamp = excluded.timestamp";

const FETCH_SQL: &str = "SELECT value, timestamp FROM cache_entries WHERE key = ?1";

/// Storage layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not obtain a pooled connection.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] turso::Error),
    /// A row's stored shape did not match the schema contract.
    #[error("corrupt entry for key '{key}'")]
    Corrupt {
        /// Key of the offending row.
        key: String,
    },
}

/// A stored value with the timestamp it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Unix timestamp (seconds) recorded at write time.
    pub timestamp: i64,
}

/// Key/value store over the pooled local database.
#[derive(Debug, Clone)]
pub struct KvStore {
    pool: Arc<TursoPool>,
}

impl KvStore {
    /// Create the store, applying the schema if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when no connection is available or the
    /// schema cannot be applied.
    pub async fn new(pool: Arc<TursoPool>) -> Result<Self, StorageError> {
        let conn = pool.get().await?;
        conn.execute(CREATE_TABLE_SQL, ()).await?;
        conn.execute(CREATE_INDEX_SQL, ()).await?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Insert or overwrite the row for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the write fails.
    pub async fn upsert(
        &self,
        key: &str,
        value: &[u8],
        timestamp: i64,
    ) -> Result<(), StorageError> {
        let conn = self.pool.get().await?;
        conn.execute(UPSERT_SQL, (key.to_string(), value.to_vec(), timestamp))
            .await?;
        Ok(())
    }

    /// Read the row for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupt`] when the row exists but its column
    /// shapes do not match the schema contract.
    pub async fn fetch(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        let conn = self.pool.get().await?;
        let mut rows = conn.query(FETCH_SQL, (key.to_string(),)).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let value = match row.get_value(0)? {
            turso::Value::Blob(bytes) => bytes,
            turso::Value::Text(text) => text.into_bytes(),
            _ => {
                return Err(StorageError::Corrupt {
                    key: key.to_string(),
                });
            }
        };
        let turso::Value::Integer(timestamp) = row.get_value(1)? else {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
            });
        };
        Ok(Some(StoredEntry { value, timestamp }))
    }

    /// Delete the row for `key`, reporting how many rows went away.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the delete fails.
    pub async fn delete(&self, key: &str) -> Result<u64, StorageError> {
        let conn = self.pool.get().await?;
        let removed = conn
            .execute(
                "DELETE FROM cache_entries WHERE key = ?1",
                (key.to_string(),),
            )
            .await?;
        Ok(removed)
    }

    /// Delete every row.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the delete fails.
    pub async fn clear(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get().await?;
        let removed = conn.execute("DELETE FROM cache_entries", ()).await?;
        Ok(removed)
    }

    /// Delete rows stamped at or before `cutoff`, reporting the count.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the sweep fails.
    pub async fn delete_older_than(&self, cutoff: i64) -> Result<u64, StorageError> {
        let conn = self.pool.get().await?;
        let removed = conn
            .execute("DELETE FROM cache_entries WHERE timestamp <= ?1", (cutoff,))
            .await?;
        Ok(removed)
    }

    /// Number of rows currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the query fails.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM cache_entries", ()).await?;
        let Some(row) = rows.next().await? else {
            return Ok(0);
        };
        match row.get_value(0)? {
            turso::Value::Integer(n) => Ok(u64::try_from(n).unwrap_or_default()),
            _ => Ok(0),
        }
    }
}
