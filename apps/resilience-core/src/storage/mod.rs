//! Pooled access to the local research database.
//!
//! [`ConnectionPool`] bounds concurrent connections to the database file;
//! [`KvStore`] is the durable key/value table the hybrid cache persists
//! into.

pub mod kv;
pub mod pool;

pub use kv::{KvStore, StorageError, StoredEntry};
pub use pool::{
    ConnectionManager, ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection,
    TursoConnectionManager, TursoPool,
};
