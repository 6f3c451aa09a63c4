//! Bounded async connection pool over the local database.
//!
//! A fixed warm set of `pool_size` connections plus up to `max_overflow`
//! extras created on demand. Capacity is enforced with a semaphore sized to
//! the sum, so a checkout either gets a slot within `pool_timeout` or fails
//! without touching the database. Connections hand themselves back on drop.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::observability::metrics::{
    record_pool_checkout, record_pool_connections, record_pool_timeout, record_pool_wait,
};

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Warm connections kept open across checkouts.
    pub pool_size: usize,
    /// Extra connections allowed under load, closed once returned.
    pub max_overflow: usize,
    /// How long a checkout waits for a free slot.
    pub pool_timeout: Duration,
    /// How long establishing one new connection may take.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 5,
            pool_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Reject values that would make the pool unusable.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.pool_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "pool_timeout must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration rejected at construction.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    /// Every slot stayed busy for the whole checkout timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    Exhausted {
        /// How long the caller waited for a slot.
        waited: Duration,
    },
    /// Establishing a new connection took longer than allowed.
    #[error("timed out establishing a connection after {limit:?}")]
    ConnectTimeout {
        /// The configured connect timeout.
        limit: Duration,
    },
    /// The connection manager failed to produce a connection.
    #[error("connection manager error: {0}")]
    Manager(String),
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] turso::Error),
    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,
}

/// Creates, probes, and tears down the connections a pool manages.
///
/// Connections must release their resources on drop; [`ConnectionManager::close`]
/// is the graceful path used for health replacement and shutdown.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Connection type handed out by the pool.
    type Connection: Send;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Probe a connection before reuse.
    async fn is_healthy(&self, conn: &mut Self::Connection) -> bool;

    /// Gracefully close a connection.
    async fn close(&self, conn: Self::Connection);
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured warm set size.
    pub pool_size: usize,
    /// Configured overflow allowance.
    pub max_overflow: usize,
    /// Connections currently alive, checked out or idle.
    pub total_connections: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Checkouts served since construction.
    pub checkouts: u64,
    /// Checkouts that timed out waiting for a slot.
    pub timeouts: u64,
    /// Idle connections discarded after failing the health probe.
    pub health_replacements: u64,
}

/// Bounded pool of database connections.
///
/// Total live connections never exceed `pool_size + max_overflow`; the
/// semaphore makes over-admission impossible rather than merely unlikely.
pub struct ConnectionPool<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<M::Connection>>,
    slots: Arc<Semaphore>,
    total: AtomicUsize,
    closed: AtomicBool,
    checkouts: AtomicU64,
    timeouts: AtomicU64,
    health_replacements: AtomicU64,
}

impl<M: ConnectionManager> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("total", &self.total)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create a pool and eagerly open the warm set.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] for an unusable configuration,
    /// or the underlying error when warming a connection fails. A pool that
    /// cannot open its warm set at startup is treated as fatal rather than
    /// degraded.
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let capacity = config.pool_size + config.max_overflow;
        let pool = Self {
            manager,
            idle: Mutex::new(VecDeque::with_capacity(config.pool_size)),
            slots: Arc::new(Semaphore::new(capacity)),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            checkouts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            health_replacements: AtomicU64::new(0),
            config,
        };

        for _ in 0..pool.config.pool_size {
            let conn = pool.create_connection().await?;
            pool.lock_idle().push_back(conn);
        }
        tracing::info!(
            pool_size = pool.config.pool_size,
            max_overflow = pool.config.max_overflow,
            "Connection pool warmed"
        );
        Ok(pool)
    }

    /// Check out a connection, waiting up to `pool_timeout` for a slot.
    ///
    /// Idle connections are health-probed before reuse; ones that fail are
    /// destroyed and replaced transparently.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] when no slot frees up in time,
    /// [`PoolError::ConnectTimeout`] when a fresh connection cannot be
    /// established in time, or [`PoolError::Closed`] after shutdown.
    pub async fn get(&self) -> Result<PooledConnection<'_, M>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let start = Instant::now();

        let permit = match timeout(
            self.config.pool_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                record_pool_timeout();
                let waited = start.elapsed();
                tracing::warn!(waited = ?waited, "Connection pool exhausted");
                return Err(PoolError::Exhausted { waited });
            }
        };

        loop {
            let candidate = self.lock_idle().pop_front();
            let Some(mut conn) = candidate else { break };
            if self.manager.is_healthy(&mut conn).await {
                self.checkouts.fetch_add(1, Ordering::Relaxed);
                record_pool_checkout("reused");
                record_pool_wait(start.elapsed().as_secs_f64());
                return Ok(PooledConnection::new(self, conn, permit));
            }
            self.health_replacements.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Pooled connection failed health probe, replacing");
            self.destroy(conn).await;
        }

        let conn = self.create_connection().await?;
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        record_pool_checkout("created");
        record_pool_wait(start.elapsed().as_secs_f64());
        Ok(PooledConnection::new(self, conn, permit))
    }

    /// Shut the pool down, closing idle connections and failing waiters.
    ///
    /// Connections still checked out are closed when their guards drop.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();

        loop {
            let drained = self.lock_idle().pop_front();
            match drained {
                Some(conn) => self.destroy(conn).await,
                None => break,
            }
        }
        tracing::info!(
            still_checked_out = self.total.load(Ordering::Acquire),
            "Connection pool closed"
        );
    }

    /// Snapshot pool occupancy and counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let idle = self.lock_idle().len();
        let total = self.total.load(Ordering::Acquire);
        PoolStats {
            pool_size: self.config.pool_size,
            max_overflow: self.config.max_overflow,
            total_connections: total,
            idle,
            in_use: total.saturating_sub(idle),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            health_replacements: self.health_replacements.load(Ordering::Relaxed),
        }
    }

    async fn create_connection(&self) -> Result<M::Connection, PoolError> {
        self.total.fetch_add(1, Ordering::AcqRel);
        match timeout(self.config.connect_timeout, self.manager.connect()).await {
            Ok(Ok(conn)) => {
                self.publish_gauge();
                Ok(conn)
            }
            Ok(Err(error)) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(error)
            }
            Err(_) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(PoolError::ConnectTimeout {
                    limit: self.config.connect_timeout,
                })
            }
        }
    }

    async fn destroy(&self, conn: M::Connection) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.manager.close(conn).await;
        self.publish_gauge();
    }

    /// Synchronous return path used by guard drops.
    fn release(&self, conn: M::Connection, broken: bool) {
        if broken || self.closed.load(Ordering::Acquire) {
            self.drop_connection(conn);
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() >= self.config.pool_size {
            drop(idle);
            // Overflow connection; the warm set is already full.
            self.drop_connection(conn);
            return;
        }
        idle.push_back(conn);
    }

    fn drop_connection(&self, conn: M::Connection) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        drop(conn);
        self.publish_gauge();
    }

    fn publish_gauge(&self) {
        record_pool_connections(self.total.load(Ordering::Acquire) as f64);
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<M::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out connection that returns to the pool on drop.
///
/// Derefs to the underlying connection. Call [`PooledConnection::mark_broken`]
/// when the connection itself misbehaved so it is discarded instead of
/// reused.
pub struct PooledConnection<'a, M: ConnectionManager> {
    pool: &'a ConnectionPool<M>,
    conn: Option<M::Connection>,
    broken: bool,
    /// Released after the connection re-enters the idle queue.
    _permit: OwnedSemaphorePermit,
}

impl<'a, M: ConnectionManager> PooledConnection<'a, M> {
    fn new(pool: &'a ConnectionPool<M>, conn: M::Connection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            broken: false,
            _permit: permit,
        }
    }

    /// Flag this connection as unusable; it will be closed on drop instead
    /// of returning to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    #[allow(clippy::expect_used)] // Occupied from construction until drop.
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection slot occupied")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<'_, M> {
    #[allow(clippy::expect_used)] // Occupied from construction until drop.
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection slot occupied")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}

/// Pool manager for local turso database files.
pub struct TursoConnectionManager {
    db: turso::Database,
    path: String,
}

impl std::fmt::Debug for TursoConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TursoConnectionManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TursoConnectionManager {
    /// Open the database file at `path`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Database`] when the file cannot be opened.
    pub async fn new(path: impl Into<String>) -> Result<Self, PoolError> {
        let path = path.into();
        let db = turso::Builder::new_local(&path).build().await?;
        Ok(Self { db, path })
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl ConnectionManager for TursoConnectionManager {
    type Connection = turso::Connection;

    async fn connect(&self) -> Result<Self::Connection, PoolError> {
        Ok(self.db.connect()?)
    }

    async fn is_healthy(&self, conn: &mut Self::Connection) -> bool {
        match conn.query("SELECT 1", ()).await {
            Ok(mut rows) => rows.next().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self, conn: Self::Connection) {
        // Dropping a turso connection closes it.
        drop(conn);
    }
}

/// The pool type used throughout the storage and cache layers.
pub type TursoPool = ConnectionPool<TursoConnectionManager>;
