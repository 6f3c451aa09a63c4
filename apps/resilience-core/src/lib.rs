// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Resilience Core - Rust Core Library
//!
//! Fault-tolerance and caching primitives for the Premia options research
//! system. Every outbound dependency (market data vendors, earnings and
//! sentiment feeds, the local database) is wrapped in these primitives so
//! that slow or failing dependencies degrade service instead of taking it
//! down.
//!
//! # Components
//!
//! - **Resilience**: Admission control in front of fallible dependencies
//!   - `circuit_breaker`: Trip after consecutive failures, probe on a timer
//!   - `rate_limiter`: Token buckets with composite (multi-window) limits
//!   - `registry`: Shared, named breaker and limiter instances
//!
//! - **Storage**: Bounded access to the embedded database
//!   - `pool`: Warm + overflow connection pool with health probing
//!   - `kv`: Durable key/value table used by the cache's second tier
//!
//! - **Cache**: Two-tier read-through cache
//!   - `memory`: Bounded in-memory tier with insertion-order eviction
//!   - `hybrid`: Memory tier over the durable tier, write-through
//!
//! - **Config / Observability**: YAML settings and Prometheus metrics.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Components
// =============================================================================

/// Two-tier caching - in-memory tier over the durable key/value tier.
pub mod cache;

/// YAML configuration with environment variable interpolation.
pub mod config;

/// Prometheus metrics export and recording helpers.
pub mod observability;

/// Admission control - circuit breakers and rate limiters.
pub mod resilience;

/// Connection pooling and the durable key/value store.
pub mod storage;

// =============================================================================
// Re-exports
// =============================================================================

// Resilience re-exports
pub use resilience::{
    BlockingCircuitBreaker, BreakerConfigError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerStats, CircuitState, CompositeRateLimiter, Guarded,
    RateLimitConfig, RateLimitError, RegistryError, ResilienceRegistry, TokenBucket,
};

// Storage re-exports
pub use storage::{
    ConnectionManager, ConnectionPool, KvStore, PoolConfig, PoolError, PoolStats,
    PooledConnection, StorageError, StoredEntry, TursoConnectionManager, TursoPool,
};

// Cache re-exports
pub use cache::{CacheConfig, CacheError, CacheStats, HybridCache, MemoryCache};

// Config / observability re-exports
pub use config::{ConfigError, ResilienceSettings, load_settings, load_settings_from_string};
pub use observability::{MetricsConfig, MetricsError, init_metrics};
