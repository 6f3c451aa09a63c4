//! Prometheus metrics for the resilience and caching layers.
//!
//! Call [`init_metrics`] once at startup to expose the scrape endpoint;
//! the `record_*` helpers are no-ops until then, so library code calls
//! them unconditionally.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address the Prometheus scrape endpoint binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Histogram buckets (seconds) for wait-time distributions.
    #[serde(default = "default_wait_buckets")]
    pub wait_buckets: Vec<f64>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_wait_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0]
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            wait_buckets: default_wait_buckets(),
        }
    }
}

impl MetricsConfig {
    /// Default configuration bound to `addr`.
    #[must_use]
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            listen_addr: addr.into(),
            ..Default::default()
        }
    }
}

/// Metrics initialization errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The exporter configuration was rejected.
    #[error("invalid metrics configuration: {0}")]
    Configuration(String),
    /// The exporter could not be installed as the global recorder.
    #[error("failed to install metrics exporter: {0}")]
    Installation(String),
}

/// Install the Prometheus exporter as the global metrics recorder.
///
/// # Errors
///
/// Returns [`MetricsError::Configuration`] when the listen address or
/// buckets are unusable, and [`MetricsError::Installation`] when a global
/// recorder is already installed or the listener cannot bind.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    let addr: SocketAddr = config.listen_addr.parse().map_err(|err| {
        MetricsError::Configuration(format!(
            "invalid listen address '{}': {err}",
            config.listen_addr
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(&config.wait_buckets)
        .map_err(|err| MetricsError::Configuration(err.to_string()))?
        .install()
        .map_err(|err| MetricsError::Installation(err.to_string()))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(())
}

/// Gauge values for `circuit_breaker_state`.
pub mod circuit_breaker_state {
    /// Circuit closed, calls flowing.
    pub const CLOSED: f64 = 0.0;
    /// Circuit open, calls rejected.
    pub const OPEN: f64 = 1.0;
    /// Circuit half-open, trial calls admitted.
    pub const HALF_OPEN: f64 = 2.0;
}

// ============================================================
// Circuit Breaker Metrics
// ============================================================

/// Record the current state of a circuit breaker.
///
/// # Arguments
///
/// * `service` - Breaker name
/// * `state` - One of the [`circuit_breaker_state`] values
pub fn record_circuit_breaker_state(service: &str, state: f64) {
    gauge!("circuit_breaker_state", "service" => service.to_string()).set(state);
}

/// Record a guarded call that completed successfully.
pub fn record_circuit_breaker_success(service: &str) {
    counter!("circuit_breaker_success_total", "service" => service.to_string()).increment(1);
}

/// Record a guarded call that failed with a counted error.
pub fn record_circuit_breaker_failure(service: &str) {
    counter!("circuit_breaker_failures_total", "service" => service.to_string()).increment(1);
}

/// Record a call rejected because the circuit was open.
pub fn record_circuit_breaker_rejected(service: &str) {
    counter!("circuit_breaker_rejected_total", "service" => service.to_string()).increment(1);
}

// ============================================================
// Rate Limiter Metrics
// ============================================================

/// Record a request admitted by a rate limiter.
pub fn record_rate_limit_admitted(limiter: &str) {
    counter!("rate_limiter_admitted_total", "limiter" => limiter.to_string()).increment(1);
}

/// Record a request denied by a rate limiter.
pub fn record_rate_limit_denied(limiter: &str) {
    counter!("rate_limiter_denied_total", "limiter" => limiter.to_string()).increment(1);
}

/// Record how long a caller slept waiting for tokens.
///
/// # Arguments
///
/// * `limiter` - Bucket name
/// * `seconds` - Wait duration in seconds
pub fn record_rate_limit_wait(limiter: &str, seconds: f64) {
    histogram!("rate_limiter_wait_seconds", "limiter" => limiter.to_string()).record(seconds);
}

// ============================================================
// Connection Pool Metrics
// ============================================================

/// Record a successful checkout.
///
/// # Arguments
///
/// * `source` - `"reused"` for an idle connection, `"created"` for a fresh
///   one
pub fn record_pool_checkout(source: &str) {
    counter!("connection_pool_checkouts_total", "source" => source.to_string()).increment(1);
}

/// Record a checkout that timed out waiting for a slot.
pub fn record_pool_timeout() {
    counter!("connection_pool_timeouts_total").increment(1);
}

/// Record the number of live pooled connections.
pub fn record_pool_connections(total: f64) {
    gauge!("connection_pool_connections").set(total);
}

/// Record how long a checkout waited for its slot.
pub fn record_pool_wait(seconds: f64) {
    histogram!("connection_pool_wait_seconds").record(seconds);
}

// ============================================================
// Cache Metrics
// ============================================================

/// Record a cache read served by `tier` (`"l1"` or `"l2"`).
pub fn record_cache_hit(tier: &str) {
    counter!("cache_requests_total", "tier" => tier.to_string(), "outcome" => "hit")
        .increment(1);
}

/// Record a cache read served by neither tier.
pub fn record_cache_miss() {
    counter!("cache_requests_total", "tier" => "none", "outcome" => "miss").increment(1);
}

/// Record an in-memory entry evicted to make room.
pub fn record_cache_eviction() {
    counter!("cache_evictions_total").increment(1);
}

/// Record expired durable rows reclaimed by a sweep.
pub fn record_cache_sweep(removed: u64) {
    counter!("cache_expired_swept_total").increment(removed);
}
