//! YAML configuration with environment variable interpolation.
//!
//! Settings mirror the runtime configuration structs field-for-field but
//! use plain scalar types (seconds as integers) so the YAML stays
//! readable. `${VAR}` and `${VAR:-default}` references are substituted
//! from the environment before parsing; a missing variable without a
//! default becomes an empty string.
//!
//! # Example
//!
//! ```yaml
//! circuit_breaker:
//!   failure_threshold: 3
//!   recovery_timeout_secs: 60
//! rate_limit:
//!   rate: 120
//!   per_secs: 60
//! pool:
//!   pool_size: ${PREMIA_POOL_SIZE:-5}
//! cache:
//!   l2_ttl_secs: 86400
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::observability::MetricsConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use crate::storage::PoolConfig;

/// Default config file path, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "resilience.yaml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file could not be parsed as YAML.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),
    /// The parsed values fail component validation.
    #[error("config validation failed: {0}")]
    ValidationError(String),
}

/// Root settings for the resilience core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceSettings {
    /// Circuit breaker defaults.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Rate limiter defaults.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Connection pool sizing.
    #[serde(default)]
    pub pool: PoolSettings,
    /// Hybrid cache sizing and TTLs.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Metrics exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Circuit breaker section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to stay open before admitting a trial call.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Trial successes required before closing.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Convert to the runtime configuration.
    #[must_use]
    pub const fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            success_threshold: self.success_threshold,
        }
    }
}

/// Rate limiter section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Tokens replenished per period.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Replenishment period in seconds.
    #[serde(default = "default_per_secs")]
    pub per_secs: u64,
    /// Bucket capacity; defaults to `rate` when omitted.
    #[serde(default)]
    pub burst: Option<f64>,
}

fn default_rate() -> f64 {
    60.0
}

fn default_per_secs() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            per_secs: default_per_secs(),
            burst: None,
        }
    }
}

impl RateLimitSettings {
    /// Convert to the runtime configuration.
    #[must_use]
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            rate: self.rate,
            per: Duration::from_secs(self.per_secs),
            burst: self.burst.unwrap_or(self.rate),
        }
    }
}

/// Connection pool section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Warm connections kept open.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Extra connections allowed under load.
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,
    /// Seconds a checkout waits for a free slot.
    #[serde(default = "default_pool_timeout_secs")]
    pub pool_timeout_secs: u64,
    /// Seconds allowed to establish one connection.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_pool_size() -> usize {
    5
}

fn default_max_overflow() -> usize {
    5
}

fn default_pool_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            pool_timeout_secs: default_pool_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl PoolSettings {
    /// Convert to the runtime configuration.
    #[must_use]
    pub const fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            pool_timeout: Duration::from_secs(self.pool_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// Hybrid cache section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Entry bound for the in-memory tier.
    #[serde(default = "default_max_l1_size")]
    pub max_l1_size: usize,
    /// Seconds an in-memory entry stays fresh.
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,
    /// Seconds a durable entry stays fresh.
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,
}

fn default_max_l1_size() -> usize {
    1024
}

fn default_l1_ttl_secs() -> u64 {
    60
}

fn default_l2_ttl_secs() -> u64 {
    86_400
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_l1_size: default_max_l1_size(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_ttl_secs: default_l2_ttl_secs(),
        }
    }
}

impl CacheSettings {
    /// Convert to the runtime configuration.
    #[must_use]
    pub const fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_l1_size: self.max_l1_size,
            l1_ttl: Duration::from_secs(self.l1_ttl_secs),
            l2_ttl: Duration::from_secs(self.l2_ttl_secs),
        }
    }
}

/// Load settings from `path`, falling back to `resilience.yaml`.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read, parsed, or
/// validated.
pub fn load_settings(path: Option<&str>) -> Result<ResilienceSettings, ConfigError> {
    let path = path.unwrap_or(DEFAULT_CONFIG_PATH);
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_string(),
        source,
    })?;
    load_settings_from_string(&content)
}

/// Parse settings from a YAML string.
///
/// # Errors
///
/// Returns [`ConfigError`] when the content cannot be parsed or validated.
pub fn load_settings_from_string(content: &str) -> Result<ResilienceSettings, ConfigError> {
    let interpolated = interpolate_env_vars(content);
    let settings: ResilienceSettings = serde_yaml_bw::from_str(&interpolated)?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Substitute `${VAR}` and `${VAR:-default}` references from the
/// environment. A missing variable without a default becomes an empty
/// string.
fn interpolate_env_vars(content: &str) -> String {
    static ENV_VAR_PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)] // The pattern is a compile-time constant.
    let pattern = ENV_VAR_PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var pattern should compile")
    });

    let mut result = content.to_string();
    for captures in pattern.captures_iter(content) {
        let var_name = &captures[1];
        let default_value = captures.get(2).map_or("", |m| m.as_str());
        let replacement =
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string());
        result = result.replace(&captures[0], &replacement);
    }
    result
}

fn validate_settings(settings: &ResilienceSettings) -> Result<(), ConfigError> {
    settings
        .circuit_breaker
        .to_breaker_config()
        .validate()
        .map_err(|err| ConfigError::ValidationError(err.to_string()))?;
    settings
        .rate_limit
        .to_rate_limit_config()
        .validate()
        .map_err(|err| ConfigError::ValidationError(err.to_string()))?;
    settings
        .pool
        .to_pool_config()
        .validate()
        .map_err(|err| ConfigError::ValidationError(err.to_string()))?;
    settings
        .cache
        .to_cache_config()
        .validate()
        .map_err(|err| ConfigError::ValidationError(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = ResilienceSettings::default();
        assert!(validate_settings(&settings).is_ok());

        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.rate_limit.per_secs, 60);
        assert_eq!(settings.pool.pool_size, 5);
        assert_eq!(settings.cache.l2_ttl_secs, 86_400);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = "circuit_breaker:\n  failure_threshold: 3\n";
        let settings = load_settings_from_string(yaml).expect("yaml should parse");

        assert_eq!(settings.circuit_breaker.failure_threshold, 3);
        assert_eq!(settings.circuit_breaker.recovery_timeout_secs, 60);
        assert_eq!(settings.pool.pool_size, 5);
    }

    #[test]
    fn test_full_yaml_parses() {
        let yaml = r"
circuit_breaker:
  failure_threshold: 3
  recovery_timeout_secs: 30
  success_threshold: 2
rate_limit:
  rate: 120
  per_secs: 60
  burst: 150
pool:
  pool_size: 4
  max_overflow: 2
  pool_timeout_secs: 10
  connect_timeout_secs: 3
cache:
  max_l1_size: 256
  l1_ttl_secs: 30
  l2_ttl_secs: 3600
metrics:
  listen_addr: 127.0.0.1:9464
";
        let settings = load_settings_from_string(yaml).expect("yaml should parse");

        let breaker = settings.circuit_breaker.to_breaker_config();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(30));

        let limit = settings.rate_limit.to_rate_limit_config();
        assert!((limit.burst - 150.0).abs() < f64::EPSILON);

        let pool = settings.pool.to_pool_config();
        assert_eq!(pool.pool_size, 4);
        assert_eq!(pool.pool_timeout, Duration::from_secs(10));

        let cache = settings.cache.to_cache_config();
        assert_eq!(cache.max_l1_size, 256);
        assert_eq!(cache.l2_ttl, Duration::from_secs(3600));

        assert_eq!(settings.metrics.listen_addr, "127.0.0.1:9464");
    }

    #[test]
    fn test_burst_defaults_to_rate() {
        let yaml = "rate_limit:\n  rate: 90\n";
        let settings = load_settings_from_string(yaml).expect("yaml should parse");
        let config = settings.rate_limit.to_rate_limit_config();
        assert!((config.burst - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_rejects_zero_failure_threshold() {
        let yaml = "circuit_breaker:\n  failure_threshold: 0\n";
        let Err(err) = load_settings_from_string(yaml) else {
            panic!("zero failure_threshold should be rejected");
        };
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validation_rejects_zero_rate() {
        let yaml = "rate_limit:\n  rate: 0\n";
        let result = load_settings_from_string(yaml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_zero_pool_size() {
        let yaml = "pool:\n  pool_size: 0\n";
        let result = load_settings_from_string(yaml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_subsecond_l2_ttl() {
        let yaml = "cache:\n  l2_ttl_secs: 0\n";
        let result = load_settings_from_string(yaml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_parse_error_for_malformed_yaml() {
        let yaml = "circuit_breaker:\n  failure_threshold: not_a_number\n";
        let result = load_settings_from_string(yaml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_read_error_for_missing_file() {
        let result = load_settings(Some("/nonexistent/premia/resilience.yaml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)]
    fn test_interpolate_uses_default_when_var_missing() {
        let interpolated =
            interpolate_env_vars("threshold: ${PREMIA_CONFIG_TEST_NONEXISTENT_VAR:-7}");
        assert_eq!(interpolated, "threshold: 7");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)]
    fn test_interpolate_missing_var_without_default_is_empty() {
        let interpolated = interpolate_env_vars("key: ${PREMIA_CONFIG_TEST_NONEXISTENT_VAR}");
        assert_eq!(interpolated, "key: ");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)]
    fn test_interpolate_reads_environment() {
        // PATH is present in any sane test environment.
        let interpolated = interpolate_env_vars("path: ${PATH}");
        assert!(!interpolated.contains("${PATH}"));
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)]
    fn test_interpolated_yaml_parses() {
        let yaml = "circuit_breaker:\n  failure_threshold: ${PREMIA_CONFIG_TEST_NONEXISTENT_VAR:-9}\n";
        let settings = load_settings_from_string(yaml).expect("yaml should parse");
        assert_eq!(settings.circuit_breaker.failure_threshold, 9);
    }
}
