//! Admission control for unreliable dependencies.
//!
//! Circuit breakers stop calls to failing providers before they burn the
//! whole request budget; token buckets keep the pipeline inside provider
//! rate quotas; the registry hands out shared named instances of both.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;

pub use circuit_breaker::{
    BlockingCircuitBreaker, BreakerConfigError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerStats, CircuitState, Guarded,
};
pub use rate_limiter::{CompositeRateLimiter, RateLimitConfig, RateLimitError, TokenBucket};
pub use registry::{RegistryError, ResilienceRegistry};
