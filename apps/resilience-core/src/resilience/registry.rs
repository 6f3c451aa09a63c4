//! Named registry of shared resilience components.
//!
//! One registry per process: construct it at startup, hand out references,
//! and fetch per-dependency breakers and limiters by name. Handles are
//! `Arc`s, so every call site naming the same dependency shares one
//! admission state.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use super::circuit_breaker::{
    BreakerConfigError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
};
use super::rate_limiter::{RateLimitConfig, RateLimitError, TokenBucket};

/// Error creating registry defaults or named components.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Circuit breaker configuration was rejected.
    #[error(transparent)]
    Breaker(#[from] BreakerConfigError),
    /// Rate limiter configuration was rejected.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Named circuit breakers and rate limiters with shared defaults.
#[derive(Debug)]
pub struct ResilienceRegistry {
    breaker_defaults: CircuitBreakerConfig,
    limiter_defaults: RateLimitConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl ResilienceRegistry {
    /// Create a registry, validating both default configurations.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when either default configuration is
    /// rejected.
    pub fn new(
        breaker_defaults: CircuitBreakerConfig,
        limiter_defaults: RateLimitConfig,
    ) -> Result<Self, RegistryError> {
        breaker_defaults.validate()?;
        limiter_defaults.validate()?;
        Ok(Self {
            breaker_defaults,
            limiter_defaults,
            breakers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
        })
    }

    /// Registry with stock defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            breaker_defaults: CircuitBreakerConfig::default(),
            limiter_defaults: RateLimitConfig::default(),
            breakers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `name` using the registry defaults.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(found) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(found);
        }
        let mut map = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Recheck under the write lock: another caller may have won the race.
        if let Some(found) = map.get(name) {
            return Arc::clone(found);
        }
        let breaker = Arc::new(CircuitBreaker::from_validated(
            name,
            self.breaker_defaults.clone(),
        ));
        map.insert(name.to_owned(), Arc::clone(&breaker));
        tracing::debug!(name, "Created circuit breaker from registry defaults");
        breaker
    }

    /// Get the breaker for `name`, creating it with `config` when absent.
    ///
    /// An existing breaker keeps its original configuration; `config` only
    /// applies to the first registration of a name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when `config` is rejected.
    pub fn breaker_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, RegistryError> {
        if let Some(found) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(found));
        }
        config.validate()?;
        let mut map = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = map.get(name) {
            return Ok(Arc::clone(found));
        }
        let breaker = Arc::new(CircuitBreaker::from_validated(name, config));
        map.insert(name.to_owned(), Arc::clone(&breaker));
        tracing::debug!(name, "Created circuit breaker");
        Ok(breaker)
    }

    /// Get or create the rate limiter for `name` using the registry
    /// defaults.
    pub fn limiter(&self, name: &str) -> Arc<TokenBucket> {
        if let Some(found) = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(found);
        }
        let mut map = self
            .limiters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = map.get(name) {
            return Arc::clone(found);
        }
        let limiter = Arc::new(TokenBucket::from_validated(name, self.limiter_defaults));
        map.insert(name.to_owned(), Arc::clone(&limiter));
        tracing::debug!(name, "Created rate limiter from registry defaults");
        limiter
    }

    /// Get the rate limiter for `name`, creating it with `config` when
    /// absent.
    ///
    /// An existing limiter keeps its original configuration; `config` only
    /// applies to the first registration of a name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when `config` is rejected.
    pub fn limiter_with(
        &self,
        name: &str,
        config: RateLimitConfig,
    ) -> Result<Arc<TokenBucket>, RegistryError> {
        if let Some(found) = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(found));
        }
        config.validate()?;
        let mut map = self
            .limiters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = map.get(name) {
            return Ok(Arc::clone(found));
        }
        let limiter = Arc::new(TokenBucket::from_validated(name, config));
        map.insert(name.to_owned(), Arc::clone(&limiter));
        tracing::debug!(name, "Created rate limiter");
        Ok(limiter)
    }

    /// Snapshot stats for every registered breaker.
    pub async fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        // Clone the handles out so no lock is held across an await.
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect();

        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats
    }

    /// Current token count of every registered limiter.
    #[must_use]
    pub fn limiter_levels(&self) -> Vec<(String, f64)> {
        self.limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|limiter| (limiter.name().to_owned(), limiter.tokens()))
            .collect()
    }
}
