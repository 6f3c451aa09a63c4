//! Token bucket rate limiting for provider call budgets.
//!
//! Buckets refill continuously at `rate` tokens per `per` and hold at most
//! `burst`. A fresh bucket starts full, so a quiet pipeline can burst up to
//! capacity before settling at the sustained rate. [`CompositeRateLimiter`]
//! layers several buckets (per-minute and per-day provider quotas) behind a
//! single admission decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::metrics::{
    record_rate_limit_admitted, record_rate_limit_denied, record_rate_limit_wait,
};

/// How often blocked waiters re-check the bucket.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens replenished per `per`.
    pub rate: f64,
    /// Replenishment period.
    pub per: Duration,
    /// Bucket capacity; permits above this can never be admitted.
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(60.0, Duration::from_secs(60))
    }
}

impl RateLimitConfig {
    /// Sustained `rate` per `per` with burst capacity equal to the rate.
    #[must_use]
    pub const fn new(rate: f64, per: Duration) -> Self {
        Self {
            rate,
            per,
            burst: rate,
        }
    }

    /// `calls` per minute.
    #[must_use]
    pub const fn per_minute(calls: f64) -> Self {
        Self::new(calls, Duration::from_secs(60))
    }

    /// `calls` per day.
    #[must_use]
    pub const fn per_day(calls: f64) -> Self {
        Self::new(calls, Duration::from_secs(86_400))
    }

    /// Reject values the refill arithmetic cannot work with.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(RateLimitError::InvalidRate(self.rate));
        }
        if self.per.is_zero() {
            return Err(RateLimitError::ZeroPeriod);
        }
        if !self.burst.is_finite() || self.burst < 1.0 {
            return Err(RateLimitError::InvalidBurst(self.burst));
        }
        Ok(())
    }
}

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitError {
    /// `rate` must be a positive finite number.
    #[error("rate must be a positive finite number, got {0}")]
    InvalidRate(f64),
    /// `per` must be a non-zero duration.
    #[error("per must be a non-zero duration")]
    ZeroPeriod,
    /// `burst` must be finite and admit at least one whole call.
    #[error("burst must be a finite number of at least 1, got {0}")]
    InvalidBurst(f64),
    /// A composite member denied the request.
    #[error("rate limit '{limit}' exceeded, retry in {}s", retry_after.as_secs())]
    Exceeded {
        /// Name of the bucket that denied the request.
        limit: String,
        /// Estimated wait until the bucket could admit it.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A continuously refilling token bucket.
///
/// All waiting happens outside the bucket lock, so a blocked caller never
/// delays another task's admission check.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    total_admitted: AtomicU64,
    total_denied: AtomicU64,
}

impl TokenBucket {
    /// Create a bucket starting at full capacity, validating the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] when the rate, period, or burst is
    /// unusable.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self::from_validated(name, config))
    }

    /// Construct without validating; the caller has already run `validate`.
    pub(crate) fn from_validated(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst,
                last_refill: Instant::now(),
            }),
            total_admitted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        }
    }

    /// Get the bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bucket configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take `permits` tokens if available, without waiting.
    pub fn try_acquire(&self, permits: f64) -> bool {
        if permits > self.config.burst {
            self.deny_oversized(permits);
            return false;
        }
        match self.admit(permits) {
            Ok(()) => {
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                record_rate_limit_admitted(&self.name);
                true
            }
            Err(_) => {
                self.total_denied.fetch_add(1, Ordering::Relaxed);
                record_rate_limit_denied(&self.name);
                false
            }
        }
    }

    /// Take `permits` tokens, sleeping once for the computed refill time if
    /// the bucket is short.
    ///
    /// Under contention another caller can claim the refilled tokens first;
    /// the single retry then reports `false` rather than waiting again.
    pub async fn acquire(&self, permits: f64) -> bool {
        if permits > self.config.burst {
            self.deny_oversized(permits);
            return false;
        }
        let wait = match self.admit(permits) {
            Ok(()) => {
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                record_rate_limit_admitted(&self.name);
                return true;
            }
            Err(wait) => wait,
        };

        tracing::debug!(name = %self.name, wait = ?wait, "Rate limit reached, waiting for refill");
        record_rate_limit_wait(&self.name, wait.as_secs_f64());
        // One extra millisecond so the retry lands after the fractional
        // refill instead of a hair before it.
        tokio::time::sleep(wait + Duration::from_millis(1)).await;

        let admitted = self.admit(permits).is_ok();
        if admitted {
            self.total_admitted.fetch_add(1, Ordering::Relaxed);
            record_rate_limit_admitted(&self.name);
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            record_rate_limit_denied(&self.name);
        }
        admitted
    }

    /// Poll for `permits` tokens until admitted or `timeout` elapses.
    pub async fn wait_for_token(&self, permits: f64, timeout: Duration) -> bool {
        if permits > self.config.burst {
            self.deny_oversized(permits);
            return false;
        }
        let start = Instant::now();
        loop {
            if self.admit(permits).is_ok() {
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                record_rate_limit_admitted(&self.name);
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.total_denied.fetch_add(1, Ordering::Relaxed);
                record_rate_limit_denied(&self.name);
                tracing::debug!(
                    name = %self.name,
                    timeout = ?timeout,
                    "Timed out waiting for rate limit token"
                );
                return false;
            }
            tokio::time::sleep((timeout - elapsed).min(POLL_INTERVAL)).await;
        }
    }

    /// Current token count after applying the pending refill.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        let mut state = self.lock_state();
        Self::refill(&mut state, &self.config, Instant::now());
        state.tokens
    }

    /// Calls admitted and denied since construction.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.total_admitted.load(Ordering::Relaxed),
            self.total_denied.load(Ordering::Relaxed),
        )
    }

    /// Estimated wait until `permits` tokens are available, without taking
    /// them. [`Duration::MAX`] when the request exceeds burst capacity.
    pub(crate) fn wait_hint(&self, permits: f64) -> Duration {
        if permits > self.config.burst {
            return Duration::MAX;
        }
        let mut state = self.lock_state();
        Self::refill(&mut state, &self.config, Instant::now());
        if state.tokens >= permits {
            Duration::ZERO
        } else {
            Self::time_until(&state, &self.config, permits)
        }
    }

    fn admit(&self, permits: f64) -> Result<(), Duration> {
        let mut state = self.lock_state();
        Self::refill(&mut state, &self.config, Instant::now());
        if state.tokens >= permits {
            state.tokens -= permits;
            Ok(())
        } else {
            Err(Self::time_until(&state, &self.config, permits))
        }
    }

    fn refill(state: &mut BucketState, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let replenished = elapsed.as_secs_f64() / config.per.as_secs_f64() * config.rate;
        state.tokens = (state.tokens + replenished).min(config.burst);
        state.last_refill = now;
    }

    fn time_until(state: &BucketState, config: &RateLimitConfig, permits: f64) -> Duration {
        let shortfall = permits - state.tokens;
        Duration::from_secs_f64(shortfall * config.per.as_secs_f64() / config.rate)
    }

    fn deny_oversized(&self, permits: f64) {
        self.total_denied.fetch_add(1, Ordering::Relaxed);
        record_rate_limit_denied(&self.name);
        tracing::warn!(
            name = %self.name,
            permits,
            burst = self.config.burst,
            "Requested permits exceed burst capacity"
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Several buckets behind one admission decision.
///
/// A request is admitted only when every member admits it. Members are
/// consulted in order, so put the most restrictive bucket first: tokens
/// taken from earlier members before a later denial are not refunded,
/// which deliberately under-counts remaining quota rather than over-using
/// a provider budget.
#[derive(Debug)]
pub struct CompositeRateLimiter {
    limiters: Vec<Arc<TokenBucket>>,
}

impl CompositeRateLimiter {
    /// Combine `limiters` into one gate. An empty composite admits every
    /// request.
    #[must_use]
    pub const fn new(limiters: Vec<Arc<TokenBucket>>) -> Self {
        Self { limiters }
    }

    /// Take one permit from every member, without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exceeded`] naming the first member that
    /// denied the request.
    pub fn try_acquire(&self, permits: f64) -> Result<(), RateLimitError> {
        for limiter in &self.limiters {
            if !limiter.try_acquire(permits) {
                return Err(RateLimitError::Exceeded {
                    limit: limiter.name().to_owned(),
                    retry_after: limiter.wait_hint(permits),
                });
            }
        }
        Ok(())
    }

    /// Take one permit from every member, waiting up to `timeout` in total
    /// across all members.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exceeded`] naming the member that could
    /// not admit the request within the remaining budget.
    pub async fn acquire(&self, permits: f64, timeout: Duration) -> Result<(), RateLimitError> {
        let start = Instant::now();
        for limiter in &self.limiters {
            let remaining = timeout.saturating_sub(start.elapsed());
            if !limiter.wait_for_token(permits, remaining).await {
                return Err(RateLimitError::Exceeded {
                    limit: limiter.name().to_owned(),
                    retry_after: limiter.wait_hint(permits),
                });
            }
        }
        Ok(())
    }

    /// Current token count of each member, in construction order.
    #[must_use]
    pub fn tokens(&self) -> Vec<f64> {
        self.limiters.iter().map(|limiter| limiter.tokens()).collect()
    }
}
