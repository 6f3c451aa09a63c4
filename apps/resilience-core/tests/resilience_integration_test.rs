//! Resilience Integration Tests
//!
//! End-to-end tests that run flaky provider calls through the full
//! admission path: the shared registry, composite rate limits, and the
//! circuit breaker lifecycle from trip through recovery.
//!
//! These tests simulate realistic provider behavior:
//! - Outages that heal after a few failures
//! - Client errors that should never trip a breaker
//! - Per-minute and per-day quota windows enforced together
//! - Thread-based callers sharing one breaker with async callers' rules

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::float_cmp)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use resilience_core::{
    BlockingCircuitBreaker, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState, CompositeRateLimiter, RateLimitConfig, RateLimitError, ResilienceRegistry,
    TokenBucket,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
enum ProviderError {
    #[error("provider unavailable")]
    Unavailable,
    #[error("symbol not found")]
    NotFound,
}

/// Provider double that fails a fixed number of times before recovering.
struct FlakyProvider {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyProvider {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    async fn fetch(&self) -> Result<&'static str, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::Unavailable);
        }
        Ok("option_chain")
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Breaker configuration small enough to exercise recovery in a test.
fn quick_breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(200),
        success_threshold: 1,
    }
}

// ============================================
// Circuit Breaker Lifecycle
// ============================================

#[tokio::test]
async fn test_breaker_trips_recovers_and_closes() {
    let breaker = CircuitBreaker::new("chain_provider", quick_breaker_config())
        .expect("config should be valid");
    let provider = FlakyProvider::new(3);

    for _ in 0..3 {
        let result = breaker.call(|| provider.fetch()).await;
        assert!(matches!(result, Err(CircuitBreakerError::Service(_))));
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Rejected without reaching the provider.
    let before = provider.calls();
    let Err(CircuitBreakerError::Open { name, retry_after }) =
        breaker.call(|| provider.fetch()).await
    else {
        panic!("open breaker should reject");
    };
    assert_eq!(name, "chain_provider");
    assert!(retry_after <= Duration::from_millis(200));
    assert_eq!(provider.calls(), before);

    // After the recovery timeout the provider is healthy again; the trial
    // call succeeds and the circuit closes.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let result = breaker.call(|| provider.fetch()).await;
    assert_eq!(result.expect("trial call should pass"), "option_chain");
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_failed_trial_call_reopens_circuit() {
    let breaker = CircuitBreaker::new("chain_provider", quick_breaker_config())
        .expect("config should be valid");
    let provider = FlakyProvider::new(4);

    for _ in 0..3 {
        let _ = breaker.call(|| provider.fetch()).await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    // First trial lands on a still-broken provider and reopens the circuit.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let result = breaker.call(|| provider.fetch()).await;
    assert!(matches!(
        result,
        Err(CircuitBreakerError::Service(ProviderError::Unavailable))
    ));
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Second recovery window; the provider has healed.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(breaker.call(|| provider.fetch()).await.is_ok());
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_client_errors_do_not_trip_breaker() {
    let breaker = CircuitBreaker::new("chain_provider", quick_breaker_config())
        .expect("config should be valid");

    // A delisted symbol is the caller's problem, not the provider's.
    for _ in 0..5 {
        let result = breaker
            .call_filtered(
                |err| *err == ProviderError::Unavailable,
                || async { Err::<&'static str, _>(ProviderError::NotFound) },
            )
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Service(ProviderError::NotFound))
        ));
    }

    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.stats().await.total_failures, 0);
}

#[tokio::test]
async fn test_stats_reflect_trip_and_recovery() {
    let breaker =
        CircuitBreaker::new("stats_provider", quick_breaker_config()).expect("config should be valid");
    let provider = FlakyProvider::new(3);

    for _ in 0..3 {
        let _ = breaker.call(|| provider.fetch()).await;
    }
    let _ = breaker.call(|| provider.fetch()).await; // rejected
    tokio::time::sleep(Duration::from_millis(250)).await;
    breaker
        .call(|| provider.fetch())
        .await
        .expect("trial call should pass");

    let stats = breaker.stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.total_calls, 5);
    assert_eq!(stats.total_failures, 3);
    assert_eq!(stats.total_rejections, 1);
    // CLOSED -> OPEN -> HALF_OPEN -> CLOSED
    assert_eq!(stats.state_transitions, 3);
    // The rejected call never reached the provider.
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn test_provider_error_surfaces_unchanged() {
    let breaker =
        CircuitBreaker::new("taxonomy", quick_breaker_config()).expect("config should be valid");

    let result = breaker
        .call(|| async { Err::<&'static str, _>(ProviderError::NotFound) })
        .await;

    let Err(CircuitBreakerError::Service(inner)) = result else {
        panic!("service error should pass through");
    };
    assert_eq!(inner, ProviderError::NotFound);
    assert_eq!(inner.to_string(), "symbol not found");
}

// ============================================
// Decorators
// ============================================

#[tokio::test]
async fn test_decorators_share_breaker_state() {
    let breaker = Arc::new(
        CircuitBreaker::new("sentiment", quick_breaker_config()).expect("config should be valid"),
    );

    let failing = breaker.wrap(|| async { Err::<&'static str, _>(ProviderError::Unavailable) });
    let healthy = breaker.wrap(|| async { Ok::<_, ProviderError>("bullish") });

    for _ in 0..3 {
        let _ = failing.invoke().await;
    }

    // The healthy decorator is rejected too: one breaker, one failure record.
    let result = healthy.invoke().await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(healthy.breaker().stats().await.total_rejections, 1);
}

// ============================================
// Blocking Callers
// ============================================

#[test]
fn test_blocking_breaker_trips_from_worker_threads() {
    let breaker = Arc::new(
        BlockingCircuitBreaker::new("warm_cache_job", quick_breaker_config())
            .expect("config should be valid"),
    );

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            std::thread::spawn(move || {
                breaker.call(|| Err::<(), ProviderError>(ProviderError::Unavailable))
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().expect("thread should not panic").is_err());
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    let result = breaker.call(|| Ok::<_, ProviderError>("ignored"));
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));

    // Same recovery rules as the async variant.
    std::thread::sleep(Duration::from_millis(250));
    let result = breaker.call(|| Ok::<_, ProviderError>("healed"));
    assert_eq!(result.expect("trial call should pass"), "healed");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// ============================================
// Rate Limiting
// ============================================

#[tokio::test]
async fn test_composite_enforces_both_quota_windows() {
    let per_minute = Arc::new(
        TokenBucket::new("news_minute", RateLimitConfig::per_minute(3.0))
            .expect("config should be valid"),
    );
    let per_day = Arc::new(
        TokenBucket::new("news_day", RateLimitConfig::per_day(100.0))
            .expect("config should be valid"),
    );
    let composite =
        CompositeRateLimiter::new(vec![Arc::clone(&per_minute), Arc::clone(&per_day)]);

    for _ in 0..3 {
        composite.try_acquire(1.0).expect("burst should be admitted");
    }

    let Err(RateLimitError::Exceeded { limit, retry_after }) = composite.try_acquire(1.0) else {
        panic!("fourth call should be denied");
    };
    assert_eq!(limit, "news_minute");
    assert!(retry_after > Duration::ZERO);

    // The day bucket was only charged for the three admitted calls.
    assert!((per_day.tokens() - 97.0).abs() < 0.1);
}

#[tokio::test]
async fn test_day_quota_denial_keeps_minute_tokens_spent() {
    let per_minute = Arc::new(
        TokenBucket::new("minute", RateLimitConfig::per_minute(10.0))
            .expect("config should be valid"),
    );
    let per_day = Arc::new(
        TokenBucket::new("day", RateLimitConfig::per_day(2.0)).expect("config should be valid"),
    );
    let composite =
        CompositeRateLimiter::new(vec![Arc::clone(&per_minute), Arc::clone(&per_day)]);

    composite.try_acquire(1.0).expect("first call admitted");
    composite.try_acquire(1.0).expect("second call admitted");

    let before = per_minute.tokens();
    let Err(RateLimitError::Exceeded { limit, .. }) = composite.try_acquire(1.0) else {
        panic!("day quota should deny the third call");
    };
    assert_eq!(limit, "day");
    // The minute token spent before the day denial stays spent.
    assert!(per_minute.tokens() < before);
}

#[tokio::test]
async fn test_wait_for_token_after_burst_drain() {
    let bucket = TokenBucket::new("chain_quota", RateLimitConfig::new(5.0, Duration::from_secs(1)))
        .expect("config should be valid");

    for _ in 0..5 {
        assert!(bucket.try_acquire(1.0));
    }
    assert!(!bucket.try_acquire(1.0));

    // Refill runs at 5 tokens/sec, so the next token lands roughly 200ms out.
    let start = Instant::now();
    assert!(bucket.wait_for_token(1.0, Duration::from_secs(2)).await);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
    assert!(waited < Duration::from_secs(1), "waited {waited:?}");
}

#[tokio::test]
async fn test_acquire_sleeps_for_refill() {
    let bucket = TokenBucket::new("slow_quota", RateLimitConfig::new(10.0, Duration::from_secs(1)))
        .expect("config should be valid");
    for _ in 0..10 {
        assert!(bucket.try_acquire(1.0));
    }

    let start = Instant::now();
    assert!(bucket.acquire(1.0).await);
    assert!(start.elapsed() >= Duration::from_millis(80));
}

// ============================================
// Registry Composition
// ============================================

#[tokio::test]
async fn test_registry_composes_limiter_and_breaker() {
    let registry = ResilienceRegistry::with_defaults();
    let limiter = registry
        .limiter_with(
            "earnings_quota",
            RateLimitConfig::new(10.0, Duration::from_secs(60)),
        )
        .expect("config should be valid");
    let breaker = registry
        .breaker_with("earnings_provider", quick_breaker_config())
        .expect("config should be valid");
    let provider = FlakyProvider::new(0);

    // Quota check gates the provider call; both admit while healthy.
    for _ in 0..4 {
        assert!(limiter.try_acquire(1.0));
        let result = breaker.call(|| provider.fetch()).await;
        assert!(result.is_ok());
    }

    assert!(limiter.tokens() < 7.0);
    let stats = breaker.stats().await;
    assert_eq!(stats.total_calls, 4);
    assert_eq!(stats.total_failures, 0);

    // The same names resolve to the same instances elsewhere in the app.
    assert!(Arc::ptr_eq(&limiter, &registry.limiter("earnings_quota")));
    assert!(Arc::ptr_eq(&breaker, &registry.breaker("earnings_provider")));
}

#[tokio::test]
async fn test_registry_reports_across_components() {
    let registry = ResilienceRegistry::with_defaults();
    let breaker = registry
        .breaker_with("flaky", quick_breaker_config())
        .expect("config should be valid");
    let limiter = registry.limiter("quota");

    let _ = breaker
        .call(|| async { Err::<(), _>(ProviderError::Unavailable) })
        .await;
    assert!(limiter.try_acquire(1.0));

    let stats = registry.breaker_stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total_failures, 1);

    let levels = registry.limiter_levels();
    assert_eq!(levels.len(), 1);
    assert!(levels[0].1 < 60.0);
}
