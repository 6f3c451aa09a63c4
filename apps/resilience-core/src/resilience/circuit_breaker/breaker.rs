//! Asynchronous circuit breaker guarding awaited provider calls.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::observability::metrics::{
    record_circuit_breaker_failure, record_circuit_breaker_rejected,
    record_circuit_breaker_success,
};

use super::state::{
    Admission, BreakerConfigError, BreakerCore, CircuitBreakerConfig, CircuitState, Transition,
};

const CLOSED_TAG: u8 = 0;
const OPEN_TAG: u8 = 1;
const HALF_OPEN_TAG: u8 = 2;

const fn tag_for(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => CLOSED_TAG,
        CircuitState::Open => OPEN_TAG,
        CircuitState::HalfOpen => HALF_OPEN_TAG,
    }
}

/// Error returned by guarded calls.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open and the call was rejected without running.
    #[error("circuit breaker '{name}' is open, retry in {}s", retry_after.as_secs())]
    Open {
        /// Breaker name.
        name: String,
        /// Time until the next trial call will be admitted.
        retry_after: Duration,
    },
    /// The call ran and failed; the inner error passes through unchanged.
    #[error(transparent)]
    Service(#[from] E),
}

/// Point-in-time view of a breaker's state and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive counted failures observed in `CLOSED`.
    pub failure_count: u32,
    /// Trial successes observed in the current `HALF_OPEN` period.
    pub success_count: u32,
    /// Calls attempted through this breaker.
    pub total_calls: u64,
    /// Calls that failed with an error the failure predicate counted.
    pub total_failures: u64,
    /// Calls rejected because the circuit was open.
    pub total_rejections: u64,
    /// State transitions since construction.
    pub state_transitions: u64,
}

/// Circuit breaker for awaited calls to external providers.
///
/// State sits behind a cooperative mutex held only for the transition
/// arithmetic; the guarded operation always runs outside it, so a slow
/// provider call never blocks other callers' admission checks.
///
/// # Example
///
/// ```rust,ignore
/// let breaker = CircuitBreaker::new("market_data", CircuitBreakerConfig::market_data())?;
/// let chain = breaker.call(|| client.fetch_chain("SPY")).await?;
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    core: Mutex<BreakerCore>,
    /// Mirror of the current state for lock-free reads.
    state_tag: AtomicU8,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerConfigError`] when a threshold is zero or the
    /// recovery timeout is zero.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self::from_validated(name, config))
    }

    /// Construct without validating; the caller has already run `validate`.
    pub(crate) fn from_validated(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            core: Mutex::new(BreakerCore::new(config)),
            state_tag: AtomicU8::new(CLOSED_TAG),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Get the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` if the circuit admits it, counting every error as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking `op` when the
    /// circuit is open, or [`CircuitBreakerError::Service`] carrying `op`'s
    /// own error unchanged.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(|_| true, op).await
    }

    /// Run `op` if the circuit admits it, counting only errors selected by
    /// `counts_as_failure` toward the trip threshold.
    ///
    /// Errors the predicate declines (a 404 on a delisted symbol, a
    /// validation rejection) propagate unchanged without touching breaker
    /// state: the dependency answered, it just did not like the question.
    ///
    /// # Errors
    ///
    /// Same contract as [`CircuitBreaker::call`].
    pub async fn call_filtered<P, F, Fut, T, E>(
        &self,
        counts_as_failure: P,
        op: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        P: FnOnce(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match self.admit().await {
            Admission::Allowed | Admission::AllowedProbe => {}
            Admission::Rejected { retry_after } => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                record_circuit_breaker_rejected(&self.name);
                tracing::debug!(
                    name = %self.name,
                    retry_in = ?retry_after,
                    "Call rejected, circuit is open"
                );
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        }

        // The guarded call runs without holding the breaker lock.
        match op().await {
            Ok(value) => {
                record_circuit_breaker_success(&self.name);
                self.record_outcome(true).await;
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    record_circuit_breaker_failure(&self.name);
                    self.record_outcome(false).await;
                }
                Err(CircuitBreakerError::Service(error))
            }
        }
    }

    /// Current state, applying the recovery transition when due.
    pub async fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut core = self.core.lock().await;
            let transition = core.refresh(Instant::now());
            (core.state(), transition)
        };
        self.state_tag.store(tag_for(state), Ordering::Relaxed);
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
        state
    }

    /// Whether the circuit was open at last observation.
    ///
    /// Lock-free read of the state mirror; [`CircuitBreaker::state`] is
    /// authoritative and also advances the recovery timer.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state_tag.load(Ordering::Relaxed) == OPEN_TAG
    }

    /// Snapshot state and counters.
    pub async fn stats(&self) -> CircuitBreakerStats {
        let (state, failure_count, success_count, transition) = {
            let mut core = self.core.lock().await;
            let transition = core.refresh(Instant::now());
            (
                core.state(),
                core.failure_count(),
                core.success_count(),
                transition,
            )
        };
        self.state_tag.store(tag_for(state), Ordering::Relaxed);
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
        CircuitBreakerStats {
            name: self.name.clone(),
            state,
            failure_count,
            success_count,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    /// Return the breaker to `CLOSED` with zeroed counters.
    pub async fn reset(&self) {
        let transition = {
            let mut core = self.core.lock().await;
            core.reset()
        };
        self.state_tag.store(CLOSED_TAG, Ordering::Relaxed);
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
    }

    /// Trip the circuit manually; the kill switch during provider incidents.
    pub async fn force_open(&self) {
        let transition = {
            let mut core = self.core.lock().await;
            core.force_open(Instant::now())
        };
        self.state_tag.store(OPEN_TAG, Ordering::Relaxed);
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
    }

    /// Close the circuit manually.
    pub async fn force_close(&self) {
        self.reset().await;
    }

    /// Bind an operation to this breaker in decorator form.
    #[must_use]
    pub fn wrap<F>(self: &Arc<Self>, op: F) -> Guarded<F> {
        Guarded::new(Arc::clone(self), op)
    }

    async fn admit(&self) -> Admission {
        let (admission, state) = {
            let mut core = self.core.lock().await;
            let admission = core.try_admit(Instant::now());
            (admission, core.state())
        };
        self.state_tag.store(tag_for(state), Ordering::Relaxed);
        if admission == Admission::AllowedProbe {
            self.note_transition(Transition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen,
            });
        }
        admission
    }

    async fn record_outcome(&self, success: bool) {
        let (state, transition) = {
            let mut core = self.core.lock().await;
            let transition = if success {
                core.record_success()
            } else {
                core.record_failure(Instant::now())
            };
            (core.state(), transition)
        };
        self.state_tag.store(tag_for(state), Ordering::Relaxed);
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
    }

    fn note_transition(&self, transition: Transition) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        super::publish_transition(&self.name, transition);
    }
}

/// An operation bound to a circuit breaker, in decorator form.
///
/// Holds the operation factory and a shared handle to its breaker; every
/// [`Guarded::invoke`] runs through the breaker's admission check, and all
/// decorators wrapping the same breaker share one failure record.
#[derive(Debug)]
pub struct Guarded<F> {
    breaker: Arc<CircuitBreaker>,
    op: F,
}

impl<F> Guarded<F> {
    /// Bind `op` to `breaker`.
    pub fn new(breaker: Arc<CircuitBreaker>, op: F) -> Self {
        Self { breaker, op }
    }

    /// The breaker guarding this operation.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl<F, Fut, T, E> Guarded<F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    /// Run the wrapped operation through the breaker.
    ///
    /// # Errors
    ///
    /// Same contract as [`CircuitBreaker::call`].
    pub async fn invoke(&self) -> Result<T, CircuitBreakerError<E>> {
        self.breaker.call(&self.op).await
    }
}
