//! Blocking circuit breaker for thread-based callers.
//!
//! Same transition rules as the async variant, guarded by a standard mutex.
//! For code running on plain OS threads (scheduler workers, `spawn_blocking`
//! sections) where no runtime handle is available.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::observability::metrics::{
    record_circuit_breaker_failure, record_circuit_breaker_rejected,
    record_circuit_breaker_success,
};

use super::breaker::{CircuitBreakerError, CircuitBreakerStats};
use super::state::{
    Admission, BreakerConfigError, BreakerCore, CircuitBreakerConfig, CircuitState, Transition,
};

/// Circuit breaker for synchronous calls.
///
/// The mutex is held only for transition arithmetic; the guarded operation
/// runs outside the critical section.
#[derive(Debug)]
pub struct BlockingCircuitBreaker {
    name: String,
    core: Mutex<BreakerCore>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    state_transitions: AtomicU64,
}

impl BlockingCircuitBreaker {
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
        Ok(Self {
            name: name.into(),
            core: Mutex::new(BreakerCore::new(config)),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        })
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
    pub fn call<F, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.call_filtered(|_| true, op)
    }

    /// Run `op` if the circuit admits it, counting only errors selected by
    /// `counts_as_failure` toward the trip threshold.
    ///
    /// # Errors
    ///
    /// Same contract as [`BlockingCircuitBreaker::call`].
    pub fn call_filtered<P, F, T, E>(
        &self,
        counts_as_failure: P,
        op: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        P: FnOnce(&E) -> bool,
        F: FnOnce() -> Result<T, E>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let admission = self.lock_core().try_admit(Instant::now());
        match admission {
            Admission::Allowed => {}
            Admission::AllowedProbe => self.note_transition(Transition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen,
            }),
            Admission::Rejected { retry_after } => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                record_circuit_breaker_rejected(&self.name);
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        }

        match op() {
            Ok(value) => {
                record_circuit_breaker_success(&self.name);
                let transition = self.lock_core().record_success();
                if let Some(transition) = transition {
                    self.note_transition(transition);
                }
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    record_circuit_breaker_failure(&self.name);
                    let transition = self.lock_core().record_failure(Instant::now());
                    if let Some(transition) = transition {
                        self.note_transition(transition);
                    }
                }
                Err(CircuitBreakerError::Service(error))
            }
        }
    }

    /// Current state, applying the recovery transition when due.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut core = self.lock_core();
            let transition = core.refresh(Instant::now());
            (core.state(), transition)
        };
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
        state
    }

    /// Whether the circuit is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Snapshot state and counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let (state, failure_count, success_count, transition) = {
            let mut core = self.lock_core();
            let transition = core.refresh(Instant::now());
            (
                core.state(),
                core.failure_count(),
                core.success_count(),
                transition,
            )
        };
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
    pub fn reset(&self) {
        let transition = self.lock_core().reset();
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
    }

    /// Trip the circuit manually.
    pub fn force_open(&self) {
        let transition = self.lock_core().force_open(Instant::now());
        if let Some(transition) = transition {
            self.note_transition(transition);
        }
    }

    /// Close the circuit manually.
    pub fn force_close(&self) {
        self.reset();
    }

    fn lock_core(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_transition(&self, transition: Transition) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        super::publish_transition(&self.name, transition);
    }
}
