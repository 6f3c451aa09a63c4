//! Shared circuit breaker state machine.
//!
//! The transition rules live here, free of locks and clock reads, so the
//! async and blocking variants cannot drift apart. Callers pass
//! `Instant::now()` in and handle logging/metrics for any returned
//! [`Transition`] themselves.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (failure_threshold consecutive failures)
//! OPEN → HALF_OPEN (recovery_timeout elapsed)
//! HALF_OPEN → CLOSED (success_threshold trial successes)
//! HALF_OPEN → OPEN (trial call fails)
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is testing the dependency with trial calls.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that trip the circuit.
    pub failure_threshold: u32,
    /// Time to stay open before admitting a trial call.
    pub recovery_timeout: Duration,
    /// Trial successes required in `HALF_OPEN` before the circuit closes.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for quote and option chain providers.
    ///
    /// Trips fast and demands two clean trials before closing; a flapping
    /// data feed poisons every metric computed downstream.
    #[must_use]
    pub const fn market_data() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }

    /// Configuration for the earnings calendar provider.
    ///
    /// Daily data; tolerate more failures and stay open longer.
    #[must_use]
    pub const fn earnings() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(120),
            success_threshold: 1,
        }
    }

    /// Configuration for sentiment feed providers.
    #[must_use]
    pub const fn sentiment() -> Self {
        Self {
            failure_threshold: 4,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }

    /// Reject values that could never admit or trip a call.
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if self.success_threshold == 0 {
            return Err(BreakerConfigError::ZeroSuccessThreshold);
        }
        if self.recovery_timeout.is_zero() {
            return Err(BreakerConfigError::ZeroRecoveryTimeout);
        }
        Ok(())
    }
}

/// Configuration rejected at breaker construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BreakerConfigError {
    /// A breaker that trips after zero failures would never close.
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    /// A breaker requiring zero successes could never leave `HALF_OPEN`.
    #[error("success_threshold must be at least 1")]
    ZeroSuccessThreshold,
    /// A zero recovery timeout would re-admit calls immediately.
    #[error("recovery_timeout must be non-zero")]
    ZeroRecoveryTimeout,
}

/// Admission decision for a guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Admission {
    /// The call may proceed.
    Allowed,
    /// The breaker just moved to `HALF_OPEN`; this call is the trial.
    AllowedProbe,
    /// The circuit is open; reject without invoking the call.
    Rejected {
        /// Time until the next trial call will be admitted.
        retry_after: Duration,
    },
}

/// A state change produced by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Transition {
    /// State before the change.
    pub(super) from: CircuitState,
    /// State after the change.
    pub(super) to: CircuitState,
}

/// Pure transition logic shared by both breaker variants.
///
/// Both wrappers hold this behind their own exclusion mechanism; every
/// method is plain arithmetic, safe inside any critical section.
#[derive(Debug)]
pub(super) struct BreakerCore {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

impl BreakerCore {
    pub(super) const fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }

    pub(super) const fn state(&self) -> CircuitState {
        self.state
    }

    pub(super) const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub(super) const fn success_count(&self) -> u32 {
        self.success_count
    }

    /// Apply the time-based `OPEN` → `HALF_OPEN` transition when due.
    pub(super) fn refresh(&mut self, now: Instant) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self
            .last_failure_time
            .map_or(self.config.recovery_timeout, |at| now.duration_since(at));
        if elapsed < self.config.recovery_timeout {
            return None;
        }
        self.state = CircuitState::HalfOpen;
        self.success_count = 0;
        Some(Transition {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        })
    }

    /// Decide whether a call may proceed, applying the recovery transition.
    pub(super) fn try_admit(&mut self, now: Instant) -> Admission {
        let probed = self.refresh(now).is_some();
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                if probed {
                    Admission::AllowedProbe
                } else {
                    Admission::Allowed
                }
            }
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map_or(Duration::ZERO, |at| now.duration_since(at));
                Admission::Rejected {
                    retry_after: self.config.recovery_timeout.saturating_sub(elapsed),
                }
            }
        }
    }

    /// Record a successful call.
    pub(super) fn record_success(&mut self) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                (self.success_count >= self.config.success_threshold)
                    .then(|| self.enter_closed())
            }
            // A call admitted before the trip finished late; the open timer
            // stands.
            CircuitState::Open => None,
        }
    }

    /// Record a counted failure.
    pub(super) fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                self.last_failure_time = Some(now);
                (self.failure_count >= self.config.failure_threshold)
                    .then(|| self.enter_open(now))
            }
            // The trial failed; straight back to open with a fresh timer.
            CircuitState::HalfOpen => Some(self.enter_open(now)),
            CircuitState::Open => None,
        }
    }

    /// Return to `CLOSED` with counters zeroed.
    pub(super) fn reset(&mut self) -> Option<Transition> {
        let transition = self.enter_closed();
        (transition.from != CircuitState::Closed).then_some(transition)
    }

    /// Trip the circuit regardless of counters, re-arming the timer.
    pub(super) fn force_open(&mut self, now: Instant) -> Option<Transition> {
        let transition = self.enter_open(now);
        (transition.from != CircuitState::Open).then_some(transition)
    }

    fn enter_closed(&mut self) -> Transition {
        let from = self.state;
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_time = None;
        Transition {
            from,
            to: CircuitState::Closed,
        }
    }

    fn enter_open(&mut self, now: Instant) -> Transition {
        let from = self.state;
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.last_failure_time = Some(now);
        Transition {
            from,
            to: CircuitState::Open,
        }
    }
}
