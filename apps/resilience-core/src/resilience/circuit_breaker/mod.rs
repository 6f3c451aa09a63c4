//! Circuit breakers guarding calls to external providers.
//!
//! One pure state machine, two lock disciplines: [`CircuitBreaker`] for
//! async callers and [`BlockingCircuitBreaker`] for plain threads. Both
//! trip after a run of consecutive failures, reject while open, and admit
//! trial calls once the recovery timeout has passed.

mod blocking;
mod breaker;
mod state;

pub use blocking::BlockingCircuitBreaker;
pub use breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats, Guarded};
pub use state::{BreakerConfigError, CircuitBreakerConfig, CircuitState};

use crate::observability::metrics::{circuit_breaker_state, record_circuit_breaker_state};

/// Log and export a state change; shared by both breaker variants.
fn publish_transition(name: &str, transition: state::Transition) {
    record_circuit_breaker_state(name, state_gauge(transition.to));
    match transition.to {
        CircuitState::Open => tracing::warn!(
            name = %name,
            from = %transition.from,
            to = "OPEN",
            "Circuit breaker opened"
        ),
        CircuitState::HalfOpen => tracing::info!(
            name = %name,
            from = %transition.from,
            to = "HALF_OPEN",
            "Circuit breaker testing"
        ),
        CircuitState::Closed => tracing::info!(
            name = %name,
            from = %transition.from,
            to = "CLOSED",
            "Circuit breaker closed"
        ),
    }
}

const fn state_gauge(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => circuit_breaker_state::CLOSED,
        CircuitState::Open => circuit_breaker_state::OPEN,
        CircuitState::HalfOpen => circuit_breaker_state::HALF_OPEN,
    }
}
