//! Failure isolation primitives used by the resync connection pools.
//!
//! - [`CircuitBreaker`]: per-resource CLOSED / OPEN / HALF_OPEN state machine
//!   over a sliding time window, with an atomic single-trial gate.
//! - [`RetryConfig`] + [`retry`]: bounded attempts with exponential backoff,
//!   used for connection construction.
//!
//! Timing goes through `tokio::time::Instant`, so both primitives follow a
//! paused test clock.

mod circuit_breaker;
mod error;
mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitStats, State, Transition,
    TransitionListener,
};
pub use error::{ConfigError, ConfigResult, RetryError};
pub use retry::{RetryConfig, retry};
