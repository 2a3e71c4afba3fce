//! Retry and circuit-breaker combinators used by every widget backend call.
//!
//! Circuit state lives in an explicitly constructed [`CircuitRegistry`] so
//! that independent widget instances (and tests) never share breakers.

#![forbid(unsafe_code)]

pub mod circuit;
pub mod error;
pub mod retry;

pub use circuit::{CircuitOptions, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use error::{HttpStatusError, ResilienceError, ResponseStatus};
pub use retry::{
    JITTER_MAX, JITTER_MIN, RetryOptions, apply_jitter, exponential_delay, with_retry,
};
