use std::time::Duration;

use thiserror::Error;

/// Errors that can carry an HTTP-like response status.
///
/// Retry classification only looks at the status; errors without one are
/// always considered retryable.
pub trait ResponseStatus {
    fn response_status(&self) -> Option<u16>;
}

/// Outcome of a call guarded by a circuit breaker.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The named circuit is open and the operation was not invoked.
    #[error("circuit '{circuit}' is open; retry in {retry_in:?}")]
    CircuitOpen { circuit: String, retry_in: Duration },
    /// The operation ran and failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            ResilienceError::Operation(err) => Some(err),
            ResilienceError::CircuitOpen { .. } => None,
        }
    }
}

impl<E: ResponseStatus> ResponseStatus for ResilienceError<E> {
    fn response_status(&self) -> Option<u16> {
        match self {
            ResilienceError::Operation(err) => err.response_status(),
            ResilienceError::CircuitOpen { .. } => None,
        }
    }
}

/// Plain status-bearing error for callers that do not go through reqwest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed with status {status}: {message}")]
pub struct HttpStatusError {
    pub status: u16,
    pub message: String,
}

impl HttpStatusError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl ResponseStatus for HttpStatusError {
    fn response_status(&self) -> Option<u16> {
        Some(self.status)
    }
}

impl ResponseStatus for reqwest::Error {
    fn response_status(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }
}

impl ResponseStatus for anyhow::Error {
    fn response_status(&self) -> Option<u16> {
        self.chain().find_map(|cause| {
            if let Some(err) = cause.downcast_ref::<HttpStatusError>() {
                return Some(err.status);
            }
            cause
                .downcast_ref::<reqwest::Error>()
                .and_then(ResponseStatus::response_status)
        })
    }
}
