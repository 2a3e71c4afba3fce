use std::time::Duration;

use thiserror::Error;
use widget_resilience::ResilienceError;

use crate::auth::AuthError;
use crate::state::RawTransportState;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime authentication failed")]
    Auth(#[source] AuthError),
    #[error("circuit '{circuit}' is open; retry in {retry_in:?}")]
    CircuitOpen { circuit: String, retry_in: Duration },
    #[error("transport error")]
    Transport(#[from] TransportError),
    #[error("connection not established within {0:?}")]
    Timeout(Duration),
    #[error("handshake ended in state {0}")]
    HandshakeFailed(RawTransportState),
}

impl RealtimeError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RealtimeError::CircuitOpen { .. })
    }
}

impl From<ResilienceError<AuthError>> for RealtimeError {
    fn from(err: ResilienceError<AuthError>) -> Self {
        match err {
            ResilienceError::CircuitOpen { circuit, retry_in } => {
                RealtimeError::CircuitOpen { circuit, retry_in }
            }
            ResilienceError::Operation(err) => RealtimeError::Auth(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_maps_through() {
        let err: RealtimeError = ResilienceError::<AuthError>::CircuitOpen {
            circuit: "security".into(),
            retry_in: Duration::from_secs(3),
        }
        .into();
        assert!(err.is_circuit_open());

        let err: RealtimeError = ResilienceError::Operation(AuthError::EmptyToken).into();
        assert!(matches!(err, RealtimeError::Auth(AuthError::EmptyToken)));
    }
}
