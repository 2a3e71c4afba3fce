use serde::Serialize;
use serde_json::Value;

use crate::state::{ConnectionStatus, RawTransportState};

/// Lifecycle notifications broadcast by a [`crate::ConnectionContext`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    StatusChanged {
        status: ConnectionStatus,
        raw: RawTransportState,
    },
    FallbackEnabled,
    FallbackCleared,
    PendingChanged {
        count: usize,
    },
}

/// Synthetic event raised when a publish is queued instead of delivered, so
/// the local UI can render the message optimistically.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalEvent {
    pub name: String,
    pub channel: String,
    pub event: String,
    pub data: Value,
}

impl LocalEvent {
    pub fn new(channel: &str, event: &str, data: Value) -> Self {
        Self {
            name: format!("local:{channel}:{event}"),
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        }
    }
}
