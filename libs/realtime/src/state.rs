use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection states reported by the realtime transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawTransportState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Failed,
    Closing,
    Closed,
}

impl RawTransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawTransportState::Initialized => "initialized",
            RawTransportState::Connecting => "connecting",
            RawTransportState::Connected => "connected",
            RawTransportState::Disconnected => "disconnected",
            RawTransportState::Suspended => "suspended",
            RawTransportState::Failed => "failed",
            RawTransportState::Closing => "closing",
            RawTransportState::Closed => "closed",
        }
    }

    /// States that start the local-fallback dwell timer.
    pub fn is_degraded(&self) -> bool {
        matches!(self, RawTransportState::Suspended | RawTransportState::Failed)
    }
}

impl fmt::Display for RawTransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simplified status surfaced to the rendering layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RawTransportState> for ConnectionStatus {
    fn from(raw: RawTransportState) -> Self {
        match raw {
            RawTransportState::Connecting => ConnectionStatus::Connecting,
            RawTransportState::Connected => ConnectionStatus::Connected,
            RawTransportState::Failed => ConnectionStatus::Failed,
            RawTransportState::Initialized
            | RawTransportState::Disconnected
            | RawTransportState::Suspended
            | RawTransportState::Closing
            | RawTransportState::Closed => ConnectionStatus::Disconnected,
        }
    }
}
