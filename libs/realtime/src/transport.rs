//! Seam between the connection manager and a concrete pub/sub client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::auth::AuthToken;
use crate::state::RawTransportState;

/// Message delivered to a channel-level subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

/// Per-channel attachment state reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelHealth {
    Attached,
    Detached,
    Failed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("channel '{channel}' error: {reason}")]
    Channel { channel: String, reason: String },
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens a client authenticated with `token`. The returned client may
    /// still be connecting; callers observe [`TransportClient::state_changes`].
    async fn connect(&self, token: &AuthToken) -> Result<SharedClient, TransportError>;
}

#[async_trait]
pub trait TransportClient: Send + Sync {
    fn state(&self) -> RawTransportState;

    fn state_changes(&self) -> watch::Receiver<RawTransportState>;

    /// Returns the channel called `name`, creating it on first use.
    fn channel(&self, name: &str) -> SharedChannel;

    async fn reconnect(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn attach(&self) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        event: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError>;

    /// Drops transport listeners for `event`, or for every event when `None`.
    async fn unsubscribe(&self, event: Option<&str>);

    async fn publish(&self, event: &str, data: &Value) -> Result<(), TransportError>;

    fn health(&self) -> broadcast::Receiver<ChannelHealth>;
}

pub type SharedTransport = Arc<dyn RealtimeTransport>;
pub type SharedClient = Arc<dyn TransportClient>;
pub type SharedChannel = Arc<dyn TransportChannel>;
