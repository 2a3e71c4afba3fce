//! Realtime connection lifecycle for the support widget.
//!
//! A [`ConnectionContext`] holds everything one widget instance shares: the
//! channel registry, circuit breakers, the installed transport client and the
//! event streams. [`ConnectionManager`] drives connect/reconnect/cleanup,
//! [`Messenger`] offers subscribe/publish with transparent queueing, and
//! [`ReconnectionScheduler`] runs the backoff loop.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod memory;
pub mod messaging;
#[cfg(feature = "nats")]
pub mod nats;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use auth::{
    AuthError, AuthToken, AuthTokenSource, HttpTokenSource, SharedTokenSource, StaticTokenSource,
};
pub use config::RealtimeConfig;
pub use connection::{ConnectionManager, SECURITY_CIRCUIT};
pub use context::{ClientSlot, ConnectionContext, Listener, ListenerId};
pub use error::RealtimeError;
pub use events::{ConnectionEvent, LocalEvent};
pub use memory::{ConnectBehavior, MemoryChannel, MemoryClient, MemoryTransport};
pub use messaging::{Messenger, PublishOutcome, SubscriptionHandle};
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use registry::{ChannelRegistry, PendingMessage, Subscription, is_valid_channel_name};
pub use scheduler::{AttemptOutcome, ReconnectPolicy, ReconnectionScheduler, SchedulerError};
pub use state::{ConnectionStatus, RawTransportState};
pub use transport::{
    ChannelHealth, InboundMessage, RealtimeTransport, SharedChannel, SharedClient,
    SharedTransport, TransportChannel, TransportClient, TransportError,
};
