//! Connects a mounted support widget to the realtime layer: waits for an
//! access token, connects, hands failures to the reconnection scheduler and
//! reports a single [`ConnectionStatus`] back to the shell.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod identity;
pub mod token;

pub use adapter::{StatusCallback, WidgetConnection, WidgetDeps, WidgetOptions};
pub use config::AdapterConfig;
pub use identity::{IdentitySnapshot, IdentityStore, MemoryIdentityStore, SharedIdentityStore};
pub use token::{SharedTokenProvider, TokenProvider, UrlTokenProvider};
pub use widget_realtime::{ConnectionStatus, Messenger, PublishOutcome};
