//! NATS-backed transport: channels map to subjects `{channel}.{event}`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::auth::AuthToken;
use crate::state::RawTransportState;
use crate::transport::{
    ChannelHealth, InboundMessage, RealtimeTransport, SharedChannel, SharedClient,
    TransportChannel, TransportClient, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn map_event(event: &Event) -> Option<RawTransportState> {
    match event {
        Event::Connected => Some(RawTransportState::Connected),
        Event::Disconnected => Some(RawTransportState::Disconnected),
        Event::LameDuckMode => Some(RawTransportState::Suspended),
        _ => None,
    }
}

fn subject(channel: &str, event: &str) -> String {
    format!("{channel}.{event}")
}

#[derive(Clone, Debug)]
pub struct NatsTransport {
    server_url: String,
}

impl NatsTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl RealtimeTransport for NatsTransport {
    async fn connect(&self, token: &AuthToken) -> Result<SharedClient, TransportError> {
        let (state, _) = watch::channel(RawTransportState::Connecting);
        let state = Arc::new(state);
        let events = state.clone();
        let client = ConnectOptions::with_token(token.token.clone())
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    debug!(?event, "nats connection event");
                    if let Some(raw) = map_event(&event) {
                        events.send_replace(raw);
                    }
                }
            })
            .connect(self.server_url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        state.send_replace(RawTransportState::Connected);
        Ok(Arc::new(NatsClient {
            client,
            state,
            channels: Mutex::new(HashMap::new()),
        }) as SharedClient)
    }
}

pub struct NatsClient {
    client: async_nats::Client,
    state: Arc<watch::Sender<RawTransportState>>,
    channels: Mutex<HashMap<String, Arc<NatsChannel>>>,
}

#[async_trait]
impl TransportClient for NatsClient {
    fn state(&self) -> RawTransportState {
        *self.state.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<RawTransportState> {
        self.state.subscribe()
    }

    fn channel(&self, name: &str) -> SharedChannel {
        lock(&self.channels)
            .entry(name.to_string())
            .or_insert_with(|| {
                let (health, _) = broadcast::channel(16);
                Arc::new(NatsChannel {
                    name: name.to_string(),
                    client: self.client.clone(),
                    state: self.state.subscribe(),
                    forwarders: Mutex::new(Vec::new()),
                    health,
                })
            })
            .clone()
    }

    /// The NATS client reconnects on its own; this only resyncs the state.
    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.state() == RawTransportState::Closed {
            return Err(TransportError::Closed);
        }
        if self.client.connection_state() == async_nats::connection::State::Connected {
            self.state.send_replace(RawTransportState::Connected);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.send_replace(RawTransportState::Closing);
        if let Err(err) = self.client.flush().await {
            debug!(error = %err, "flush before close failed");
        }
        let channels: Vec<_> = lock(&self.channels).drain().map(|(_, ch)| ch).collect();
        for channel in channels {
            channel.stop_forwarders(None);
        }
        self.state.send_replace(RawTransportState::Closed);
        Ok(())
    }
}

pub struct NatsChannel {
    name: String,
    client: async_nats::Client,
    state: watch::Receiver<RawTransportState>,
    forwarders: Mutex<Vec<(String, JoinHandle<()>)>>,
    health: broadcast::Sender<ChannelHealth>,
}

impl NatsChannel {
    fn stop_forwarders(&self, event: Option<&str>) {
        lock(&self.forwarders).retain(|(subscribed, handle)| {
            let stop = event.is_none_or(|event| subscribed == event);
            if stop {
                handle.abort();
            }
            !stop
        });
    }
}

#[async_trait]
impl TransportChannel for NatsChannel {
    fn name(&self) -> &str {
        &self.name
    }

    /// Subjects need no attach step.
    async fn attach(&self) -> Result<(), TransportError> {
        if *self.state.borrow() == RawTransportState::Closed {
            return Err(TransportError::Closed);
        }
        let _ = self.health.send(ChannelHealth::Attached);
        Ok(())
    }

    async fn subscribe(
        &self,
        event: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError> {
        let mut subscriber = self
            .client
            .subscribe(subject(&self.name, event))
            .await
            .map_err(|err| TransportError::Channel {
                channel: self.name.clone(),
                reason: err.to_string(),
            })?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = self.name.clone();
        let event_name = event.to_string();
        let health = self.health.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let data = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&message.payload).into_owned())
                });
                let inbound = InboundMessage {
                    channel: channel.clone(),
                    event: event_name.clone(),
                    data,
                };
                if sender.send(inbound).is_err() {
                    return;
                }
            }
            warn!(channel = %channel, event = %event_name, "nats subscription ended");
            let _ = health.send(ChannelHealth::Detached);
        });
        lock(&self.forwarders).push((event.to_string(), forwarder));
        Ok(receiver)
    }

    async fn unsubscribe(&self, event: Option<&str>) {
        self.stop_forwarders(event);
    }

    async fn publish(&self, event: &str, data: &Value) -> Result<(), TransportError> {
        if *self.state.borrow() != RawTransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let payload = serde_json::to_vec(data).map_err(anyhow::Error::from)?;
        self.client
            .publish(subject(&self.name, event), payload.into())
            .await
            .map_err(|err| TransportError::Channel {
                channel: self.name.clone(),
                reason: err.to_string(),
            })
    }

    fn health(&self) -> broadcast::Receiver<ChannelHealth> {
        self.health.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_connection_events() {
        assert_eq!(map_event(&Event::Connected), Some(RawTransportState::Connected));
        assert_eq!(map_event(&Event::Disconnected), Some(RawTransportState::Disconnected));
        assert_eq!(map_event(&Event::LameDuckMode), Some(RawTransportState::Suspended));
    }

    #[test]
    fn subjects_join_channel_and_event() {
        assert_eq!(subject("widget:conversation:5", "message"), "widget:conversation:5.message");
    }
}
