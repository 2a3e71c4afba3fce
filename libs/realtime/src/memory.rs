//! In-process transport with scriptable connection outcomes.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use crate::auth::AuthToken;
use crate::state::RawTransportState;
use crate::transport::{
    ChannelHealth, InboundMessage, RealtimeTransport, SharedChannel, SharedClient,
    TransportChannel, TransportClient, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of the next `connect` or `reconnect` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Client comes up `Connected`.
    Accept,
    /// Client stays `Connecting` until driven by the test.
    Hang,
    /// Client comes up `Failed`.
    Fail,
    /// The call itself returns an error.
    Reject,
}

type PublishLog = Arc<Mutex<Vec<InboundMessage>>>;
type PublishDelay = Arc<Mutex<Duration>>;

#[derive(Default)]
struct TransportInner {
    script: Mutex<VecDeque<ConnectBehavior>>,
    clients: Mutex<Vec<Arc<MemoryClient>>>,
    tokens: Mutex<Vec<String>>,
    published: PublishLog,
    publish_delay: PublishDelay,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<TransportInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of a future `connect`; unscripted calls accept.
    pub fn push_behavior(&self, behavior: ConnectBehavior) {
        lock(&self.inner.script).push_back(behavior);
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.inner.tokens).len()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        lock(&self.inner.tokens).clone()
    }

    pub fn clients(&self) -> Vec<Arc<MemoryClient>> {
        lock(&self.inner.clients).clone()
    }

    pub fn latest_client(&self) -> Option<Arc<MemoryClient>> {
        lock(&self.inner.clients).last().cloned()
    }

    /// Makes every publish, on current and future clients, take `delay`.
    pub fn set_publish_delay(&self, delay: Duration) {
        *lock(&self.inner.publish_delay) = delay;
    }

    /// Every message published through any client, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        lock(&self.inner.published).clone()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn connect(&self, token: &AuthToken) -> Result<SharedClient, TransportError> {
        lock(&self.inner.tokens).push(token.token.clone());
        let behavior = lock(&self.inner.script)
            .pop_front()
            .unwrap_or(ConnectBehavior::Accept);
        let initial = match behavior {
            ConnectBehavior::Accept => RawTransportState::Connected,
            ConnectBehavior::Hang => RawTransportState::Connecting,
            ConnectBehavior::Fail => RawTransportState::Failed,
            ConnectBehavior::Reject => {
                return Err(TransportError::Connect("connection refused".into()));
            }
        };
        let client = Arc::new(MemoryClient::new(
            initial,
            self.inner.published.clone(),
            self.inner.publish_delay.clone(),
        ));
        lock(&self.inner.clients).push(client.clone());
        Ok(client as SharedClient)
    }
}

pub struct MemoryClient {
    state: watch::Sender<RawTransportState>,
    channels: Mutex<HashMap<String, Arc<MemoryChannel>>>,
    reconnect_script: Mutex<VecDeque<ConnectBehavior>>,
    reconnects: AtomicUsize,
    published: PublishLog,
    publish_delay: PublishDelay,
}

impl MemoryClient {
    fn new(initial: RawTransportState, published: PublishLog, publish_delay: PublishDelay) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            channels: Mutex::new(HashMap::new()),
            reconnect_script: Mutex::new(VecDeque::new()),
            reconnects: AtomicUsize::new(0),
            published,
            publish_delay,
        }
    }

    /// Drives the client into `state`, as the server side would.
    pub fn set_state(&self, state: RawTransportState) {
        self.state.send_replace(state);
    }

    pub fn push_reconnect_behavior(&self, behavior: ConnectBehavior) {
        lock(&self.reconnect_script).push_back(behavior);
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn memory_channel(&self, name: &str) -> Arc<MemoryChannel> {
        lock(&self.channels)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryChannel::new(
                    name,
                    self.state.subscribe(),
                    self.published.clone(),
                    self.publish_delay.clone(),
                ))
            })
            .clone()
    }
}

#[async_trait]
impl TransportClient for MemoryClient {
    fn state(&self) -> RawTransportState {
        *self.state.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<RawTransportState> {
        self.state.subscribe()
    }

    fn channel(&self, name: &str) -> SharedChannel {
        self.memory_channel(name)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.state() == RawTransportState::Closed {
            return Err(TransportError::Closed);
        }
        let behavior = lock(&self.reconnect_script)
            .pop_front()
            .unwrap_or(ConnectBehavior::Accept);
        match behavior {
            ConnectBehavior::Accept => self.set_state(RawTransportState::Connected),
            ConnectBehavior::Hang => self.set_state(RawTransportState::Connecting),
            ConnectBehavior::Fail => self.set_state(RawTransportState::Failed),
            ConnectBehavior::Reject => {
                return Err(TransportError::Connect("reconnect refused".into()));
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.set_state(RawTransportState::Closed);
        lock(&self.channels).clear();
        Ok(())
    }
}

pub struct MemoryChannel {
    name: String,
    client_state: watch::Receiver<RawTransportState>,
    listeners: Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>,
    health: broadcast::Sender<ChannelHealth>,
    attaches: AtomicUsize,
    failing_publishes: AtomicUsize,
    published: PublishLog,
    publish_delay: PublishDelay,
}

impl MemoryChannel {
    fn new(
        name: &str,
        client_state: watch::Receiver<RawTransportState>,
        published: PublishLog,
        publish_delay: PublishDelay,
    ) -> Self {
        let (health, _) = broadcast::channel(16);
        Self {
            name: name.to_string(),
            client_state,
            listeners: Mutex::new(Vec::new()),
            health,
            attaches: AtomicUsize::new(0),
            failing_publishes: AtomicUsize::new(0),
            published,
            publish_delay,
        }
    }

    /// Delivers an inbound message to local subscribers of `event`.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        let message = InboundMessage {
            channel: self.name.clone(),
            event: event.to_string(),
            data,
        };
        let mut listeners = lock(&self.listeners);
        listeners.retain(|(_, sender)| !sender.is_closed());
        listeners
            .iter()
            .filter(|(subscribed, _)| subscribed == event)
            .filter(|(_, sender)| sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn set_health(&self, health: ChannelHealth) {
        let _ = self.health.send(health);
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|(subscribed, sender)| subscribed == event && !sender.is_closed())
            .count()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attach(&self) -> Result<(), TransportError> {
        if *self.client_state.borrow() == RawTransportState::Closed {
            return Err(TransportError::Closed);
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);
        self.set_health(ChannelHealth::Attached);
        Ok(())
    }

    async fn subscribe(
        &self,
        event: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.listeners).push((event.to_string(), sender));
        Ok(receiver)
    }

    async fn unsubscribe(&self, event: Option<&str>) {
        lock(&self.listeners)
            .retain(|(subscribed, _)| event.is_some_and(|event| subscribed != event));
    }

    async fn publish(&self, event: &str, data: &Value) -> Result<(), TransportError> {
        if *self.client_state.borrow() != RawTransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let delay = *lock(&self.publish_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Channel {
                channel: self.name.clone(),
                reason: "publish rejected".into(),
            });
        }
        lock(&self.published).push(InboundMessage {
            channel: self.name.clone(),
            event: event.to_string(),
            data: data.clone(),
        });
        self.emit(event, data.clone());
        Ok(())
    }

    fn health(&self) -> broadcast::Receiver<ChannelHealth> {
        self.health.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn scripted_connects_follow_queue() {
        let transport = MemoryTransport::new();
        transport.push_behavior(ConnectBehavior::Reject);
        transport.push_behavior(ConnectBehavior::Hang);

        let token = AuthToken::new("t");
        assert!(transport.connect(&token).await.is_err());
        let hanging = transport.connect(&token).await.unwrap();
        assert_eq!(hanging.state(), RawTransportState::Connecting);
        let accepted = transport.connect(&token).await.unwrap();
        assert_eq!(accepted.state(), RawTransportState::Connected);
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn publish_echoes_to_subscribers_and_logs() {
        let transport = MemoryTransport::new();
        let client = transport.connect(&AuthToken::new("t")).await.unwrap();
        let channel = client.channel("widget:conversation:3");
        let mut inbound = channel.subscribe("message").await.unwrap();

        channel.publish("message", &json!("hello")).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().data, json!("hello"));
        assert_eq!(transport.published().len(), 1);

        channel.unsubscribe(Some("message")).await;
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_fails_when_disconnected_or_scripted() {
        let transport = MemoryTransport::new();
        transport.connect(&AuthToken::new("t")).await.unwrap();
        let client = transport.latest_client().unwrap();
        let channel = client.memory_channel("widget:conversation:3");

        channel.fail_next_publishes(1);
        assert!(channel.publish("message", &json!(1)).await.is_err());
        assert!(channel.publish("message", &json!(2)).await.is_ok());

        client.set_state(RawTransportState::Disconnected);
        assert!(matches!(
            channel.publish("message", &json!(3)).await,
            Err(TransportError::NotConnected)
        ));
    }
}
