use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use metrics::gauge;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};
use widget_resilience::CircuitRegistry;

use crate::config::RealtimeConfig;
use crate::events::{ConnectionEvent, LocalEvent};
use crate::registry::{ChannelRegistry, Subscription};
use crate::state::{ConnectionStatus, RawTransportState};
use crate::transport::{InboundMessage, SharedClient};

pub type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
pub type ListenerId = u64;

/// The installed transport client together with the generation it belongs to.
/// Background work started for one generation stops acting once a newer
/// client is installed.
#[derive(Clone)]
pub struct ClientSlot {
    pub client: SharedClient,
    pub generation: u64,
}

struct ListenerEntry {
    id: ListenerId,
    channel: String,
    event: String,
    callback: Listener,
}

#[derive(Default)]
struct ListenerTable {
    next_id: ListenerId,
    entries: Vec<ListenerEntry>,
}

#[derive(Default)]
struct BackgroundTasks {
    observer: Option<JoinHandle<()>>,
    bindings: HashMap<Subscription, (u64, JoinHandle<()>)>,
    health: HashMap<String, (u64, JoinHandle<()>)>,
}

impl BackgroundTasks {
    fn abort_all(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
        for (_, (_, handle)) in self.bindings.drain() {
            handle.abort();
        }
        for (_, (_, handle)) in self.health.drain() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by one widget instance's connection manager and messenger.
///
/// Everything here is mutated in short synchronous sections; no lock is held
/// across an `.await`.
pub struct ConnectionContext {
    config: RealtimeConfig,
    circuits: CircuitRegistry,
    registry: Mutex<ChannelRegistry>,
    slot: RwLock<Option<ClientSlot>>,
    generation: AtomicU64,
    observed: watch::Sender<RawTransportState>,
    fallback: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    local_events: broadcast::Sender<LocalEvent>,
    listeners: Mutex<ListenerTable>,
    tasks: Mutex<BackgroundTasks>,
}

impl ConnectionContext {
    pub fn new(config: RealtimeConfig) -> Arc<Self> {
        Self::with_circuits(config, CircuitRegistry::new())
    }

    /// Shares `circuits` with other callers of the same backend.
    pub fn with_circuits(config: RealtimeConfig, circuits: CircuitRegistry) -> Arc<Self> {
        let (observed, _) = watch::channel(RawTransportState::Initialized);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (local_events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            registry: Mutex::new(ChannelRegistry::new(config.max_pending_messages)),
            config,
            circuits,
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
            observed,
            fallback: AtomicBool::new(false),
            events,
            local_events,
            listeners: Mutex::new(ListenerTable::default()),
            tasks: Mutex::new(BackgroundTasks::default()),
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ChannelRegistry) -> R) -> R {
        f(&mut lock(&self.registry))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.registry).pending_count()
    }

    /// Publishes the pending queue length as a gauge and an event.
    pub fn record_pending(&self) {
        let count = self.pending_count();
        gauge!("widget_pending_messages").set(count as f64);
        self.emit(ConnectionEvent::PendingChanged { count });
    }

    pub fn client_slot(&self) -> Option<ClientSlot> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The client, when it is connected and its `Connected` transition has
    /// been fully handled (pending replay included).
    pub fn connected_slot(&self) -> Option<ClientSlot> {
        self.client_slot().filter(|slot| {
            slot.client.state() == RawTransportState::Connected
                && self.observed_state() == RawTransportState::Connected
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected_slot().is_some()
    }

    /// Live state of the installed client, or the last observed state when
    /// no client is installed.
    pub fn transport_state(&self) -> RawTransportState {
        self.client_slot()
            .map(|slot| slot.client.state())
            .unwrap_or_else(|| self.observed_state())
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(self.transport_state())
    }

    /// Last state whose transition handling completed.
    pub fn observed_state(&self) -> RawTransportState {
        *self.observed.borrow()
    }

    pub fn observed_changes(&self) -> watch::Receiver<RawTransportState> {
        self.observed.subscribe()
    }

    /// Returns `true` when the value changed.
    pub(crate) fn set_observed(&self, raw: RawTransportState) -> bool {
        self.observed.send_if_modified(|current| {
            if *current == raw {
                false
            } else {
                *current = raw;
                true
            }
        })
    }

    pub fn in_fallback(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that entered fallback.
    pub fn enable_local_fallback(&self) -> bool {
        if self.fallback.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("realtime unavailable, switching to local fallback");
        self.emit(ConnectionEvent::FallbackEnabled);
        true
    }

    pub(crate) fn leave_fallback(&self) -> bool {
        if !self.fallback.swap(false, Ordering::SeqCst) {
            return false;
        }
        info!("leaving local fallback");
        self.emit(ConnectionEvent::FallbackCleared);
        true
    }

    /// Installs `client` as a new generation and returns it together with
    /// the client it replaced.
    pub(crate) fn install_client(&self, client: SharedClient) -> (ClientSlot, Option<SharedClient>) {
        lock(&self.tasks).abort_all();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = ClientSlot { client, generation };
        let previous = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(slot.clone());
        self.observed.send_replace(RawTransportState::Initialized);
        (slot, previous.map(|previous| previous.client))
    }

    pub(crate) fn detach_client(&self) -> Option<SharedClient> {
        lock(&self.tasks).abort_all();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|slot| slot.client)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_local_events(&self) -> broadcast::Receiver<LocalEvent> {
        self.local_events.subscribe()
    }

    pub(crate) fn raise_local(&self, event: LocalEvent) {
        let _ = self.local_events.send(event);
    }

    pub(crate) fn add_listener(&self, channel: &str, event: &str, callback: Listener) -> ListenerId {
        let mut table = lock(&self.listeners);
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push(ListenerEntry {
            id,
            channel: channel.to_string(),
            event: event.to_string(),
            callback,
        });
        id
    }

    /// Removes listeners on `channel` for `event`, or for every event.
    pub(crate) fn remove_listeners(&self, channel: &str, event: Option<&str>) -> usize {
        let mut table = lock(&self.listeners);
        let before = table.entries.len();
        table.entries.retain(|entry| {
            !(entry.channel == channel && event.is_none_or(|event| entry.event == event))
        });
        before - table.entries.len()
    }

    pub(crate) fn clear_listeners(&self) {
        lock(&self.listeners).entries.clear();
    }

    pub fn listener_count(&self, channel: &str, event: &str) -> usize {
        lock(&self.listeners)
            .entries
            .iter()
            .filter(|entry| entry.channel == channel && entry.event == event)
            .count()
    }

    pub(crate) fn has_listener(&self, id: ListenerId) -> bool {
        lock(&self.listeners).entries.iter().any(|entry| entry.id == id)
    }

    /// Invokes matching callbacks outside the listener lock.
    pub(crate) fn dispatch(&self, message: &InboundMessage) {
        let callbacks: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .filter(|entry| entry.channel == message.channel && entry.event == message.event)
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            callback(message);
        }
    }

    pub(crate) fn set_observer(&self, generation: u64, handle: JoinHandle<()>) {
        if !self.is_current(generation) {
            handle.abort();
            return;
        }
        if let Some(previous) = lock(&self.tasks).observer.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn has_binding(&self, subscription: &Subscription, generation: u64) -> bool {
        lock(&self.tasks)
            .bindings
            .get(subscription)
            .is_some_and(|(bound, handle)| *bound == generation && !handle.is_finished())
    }

    pub(crate) fn set_binding(
        &self,
        subscription: Subscription,
        generation: u64,
        handle: JoinHandle<()>,
    ) {
        if !self.is_current(generation) {
            handle.abort();
            return;
        }
        if let Some((_, previous)) = lock(&self.tasks)
            .bindings
            .insert(subscription, (generation, handle))
        {
            previous.abort();
        }
    }

    /// Drops transport pumps on `channel` for `event`, or for every event
    /// along with the channel's health watcher.
    pub(crate) fn remove_bindings(&self, channel: &str, event: Option<&str>) {
        let mut tasks = lock(&self.tasks);
        tasks.bindings.retain(|subscription, (_, handle)| {
            let matches = subscription.channel_name == channel
                && event.is_none_or(|event| subscription.event_name == event);
            if matches {
                handle.abort();
            }
            !matches
        });
        if event.is_none() {
            if let Some((_, handle)) = tasks.health.remove(channel) {
                handle.abort();
            }
        }
    }

    pub(crate) fn clear_bindings(&self) {
        let mut tasks = lock(&self.tasks);
        for (_, (_, handle)) in tasks.bindings.drain() {
            handle.abort();
        }
        for (_, (_, handle)) in tasks.health.drain() {
            handle.abort();
        }
    }

    pub(crate) fn has_health_watcher(&self, channel: &str, generation: u64) -> bool {
        lock(&self.tasks)
            .health
            .get(channel)
            .is_some_and(|(watched, handle)| *watched == generation && !handle.is_finished())
    }

    pub(crate) fn set_health_watcher(&self, channel: &str, generation: u64, handle: JoinHandle<()>) {
        if !self.is_current(generation) {
            handle.abort();
            return;
        }
        if let Some((_, previous)) = lock(&self.tasks)
            .health
            .insert(channel.to_string(), (generation, handle))
        {
            previous.abort();
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        lock(&self.tasks).abort_all();
    }
}
