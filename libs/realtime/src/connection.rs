use std::sync::{Arc, Weak};

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::auth::SharedTokenSource;
use crate::context::{ClientSlot, ConnectionContext};
use crate::error::RealtimeError;
use crate::events::ConnectionEvent;
use crate::messaging::{Messenger, reattach_subscriptions};
use crate::scheduler::AttemptOutcome;
use crate::state::{ConnectionStatus, RawTransportState};
use crate::transport::{SharedClient, SharedTransport, TransportError};

/// Circuit guarding realtime token requests.
pub const SECURITY_CIRCUIT: &str = "security";

/// Owns the realtime client lifecycle for one [`ConnectionContext`].
#[derive(Clone)]
pub struct ConnectionManager {
    ctx: Arc<ConnectionContext>,
    transport: SharedTransport,
    tokens: SharedTokenSource,
}

impl ConnectionManager {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        transport: SharedTransport,
        tokens: SharedTokenSource,
    ) -> Self {
        Self {
            ctx,
            transport,
            tokens,
        }
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    pub fn messenger(&self) -> Messenger {
        Messenger::new(self.ctx.clone())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.ctx.status()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    /// Connects once; a second call while connected is a no-op. Any failure
    /// switches the context to local fallback before it is returned.
    #[instrument(name = "realtime.initialize", skip_all)]
    pub async fn initialize_connection(&self, auth_url: &str) -> Result<(), RealtimeError> {
        if self.ctx.is_connected() {
            debug!("realtime already connected");
            return Ok(());
        }
        let result: Result<(), RealtimeError> = async {
            let slot = match self.settling_slot() {
                Some(slot) => {
                    debug!(generation = slot.generation, "joining connection still replaying");
                    slot
                }
                None => self.open_client(auth_url).await?,
            };
            self.await_connected(&slot).await
        }
        .await;
        match result {
            Ok(()) => {
                info!("realtime connected");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "realtime connection failed");
                self.ctx.enable_local_fallback();
                Err(err)
            }
        }
    }

    /// Re-establishes the connection without touching queued work. Returns
    /// whether the transport reached `Connected` within the connect timeout.
    pub async fn reconnect(&self, auth_url: &str) -> bool {
        self.reconnect_attempt(auth_url).await == AttemptOutcome::Connected
    }

    /// Like [`reconnect`](Self::reconnect), but reports an open `security`
    /// circuit as [`AttemptOutcome::Deferred`] since no connection was tried.
    #[instrument(name = "realtime.reconnect", skip_all)]
    pub async fn reconnect_attempt(&self, auth_url: &str) -> AttemptOutcome {
        let timeout = self.ctx.config().connect_timeout;
        match tokio::time::timeout(timeout, self.try_reconnect(auth_url)).await {
            Ok(Ok(())) => AttemptOutcome::Connected,
            Ok(Err(RealtimeError::CircuitOpen { circuit, retry_in })) => {
                debug!(
                    circuit = %circuit,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "reconnect skipped, circuit open"
                );
                AttemptOutcome::Deferred(retry_in)
            }
            Ok(Err(err)) => {
                warn!(error = %err, "reconnect failed");
                AttemptOutcome::Failed
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "reconnect timed out");
                AttemptOutcome::Failed
            }
        }
    }

    async fn try_reconnect(&self, auth_url: &str) -> Result<(), RealtimeError> {
        if self.ctx.is_connected() {
            return Ok(());
        }
        let reusable = self.ctx.client_slot().filter(|slot| {
            !matches!(
                slot.client.state(),
                RawTransportState::Closing | RawTransportState::Closed
            )
        });
        let slot = match reusable {
            Some(slot) => match slot.client.reconnect().await {
                Ok(()) => slot,
                Err(err) => {
                    debug!(error = %err, "client reconnect refused, opening a new client");
                    self.open_client(auth_url).await?
                }
            },
            None => self.open_client(auth_url).await?,
        };
        self.await_connected(&slot).await
    }

    /// Closes the client and drops queued messages and fallback. Tracked
    /// subscriptions and their callbacks are kept for the next connection.
    #[instrument(name = "realtime.cleanup", skip_all)]
    pub async fn cleanup(&self) {
        let previous = self.ctx.detach_client();
        let had_client = previous.is_some();
        if let Some(client) = previous {
            if let Err(err) = client.close().await {
                debug!(error = %err, "error while closing realtime client");
            }
        }
        self.ctx.leave_fallback();

        let dropped = self.ctx.with_registry(|registry| {
            let count = registry.pending_count();
            registry.clear_pending_messages();
            count
        });
        if dropped > 0 {
            self.ctx.record_pending();
        }

        let before = self.ctx.observed_state();
        if self.ctx.set_observed(RawTransportState::Closed)
            && ConnectionStatus::from(before) != ConnectionStatus::Disconnected
        {
            self.ctx.emit(ConnectionEvent::StatusChanged {
                status: ConnectionStatus::Disconnected,
                raw: RawTransportState::Closed,
            });
        }
        if had_client || dropped > 0 {
            info!(dropped, "realtime connection cleaned up");
        }
    }

    pub fn enable_local_fallback(&self) -> bool {
        self.ctx.enable_local_fallback()
    }

    /// Installed client that is already `Connected` while its transition is
    /// still being handled.
    fn settling_slot(&self) -> Option<ClientSlot> {
        self.ctx
            .client_slot()
            .filter(|slot| slot.client.state() == RawTransportState::Connected)
    }

    async fn open_client(&self, auth_url: &str) -> Result<ClientSlot, RealtimeError> {
        let config = self.ctx.config();
        let token = self
            .ctx
            .circuits()
            .with_resilience(
                || self.tokens.fetch(auth_url),
                SECURITY_CIRCUIT,
                Some(&config.auth_retry),
                Some(&config.auth_circuit),
            )
            .await?;
        let client = self.transport.connect(&token).await?;
        let (slot, previous) = self.ctx.install_client(client);
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                debug!(error = %err, "error while closing replaced client");
            }
        }
        spawn_observer(&self.ctx, &slot);
        Ok(slot)
    }

    /// Resolves once the client is connected and the observer has finished
    /// handling that transition. Bounded by the connect timeout.
    async fn await_connected(&self, slot: &ClientSlot) -> Result<(), RealtimeError> {
        let timeout = self.ctx.config().connect_timeout;
        match tokio::time::timeout(timeout, self.wait_until_connected(slot)).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::Timeout(timeout)),
        }
    }

    async fn wait_until_connected(&self, slot: &ClientSlot) -> Result<(), RealtimeError> {
        let mut states = slot.client.state_changes();
        let reached = *states
            .wait_for(|state| {
                matches!(
                    state,
                    RawTransportState::Connected
                        | RawTransportState::Failed
                        | RawTransportState::Closed
                )
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        if reached != RawTransportState::Connected {
            return Err(RealtimeError::HandshakeFailed(reached));
        }

        let mut observed = self.ctx.observed_changes();
        loop {
            if !self.ctx.is_current(slot.generation) {
                return Err(TransportError::Closed.into());
            }
            if *observed.borrow_and_update() == RawTransportState::Connected {
                return Ok(());
            }
            let state = slot.client.state();
            if matches!(state, RawTransportState::Failed | RawTransportState::Closed) {
                return Err(RealtimeError::HandshakeFailed(state));
            }
            tokio::select! {
                changed = observed.changed() => changed.map_err(|_| TransportError::Closed)?,
                changed = states.changed() => changed.map_err(|_| TransportError::Closed)?,
            }
        }
    }
}

fn spawn_observer(ctx: &Arc<ConnectionContext>, slot: &ClientSlot) {
    let weak = Arc::downgrade(ctx);
    let handle = tokio::spawn(observe_client(
        weak,
        slot.client.clone(),
        slot.generation,
        ctx.config().fallback_dwell,
    ));
    ctx.set_observer(slot.generation, handle);
}

/// Follows the client's state until it is replaced. A degraded state that
/// lasts `dwell` enables local fallback once.
async fn observe_client(
    ctx: Weak<ConnectionContext>,
    client: SharedClient,
    generation: u64,
    dwell: std::time::Duration,
) {
    let mut states = client.state_changes();
    let mut current = *states.borrow_and_update();
    let mut degraded_since: Option<Instant> = None;
    let mut dwell_fired = false;

    loop {
        {
            let Some(ctx) = ctx.upgrade() else { break };
            if !ctx.is_current(generation) {
                break;
            }
            on_transition(&ctx, &client, generation, current).await;
        }

        if current.is_degraded() {
            degraded_since.get_or_insert_with(Instant::now);
        } else {
            degraded_since = None;
            dwell_fired = false;
        }
        let deadline = degraded_since
            .filter(|_| !dwell_fired)
            .map(|since| since + dwell);

        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                current = *states.borrow_and_update();
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                dwell_fired = true;
                let Some(ctx) = ctx.upgrade() else { break };
                if ctx.is_current(generation) {
                    warn!(state = %current, dwell_ms = dwell.as_millis() as u64, "realtime degraded past dwell time");
                    ctx.enable_local_fallback();
                }
            }
        }
    }
    debug!(generation, "realtime observer stopped");
}

async fn on_transition(
    ctx: &Arc<ConnectionContext>,
    client: &SharedClient,
    generation: u64,
    raw: RawTransportState,
) {
    if ctx.observed_state() == raw {
        return;
    }
    let status = ConnectionStatus::from(raw);
    info!(raw = %raw, status = %status, "realtime state changed");

    if raw == RawTransportState::Connected {
        ctx.leave_fallback();
        replay_pending(ctx, client).await;
        if !ctx.is_current(generation) {
            return;
        }
        let slot = ClientSlot {
            client: client.clone(),
            generation,
        };
        reattach_subscriptions(ctx, &slot).await;
    }
    if !ctx.is_current(generation) {
        return;
    }

    ctx.set_observed(raw);
    counter!("widget_realtime_transitions_total", "status" => status.as_str()).increment(1);
    ctx.emit(ConnectionEvent::StatusChanged { status, raw });
}

/// Publishes queued messages oldest first. Each message leaves the queue
/// only once its publish succeeded, so an aborted or failed replay keeps the
/// rest queued in order.
async fn replay_pending(ctx: &ConnectionContext, client: &SharedClient) {
    let mut replayed = 0usize;
    while let Some(message) = ctx.with_registry(|registry| registry.peek_pending_message()) {
        let channel = client.channel(&message.channel_name);
        if let Err(err) = channel.publish(&message.event_name, &message.data).await {
            warn!(
                channel = %message.channel_name,
                event = %message.event_name,
                error = %err,
                "replay failed, keeping remaining messages queued"
            );
            break;
        }
        ctx.with_registry(|registry| registry.ack_pending_message(&message));
        replayed += 1;
    }
    if replayed > 0 {
        info!(replayed, "replayed pending messages");
        ctx.record_pending();
    }
}
