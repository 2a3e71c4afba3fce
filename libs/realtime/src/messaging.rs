use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::context::{ClientSlot, ConnectionContext, ListenerId};
use crate::events::{ConnectionEvent, LocalEvent};
use crate::registry::{Subscription, is_valid_channel_name};
use crate::state::RawTransportState;
use crate::transport::{ChannelHealth, InboundMessage, SharedChannel, TransportError};

/// Returned by [`Messenger::subscribe`]; pass it back to unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    channel: String,
    event: String,
    listener: ListenerId,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the connected transport.
    Delivered,
    /// Stored for replay on the next `Connected` transition.
    Queued,
    /// Dropped because the channel name is invalid.
    Rejected,
}

/// Subscribe/publish surface that queues transparently while offline.
#[derive(Clone)]
pub struct Messenger {
    ctx: Arc<ConnectionContext>,
}

impl Messenger {
    pub fn new(ctx: Arc<ConnectionContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    /// Registers `callback` for `event` on `channel`. Returns `None` when
    /// the transport is not connected or the channel name is invalid.
    pub async fn subscribe<F>(
        &self,
        channel: &str,
        event: &str,
        callback: F,
    ) -> Option<SubscriptionHandle>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let Some(slot) = self.ctx.connected_slot() else {
            warn!(channel, event, "cannot subscribe while realtime is not connected");
            return None;
        };
        if !self
            .ctx
            .with_registry(|registry| registry.add_active_subscription(channel, event))
        {
            return None;
        }
        let listener = self.ctx.add_listener(channel, event, Arc::new(callback));

        let transport_channel = slot.client.channel(channel);
        let bound: Result<(), TransportError> = async {
            transport_channel.attach().await?;
            bind_event(&self.ctx, &slot, &transport_channel, event).await
        }
        .await;
        if let Err(err) = bound {
            warn!(channel, event, error = %err, "failed to bind subscription, will retry on reconnect");
        }
        debug!(channel, event, "subscribed");
        Some(SubscriptionHandle {
            channel: channel.to_string(),
            event: event.to_string(),
            listener,
        })
    }

    /// Publishes now when connected, otherwise queues the message and raises
    /// a `local:{channel}:{event}` event for optimistic rendering.
    pub async fn publish(&self, channel: &str, event: &str, data: Value) -> PublishOutcome {
        if !is_valid_channel_name(channel) {
            warn!(channel, event, "refusing to publish on invalid channel name");
            return PublishOutcome::Rejected;
        }
        if !self.ctx.in_fallback() {
            if let Some(slot) = self.ctx.connected_slot() {
                match slot.client.channel(channel).publish(event, &data).await {
                    Ok(()) => return PublishOutcome::Delivered,
                    Err(err) => {
                        warn!(channel, event, error = %err, "publish failed, queueing message");
                    }
                }
            }
        }
        self.queue(channel, event, data)
    }

    fn queue(&self, channel: &str, event: &str, data: Value) -> PublishOutcome {
        let stored = self
            .ctx
            .with_registry(|registry| registry.add_pending_message(channel, event, data.clone()));
        if !stored {
            return PublishOutcome::Rejected;
        }
        self.ctx.raise_local(LocalEvent::new(channel, event, data));
        self.ctx.record_pending();
        debug!(channel, event, "message queued");
        PublishOutcome::Queued
    }

    /// Removes `event` (or every event when `None`) on the handle's channel.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle, event: Option<&str>) {
        let channel = handle.channel.as_str();
        if !self.ctx.has_listener(handle.listener) {
            debug!(channel, "subscription handle already released");
        }
        let removed = self.ctx.remove_listeners(channel, event);
        self.ctx.with_registry(|registry| match event {
            Some(event) => {
                registry.remove_active_subscription(channel, event);
            }
            None => {
                for sub in registry.active_subscriptions() {
                    if sub.channel_name == channel {
                        registry.remove_active_subscription(&sub.channel_name, &sub.event_name);
                    }
                }
            }
        });
        self.ctx.remove_bindings(channel, event);
        if let Some(slot) = self.ctx.client_slot() {
            slot.client.channel(channel).unsubscribe(event).await;
        }
        debug!(channel, event, removed, "unsubscribed");
    }

    /// Drops every subscription and callback.
    pub async fn clear(&self) {
        let channels = self.ctx.with_registry(|registry| {
            let channels: Vec<String> = registry.subscriptions_by_channel().into_keys().collect();
            registry.clear_active_subscriptions();
            channels
        });
        self.ctx.clear_listeners();
        self.ctx.clear_bindings();
        if let Some(slot) = self.ctx.client_slot() {
            for channel in &channels {
                slot.client.channel(channel).unsubscribe(None).await;
            }
        }
        if !channels.is_empty() {
            info!(channels = channels.len(), "cleared realtime subscriptions");
        }
    }

    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.ctx.with_registry(|registry| registry.active_subscriptions())
    }

    pub fn pending_count(&self) -> usize {
        self.ctx.pending_count()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.ctx.subscribe_events()
    }

    pub fn local_events(&self) -> broadcast::Receiver<LocalEvent> {
        self.ctx.subscribe_local_events()
    }
}

/// Attaches every tracked channel on `slot` and rebinds its events.
pub(crate) async fn reattach_subscriptions(ctx: &Arc<ConnectionContext>, slot: &ClientSlot) {
    let grouped = ctx.with_registry(|registry| registry.subscriptions_by_channel());
    if grouped.is_empty() {
        return;
    }
    let mut attached = 0usize;
    for (channel, events) in grouped {
        let transport_channel = slot.client.channel(&channel);
        if let Err(err) = transport_channel.attach().await {
            warn!(channel = %channel, error = %err, "failed to reattach channel");
            continue;
        }
        for event in events {
            if let Err(err) = bind_event(ctx, slot, &transport_channel, &event).await {
                warn!(channel = %channel, event = %event, error = %err, "failed to rebind subscription");
            }
        }
        attached += 1;
    }
    info!(channels = attached, "reattached subscriptions");
}

/// Starts one transport pump per subscription and generation.
async fn bind_event(
    ctx: &Arc<ConnectionContext>,
    slot: &ClientSlot,
    channel: &SharedChannel,
    event: &str,
) -> Result<(), TransportError> {
    let subscription = Subscription::new(channel.name(), event);
    if !ctx.has_binding(&subscription, slot.generation) {
        let mut inbound = channel.subscribe(event).await?;
        let weak = Arc::downgrade(ctx);
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(ctx) = weak.upgrade() else { break };
                ctx.dispatch(&message);
            }
        });
        ctx.set_binding(subscription, slot.generation, pump);
    }
    watch_channel_health(ctx, slot, channel);
    Ok(())
}

/// Reattaches `channel` after it reports detached or failed, as long as the
/// client is still connected and current.
fn watch_channel_health(ctx: &Arc<ConnectionContext>, slot: &ClientSlot, channel: &SharedChannel) {
    if ctx.has_health_watcher(channel.name(), slot.generation) {
        return;
    }
    let mut health = channel.health();
    let weak = Arc::downgrade(ctx);
    let client = slot.client.clone();
    let generation = slot.generation;
    let channel = channel.clone();
    let detached_delay = ctx.config().detached_reattach_delay;
    let failed_delay = ctx.config().failed_reattach_delay;
    let name = channel.name().to_string();

    let watcher = tokio::spawn(async move {
        loop {
            let delay = match health.recv().await {
                Ok(ChannelHealth::Attached) => continue,
                Ok(ChannelHealth::Detached) => detached_delay,
                Ok(ChannelHealth::Failed) => failed_delay,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            tokio::time::sleep(delay).await;
            let Some(ctx) = weak.upgrade() else { break };
            if !ctx.is_current(generation) {
                break;
            }
            if client.state() != RawTransportState::Connected {
                debug!(channel = channel.name(), "skipping reattach while transport is down");
                continue;
            }
            match channel.attach().await {
                Ok(()) => info!(channel = channel.name(), "channel reattached"),
                Err(err) => warn!(channel = channel.name(), error = %err, "channel reattach failed"),
            }
        }
    });
    ctx.set_health_watcher(&name, generation, watcher);
}
