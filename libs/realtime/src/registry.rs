use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Channel name produced when a conversation channel is built before the
/// session id is known.
pub const INVALID_CHANNEL_SENTINEL: &str = "widget:conversation:";

pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1_000;

/// Intent to receive `event_name` on `channel_name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub channel_name: String,
    pub event_name: String,
}

impl Subscription {
    pub fn new(channel_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            event_name: event_name.into(),
        }
    }
}

/// Outbound publish deferred until the transport is connected again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub channel_name: String,
    pub event_name: String,
    pub data: Value,
}

impl PendingMessage {
    pub fn new(channel_name: impl Into<String>, event_name: impl Into<String>, data: Value) -> Self {
        Self {
            channel_name: channel_name.into(),
            event_name: event_name.into(),
            data,
        }
    }
}

/// Rejects names built from a missing session identity.
pub fn is_valid_channel_name(channel: &str) -> bool {
    !channel.trim().is_empty()
        && !channel.contains("null")
        && !channel.contains("undefined")
        && channel != INVALID_CHANNEL_SENTINEL
}

/// Active subscriptions plus the FIFO queue of undelivered publishes.
#[derive(Debug)]
pub struct ChannelRegistry {
    active: Vec<Subscription>,
    pending: VecDeque<PendingMessage>,
    max_pending: usize,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_MESSAGES)
    }
}

impl ChannelRegistry {
    pub fn new(max_pending: usize) -> Self {
        Self {
            active: Vec::new(),
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Returns `false` when the channel name is rejected. Re-adding an
    /// existing pair is accepted and leaves a single entry.
    pub fn add_active_subscription(&mut self, channel: &str, event: &str) -> bool {
        if !is_valid_channel_name(channel) {
            warn!(channel, event, "ignoring subscription on invalid channel name");
            return false;
        }
        let subscription = Subscription::new(channel, event);
        if !self.active.contains(&subscription) {
            self.active.push(subscription);
        }
        true
    }

    pub fn remove_active_subscription(&mut self, channel: &str, event: &str) -> bool {
        let before = self.active.len();
        self.active
            .retain(|sub| !(sub.channel_name == channel && sub.event_name == event));
        self.active.len() != before
    }

    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.active.clone()
    }

    pub fn has_active_subscription(&self, channel: &str, event: &str) -> bool {
        self.active
            .iter()
            .any(|sub| sub.channel_name == channel && sub.event_name == event)
    }

    /// Events grouped per channel: channels sorted, events in subscribe order.
    pub fn subscriptions_by_channel(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sub in &self.active {
            grouped
                .entry(sub.channel_name.clone())
                .or_default()
                .push(sub.event_name.clone());
        }
        grouped
    }

    pub fn clear_active_subscriptions(&mut self) {
        self.active.clear();
    }

    /// Queues a message; returns `false` when the channel name is rejected.
    pub fn add_pending_message(&mut self, channel: &str, event: &str, data: Value) -> bool {
        if !is_valid_channel_name(channel) {
            warn!(channel, event, "dropping pending message for invalid channel name");
            return false;
        }
        if self.pending.len() >= self.max_pending {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    channel = %dropped.channel_name,
                    event = %dropped.event_name,
                    limit = self.max_pending,
                    "pending queue full, dropping oldest message"
                );
            }
        }
        self.pending.push_back(PendingMessage::new(channel, event, data));
        true
    }

    pub fn pending_messages(&self) -> Vec<PendingMessage> {
        self.pending.iter().cloned().collect()
    }

    pub fn set_pending_messages(&mut self, messages: Vec<PendingMessage>) {
        self.pending = messages
            .into_iter()
            .filter(|message| is_valid_channel_name(&message.channel_name))
            .collect();
        while self.pending.len() > self.max_pending {
            self.pending.pop_front();
        }
    }

    /// Drains the queue in enqueue order.
    pub fn take_pending_messages(&mut self) -> Vec<PendingMessage> {
        self.pending.drain(..).collect()
    }

    /// Oldest queued message, left in place.
    pub fn peek_pending_message(&self) -> Option<PendingMessage> {
        self.pending.front().cloned()
    }

    /// Removes the oldest message if it is still `delivered`. The queue may
    /// have shifted meanwhile when a full queue dropped its oldest entry.
    pub fn ack_pending_message(&mut self, delivered: &PendingMessage) -> bool {
        if self.pending.front() == Some(delivered) {
            self.pending.pop_front();
            true
        } else {
            false
        }
    }

    pub fn clear_pending_messages(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn duplicate_subscription_is_stored_once() {
        let mut registry = ChannelRegistry::default();
        assert!(registry.add_active_subscription("widget:conversation:42", "message"));
        assert!(registry.add_active_subscription("widget:conversation:42", "message"));
        assert_eq!(
            registry.active_subscriptions(),
            vec![Subscription::new("widget:conversation:42", "message")]
        );
    }

    #[test]
    fn rejects_placeholder_channel_names() {
        let mut registry = ChannelRegistry::default();
        for channel in [
            "",
            "widget:conversation:null",
            "widget:conversation:undefined",
            INVALID_CHANNEL_SENTINEL,
        ] {
            assert!(!registry.add_active_subscription(channel, "message"));
            assert!(!registry.add_pending_message(channel, "message", json!({})));
        }
        assert!(registry.active_subscriptions().is_empty());
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn pending_messages_drain_in_fifo_order() {
        let mut registry = ChannelRegistry::default();
        for n in 1..=3 {
            registry.add_pending_message("widget:conversation:7", "message", json!({ "n": n }));
        }
        let drained = registry.take_pending_messages();
        let order: Vec<_> = drained.iter().map(|m| m.data["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn ack_removes_only_the_matching_front() {
        let mut registry = ChannelRegistry::new(2);
        registry.add_pending_message("widget:conversation:7", "message", json!(1));
        let front = registry.peek_pending_message().unwrap();
        assert_eq!(registry.pending_count(), 1);

        registry.add_pending_message("widget:conversation:7", "message", json!(2));
        registry.add_pending_message("widget:conversation:7", "message", json!(3));
        assert!(!registry.ack_pending_message(&front));
        assert_eq!(registry.pending_count(), 2);

        let front = registry.peek_pending_message().unwrap();
        assert!(registry.ack_pending_message(&front));
        let pending: Vec<_> = registry.pending_messages().into_iter().map(|m| m.data).collect();
        assert_eq!(pending, vec![json!(3)]);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let mut registry = ChannelRegistry::new(2);
        for n in 1..=3 {
            registry.add_pending_message("widget:conversation:7", "message", json!(n));
        }
        let pending: Vec<_> = registry.pending_messages().into_iter().map(|m| m.data).collect();
        assert_eq!(pending, vec![json!(2), json!(3)]);
    }

    #[test]
    fn set_pending_filters_invalid_entries() {
        let mut registry = ChannelRegistry::default();
        registry.set_pending_messages(vec![
            PendingMessage::new("widget:conversation:1", "message", json!(1)),
            PendingMessage::new("widget:conversation:undefined", "message", json!(2)),
        ]);
        assert_eq!(registry.pending_count(), 1);
        registry.clear_pending_messages();
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn groups_subscriptions_by_channel() {
        let mut registry = ChannelRegistry::default();
        registry.add_active_subscription("widget:session:b", "typing");
        registry.add_active_subscription("widget:session:a", "message");
        registry.add_active_subscription("widget:session:b", "message");
        let grouped = registry.subscriptions_by_channel();
        let channels: Vec<_> = grouped.keys().cloned().collect();
        assert_eq!(channels, vec!["widget:session:a", "widget:session:b"]);
        assert_eq!(grouped["widget:session:b"], vec!["typing", "message"]);

        assert!(registry.remove_active_subscription("widget:session:b", "typing"));
        assert!(!registry.remove_active_subscription("widget:session:b", "typing"));
        registry.clear_active_subscriptions();
        assert!(registry.active_subscriptions().is_empty());
    }
}
