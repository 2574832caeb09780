//! Channel subscriptions for pub/sub fan-out.
//!
//! Members are stored as client ids, not stream handles; delivery resolves
//! each id through the [`ConnectionManager`] at publish time, so a handle
//! that died since subscribing is simply skipped.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::hub::connections::ConnectionManager;
use crate::wire::Message;

pub struct SubscriptionManager {
    channels: DashMap<String, HashSet<String>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, channel: &str, client_id: &str) {
        self.channels
            .entry(channel.to_owned())
            .or_default()
            .insert(client_id.to_owned());
        tracing::debug!(channel, client_id, "Subscribed");
    }

    pub fn unsubscribe(&self, channel: &str, client_id: &str) {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(client_id);
        }
        self.channels
            .remove_if(channel, |_, members| members.is_empty());
    }

    /// Drop a client from every channel; called at connection teardown.
    pub fn remove_client(&self, client_id: &str) {
        self.channels.retain(|_, members| {
            members.remove(client_id);
            !members.is_empty()
        });
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |members| members.len())
    }

    /// Deliver to every subscriber of `channel` except the sender. Order
    /// across subscribers is unspecified; individual send errors do not
    /// halt the fan-out.
    pub async fn publish(
        &self,
        channel: &str,
        msg: &Message,
        connections: &ConnectionManager,
    ) -> usize {
        let members: Vec<String> = match self.channels.get(channel) {
            Some(members) => members
                .iter()
                .filter(|id| **id != msg.from)
                .cloned()
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for client_id in members {
            match connections.send(&client_id, msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!(
                        channel,
                        client_id,
                        "Dropping channel delivery to dead subscriber"
                    );
                }
            }
        }
        delivered
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connections::OUTBOUND_QUEUE;
    use crate::wire::MessageType;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publish_reaches_subscribers_except_sender() {
        let connections = ConnectionManager::new();
        let subs = SubscriptionManager::new();
        let (tx1, mut rx1) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx2, mut rx2) = mpsc::channel(OUTBOUND_QUEUE);
        connections.register("c1", tx1);
        connections.register("c2", tx2);
        subs.subscribe("news", "c1");
        subs.subscribe("news", "c2");

        let mut msg = Message::new(MessageType::Channel);
        msg.from = "c1".into();
        msg.channel = "news".into();

        let delivered = subs.publish("news", &msg, &connections).await;
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribed_channel_is_silent() {
        let connections = ConnectionManager::new();
        let subs = SubscriptionManager::new();
        let msg = Message::new(MessageType::Channel);
        assert_eq!(subs.publish("empty", &msg, &connections).await, 0);
    }

    #[tokio::test]
    async fn remove_client_clears_all_memberships() {
        let subs = SubscriptionManager::new();
        subs.subscribe("a", "c1");
        subs.subscribe("b", "c1");
        subs.subscribe("b", "c2");

        subs.remove_client("c1");

        assert_eq!(subs.subscriber_count("a"), 0);
        assert_eq!(subs.subscriber_count("b"), 1);
    }

    #[tokio::test]
    async fn dead_subscriber_is_skipped() {
        let connections = ConnectionManager::new();
        let subs = SubscriptionManager::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        connections.register("c1", tx);
        drop(rx);
        subs.subscribe("news", "c1");

        let mut msg = Message::new(MessageType::Channel);
        msg.from = "other".into();
        assert_eq!(subs.publish("news", &msg, &connections).await, 0);
    }
}
