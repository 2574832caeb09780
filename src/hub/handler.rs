//! Side-effect layer wrapping the router.
//!
//! Interprets the frames the hub answers itself (REGISTER, discovery,
//! channel membership) and hands everything else to the router.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use crate::hub::HubState;
use crate::hub::router::HUB_SENDER;
use crate::wire::{
    DISCOVERY_CHANNEL, DiscoveryResponse, Message, MessageType,
    RegistrationPayload,
};

const ACTION_DISCOVER: &str = "discover";
const ACTION_SUBSCRIBE: &str = "subscribe";
const ACTION_UNSUBSCRIBE: &str = "unsubscribe";

pub struct MessageHandler {
    state: Arc<HubState>,
}

impl MessageHandler {
    pub fn new(state: Arc<HubState>) -> Self {
        Self { state }
    }

    pub async fn handle(&self, client_id: &str, msg: Message) {
        match msg.kind {
            MessageType::Register => {
                self.handle_register(client_id, msg).await;
            }
            MessageType::Request if is_discovery(&msg) => {
                self.handle_discovery(client_id, &msg).await;
            }
            MessageType::Channel if msg.action == ACTION_SUBSCRIBE => {
                self.state.subscriptions.subscribe(&msg.channel, client_id);
            }
            MessageType::Channel if msg.action == ACTION_UNSUBSCRIBE => {
                self.state
                    .subscriptions
                    .unsubscribe(&msg.channel, client_id);
            }
            _ => self.state.router.route(msg).await,
        }
    }

    /// Decode the registration payload, populate the registry (and through
    /// it the store), and confirm back to the worker. A payload that fails
    /// to decode aborts the registration; the connection itself survives.
    async fn handle_register(&self, client_id: &str, msg: Message) {
        let registration =
            match serde_json::from_str::<RegistrationPayload>(&msg.content) {
                Ok(mut registration) => {
                    if registration.worker_id.is_empty() {
                        registration.worker_id = client_id.to_owned();
                    }
                    registration
                }
                Err(err) => {
                    tracing::warn!(
                        client_id,
                        error = %err,
                        "Rejecting malformed registration"
                    );
                    let reply = Message::error_response_to(
                        &msg,
                        HUB_SENDER,
                        &format!("malformed registration: {err}"),
                    );
                    let _ = self.state.connections.send(client_id, reply).await;
                    return;
                }
            };

        let worker_id = registration.worker_id.clone();
        let capabilities = registration.capabilities.len();
        self.state.registry.register(registration.into_descriptor());

        let mut reply = Message::response_to(
            &msg,
            HUB_SENDER,
            serde_json::json!({
                "status": "registered",
                "worker_id": worker_id,
                "capabilities": capabilities,
            })
            .to_string(),
        );
        reply.to = client_id.to_owned();
        if let Err(err) = self.state.connections.send(client_id, reply).await {
            tracing::info!(client_id, %err, "Registration ack undeliverable");
        }
    }

    /// Snapshot the registry and answer with the capability and worker
    /// tables.
    async fn handle_discovery(&self, client_id: &str, msg: &Message) {
        let snapshot = DiscoveryResponse {
            capabilities: self.state.registry.all_capabilities(),
            workers: self.state.registry.all_workers(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let content = match serde_json::to_string(&snapshot) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(error = %err, "Discovery snapshot failed");
                return;
            }
        };

        let mut reply = Message::response_to(msg, HUB_SENDER, content);
        reply.to = client_id.to_owned();
        if let Err(err) = self.state.connections.send(client_id, reply).await {
            tracing::info!(client_id, %err, "Discovery reply undeliverable");
        }
    }
}

/// A REQUEST the hub answers itself: the discovery channel, a `discover`
/// action tag, or a JSON content body asking to `discover` /
/// `list_capabilities`.
fn is_discovery(msg: &Message) -> bool {
    if msg.channel == DISCOVERY_CHANNEL || msg.action == ACTION_DISCOVER {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(&msg.content)
        .ok()
        .and_then(|content| {
            content.get("action").and_then(|a| a.as_str()).map(|action| {
                action == ACTION_DISCOVER || action == "list_capabilities"
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connections::OUTBOUND_QUEUE;
    use crate::wire::{Capability, WorkerStatus};
    use tokio::sync::mpsc;

    fn state() -> Arc<HubState> {
        HubState::new(None)
    }

    fn connect(
        state: &HubState,
        client_id: &str,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        state.connections.register(client_id, tx);
        rx
    }

    fn register_frame(worker_id: &str, caps: &[&str]) -> Message {
        Message::register(&RegistrationPayload {
            worker_id: worker_id.into(),
            worker_type: "test".into(),
            capabilities: caps
                .iter()
                .map(|name| Capability::new(*name, ""))
                .collect(),
            metadata: Default::default(),
        })
    }

    #[tokio::test]
    async fn register_populates_registry_and_confirms() {
        let state = state();
        let handler = MessageHandler::new(Arc::clone(&state));
        let mut worker = connect(&state, "w1");

        handler.handle("w1", register_frame("w1", &["echo"])).await;

        let ack = worker.recv().await.unwrap();
        assert_eq!(ack.kind, MessageType::Response);
        assert!(!ack.is_error());
        let content: serde_json::Value =
            serde_json::from_str(&ack.content).unwrap();
        assert_eq!(content["status"], "registered");
        assert_eq!(content["worker_id"], "w1");

        let desc = state.registry.worker("w1").unwrap();
        assert_eq!(desc.status, WorkerStatus::Online);
        assert_eq!(state.registry.resolve("echo").as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn register_with_zero_capabilities_succeeds() {
        let state = state();
        let handler = MessageHandler::new(Arc::clone(&state));
        let mut worker = connect(&state, "w1");

        handler.handle("w1", register_frame("w1", &[])).await;

        let ack = worker.recv().await.unwrap();
        assert!(!ack.is_error());
        assert!(state.registry.worker("w1").is_some());
    }

    #[tokio::test]
    async fn malformed_registration_is_rejected() {
        let state = state();
        let handler = MessageHandler::new(Arc::clone(&state));
        let mut worker = connect(&state, "w1");

        let mut frame = Message::new(MessageType::Register);
        frame.from = "w1".into();
        frame.content = "not json".into();
        handler.handle("w1", frame).await;

        let reply = worker.recv().await.unwrap();
        assert!(reply.is_error());
        assert!(state.registry.worker("w1").is_none());
    }

    #[tokio::test]
    async fn discovery_returns_registry_snapshot() {
        let state = state();
        let handler = MessageHandler::new(Arc::clone(&state));
        let _worker = connect(&state, "w1");
        let mut client = connect(&state, "client");
        handler.handle("w1", register_frame("w1", &["echo"])).await;

        let mut query = Message::new(MessageType::Request);
        query.from = "client".into();
        query.channel = DISCOVERY_CHANNEL.into();
        handler.handle("client", query).await;

        let reply = client.recv().await.unwrap();
        let snapshot: DiscoveryResponse =
            serde_json::from_str(&reply.content).unwrap();
        assert!(snapshot.capabilities.contains_key("echo"));
        assert_eq!(snapshot.workers.len(), 1);
    }

    #[tokio::test]
    async fn discovery_by_content_action_is_intercepted() {
        let state = state();
        let handler = MessageHandler::new(Arc::clone(&state));
        let mut client = connect(&state, "client");

        let mut query = Message::new(MessageType::Request);
        query.from = "client".into();
        query.content = r#"{"action":"list_capabilities"}"#.into();
        handler.handle("client", query).await;

        let reply = client.recv().await.unwrap();
        assert_eq!(reply.kind, MessageType::Response);
        assert!(reply.content.contains("capabilities"));
    }

    #[tokio::test]
    async fn channel_membership_actions_manage_subscriptions() {
        let state = state();
        let handler = MessageHandler::new(Arc::clone(&state));

        let mut frame = Message::new(MessageType::Channel);
        frame.from = "c1".into();
        frame.channel = "news".into();
        frame.action = ACTION_SUBSCRIBE.into();
        handler.handle("c1", frame.clone()).await;
        assert_eq!(state.subscriptions.subscriber_count("news"), 1);

        frame.action = ACTION_UNSUBSCRIBE.into();
        handler.handle("c1", frame).await;
        assert_eq!(state.subscriptions.subscriber_count("news"), 0);
    }

    #[test]
    fn discovery_detection_reads_all_three_spellings() {
        let mut by_channel = Message::new(MessageType::Request);
        by_channel.channel = DISCOVERY_CHANNEL.into();
        assert!(is_discovery(&by_channel));

        let mut by_action = Message::new(MessageType::Request);
        by_action.action = ACTION_DISCOVER.into();
        assert!(is_discovery(&by_action));

        let mut by_content = Message::new(MessageType::Request);
        by_content.content = r#"{"action":"discover"}"#.into();
        assert!(is_discovery(&by_content));

        let mut plain = Message::new(MessageType::Request);
        plain.channel = "echo".into();
        assert!(!is_discovery(&plain));
    }
}
