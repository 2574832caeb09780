//! Message routing.
//!
//! The router turns an inbound frame into deliveries on the per-connection
//! outbound queues. REGISTER frames and discovery queries never reach it;
//! the [`handler`](crate::hub::handler) intercepts those first. Deliveries
//! are at-most-once: a frame that cannot be delivered is dropped with a log
//! line, never queued for later.

use std::sync::Arc;

use crate::error::HubError;
use crate::hub::connections::ConnectionManager;
use crate::hub::registry::ServiceRegistry;
use crate::hub::subscriptions::SubscriptionManager;
use crate::hub::tracker::RequestTracker;
use crate::wire::{HUB_ADDRESS_NAME, Message, MessageType};

pub const HUB_SENDER: &str = "hub";

#[derive(Clone)]
pub struct Router {
    connections: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionManager>,
    registry: Arc<ServiceRegistry>,
    tracker: Arc<RequestTracker>,
}

impl Router {
    pub fn new(
        connections: Arc<ConnectionManager>,
        subscriptions: Arc<SubscriptionManager>,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            registry,
            tracker,
        }
    }

    pub async fn route(&self, msg: Message) {
        match msg.kind {
            // Handled upstream; reaching the router is a handler bug.
            MessageType::Register => {
                tracing::warn!(from = %msg.from, "REGISTER reached the router");
            }
            MessageType::WorkerCall => self.route_worker_call(msg).await,
            MessageType::Response => self.route_response(msg).await,
            MessageType::Request => self.route_request(msg).await,
            MessageType::Direct => {
                if let Err(err) =
                    self.connections.send(&msg.to, msg.clone()).await
                {
                    tracing::info!(to = %msg.to, %err, "Dropping DIRECT");
                }
            }
            MessageType::Broadcast => {
                self.connections.broadcast(&msg.from, &msg).await;
            }
            MessageType::Channel => {
                self.subscriptions
                    .publish(&msg.channel, &msg, &self.connections)
                    .await;
            }
        }
    }

    /// WORKER_CALL: `to` must name a currently connected worker; otherwise
    /// the caller gets a synthesized error RESPONSE and the original is
    /// dropped. Connected targets get the frame unchanged.
    async fn route_worker_call(&self, msg: Message) {
        if msg.to.is_empty() || !self.connections.is_connected(&msg.to) {
            tracing::info!(
                from = %msg.from,
                to = %msg.to,
                "WORKER_CALL target not connected"
            );
            self.reply_error(
                &msg,
                &HubError::UnknownTarget(msg.to.clone()).to_string(),
            )
            .await;
            return;
        }
        self.tracker.track(
            &msg.id,
            &msg.from,
            &msg.to,
            &msg.capability().unwrap_or_default(),
        );
        if let Err(err) = self.connections.send(&msg.to.clone(), msg).await {
            tracing::info!(%err, "Dropping WORKER_CALL");
        }
    }

    /// RESPONSE: back-fill an empty `to` from the tracker, forward, then
    /// release the pending entry. Unroutable responses are dropped; the
    /// caller will time out on its own.
    async fn route_response(&self, mut msg: Message) {
        let request_id = msg.request_ref().to_owned();
        if msg.to.is_empty()
            && let Some(requester) = self.tracker.requester_of(&request_id)
        {
            msg.to = requester;
        }
        if msg.to.is_empty() {
            tracing::info!(%request_id, "Dropping RESPONSE with no requester");
            return;
        }
        match self.connections.send(&msg.to.clone(), msg).await {
            Ok(()) => {
                self.tracker.complete(&request_id);
            }
            Err(err) => {
                tracing::info!(%request_id, %err, "Dropping RESPONSE");
                self.tracker.complete(&request_id);
            }
        }
    }

    /// REQUEST: direct-route when `to` names a worker, otherwise resolve
    /// through the capability index. Either way the request is tracked so
    /// the response can find its way back.
    async fn route_request(&self, mut msg: Message) {
        let capability = msg.capability().unwrap_or_default();

        if msg.to.is_empty() || msg.to == HUB_ADDRESS_NAME {
            let Some(worker_id) = self.registry.resolve(&capability) else {
                tracing::info!(
                    from = %msg.from,
                    %capability,
                    "No worker for capability"
                );
                self.reply_error(
                    &msg,
                    &HubError::UnknownCapability(capability.clone())
                        .to_string(),
                )
                .await;
                return;
            };
            msg.to = worker_id;
        }

        self.tracker
            .track(&msg.id, &msg.from, &msg.to, &capability);
        let to = msg.to.clone();
        if let Err(err) = self.connections.send(&to, msg.clone()).await {
            // Registry said online but the stream is gone (e.g. a row
            // restored from the store); fail fast instead of letting the
            // caller time out.
            tracing::info!(%capability, %err, "REQUEST target unreachable");
            self.tracker.complete(&msg.id);
            self.reply_error(&msg, &HubError::UnknownTarget(to).to_string())
                .await;
        }
    }

    /// Synthesize an error RESPONSE back to the frame's sender; dropped if
    /// the sender is gone too.
    async fn reply_error(&self, original: &Message, error: &str) {
        let reply = Message::error_response_to(original, HUB_SENDER, error);
        if self.connections.send(&original.from, reply).await.is_err() {
            tracing::debug!(from = %original.from, "Error reply undeliverable");
        }
    }
}
