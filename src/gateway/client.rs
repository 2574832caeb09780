//! The gateway's long-lived hub client.
//!
//! Mirrors the worker SDK's connect step but registers no capabilities.
//! Outgoing requests park a oneshot sender in a pending map keyed by the
//! request id; a background read loop demultiplexes RESPONSE frames into
//! it. A response with no matching entry is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{HubError, HubResult};
use crate::wire::codec::MessageCodec;
use crate::wire::{
    DISCOVERY_CHANNEL, DiscoveryResponse, Message, MessageType,
};

const OUTBOUND_QUEUE: usize = 100;

struct ClientShared {
    client_id: String,
    outbound: mpsc::Sender<Message>,
    pending: DashMap<String, oneshot::Sender<Message>>,
}

#[derive(Clone)]
pub struct HubClient {
    shared: Arc<ClientShared>,
}

impl HubClient {
    pub async fn connect(
        hub_addr: &str,
        client_id: impl Into<String>,
    ) -> HubResult<Self> {
        let client_id = client_id.into();
        let socket = TcpStream::connect(hub_addr).await?;
        socket.set_nodelay(true).ok();
        let (read_half, write_half) = socket.into_split();
        let mut inbound = FramedRead::new(read_half, MessageCodec::new());
        let mut sink = FramedWrite::new(write_half, MessageCodec::new());

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let shared = Arc::new(ClientShared {
            client_id,
            outbound: tx,
            pending: DashMap::new(),
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = inbound.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::warn!(%err, "Hub stream error");
                        break;
                    }
                };
                if msg.kind != MessageType::Response {
                    tracing::debug!(kind = %msg.kind, "Ignoring frame");
                    continue;
                }
                let key = msg.request_ref().to_owned();
                match reader_shared.pending.remove(&key) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(msg);
                    }
                    None => {
                        tracing::debug!(
                            request_id = %key,
                            "Dropping unmatched response"
                        );
                    }
                }
            }
            // Dropping the map wakes every parked request with an error.
            reader_shared.pending.clear();
            tracing::warn!("Hub connection closed");
        });

        Ok(Self { shared })
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Send a request frame and wait for its correlated response.
    pub async fn request(
        &self,
        mut msg: Message,
        timeout: Duration,
    ) -> HubResult<Message> {
        if msg.from.is_empty() {
            msg.from = self.shared.client_id.clone();
        }
        let request_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id.clone(), tx);
        if self.shared.outbound.send(msg).await.is_err() {
            self.shared.pending.remove(&request_id);
            return Err(HubError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.shared.pending.remove(&request_id);
                Err(HubError::Disconnected)
            }
            Err(_) => {
                // Late responses find no entry and are dropped.
                self.shared.pending.remove(&request_id);
                Err(HubError::Timeout)
            }
        }
    }

    /// Ask the hub for its capability and worker tables.
    pub async fn discover(
        &self,
        timeout: Duration,
    ) -> HubResult<DiscoveryResponse> {
        let mut query = Message::new(MessageType::Request);
        query.channel = DISCOVERY_CHANNEL.into();
        query.content = Value::Object(Default::default()).to_string();

        let response = self.request(query, timeout).await?;
        Ok(serde_json::from_str(&response.content)?)
    }
}
