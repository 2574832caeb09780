//! Worker SDK: connect, register, serve, call other workers.
//!
//! A worker declares capabilities with handlers, then [`Worker::run`]s the
//! state machine every hub worker follows: connect the stream, send one
//! REGISTER listing the capabilities, then serve inbound REQUEST /
//! WORKER_CALL frames from a local handler table. Handlers get a
//! [`HubHandle`] so they can issue worker-to-worker calls while a request
//! is in flight.
//!
//! ```ignore
//! let worker = Worker::new("rust-worker", "rust").capability(
//!     Capability::new("echo", "Echo the payload back"),
//!     handler_fn(|_hub, params| async move { Ok(params) }),
//! );
//! worker.run("127.0.0.1:50051").await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{HubError, HubResult};
use crate::wire::codec::MessageCodec;
use crate::wire::{Capability, Message, MessageType, RegistrationPayload};

/// Default wait for a worker-to-worker call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound queue between the worker's tasks and its socket writer.
const OUTBOUND_QUEUE: usize = 100;

/// A capability implementation.
///
/// Return an object when possible; scalar results are wrapped as
/// `{"result": x}` before they hit the wire. An `Err` becomes an error
/// RESPONSE with `metadata[status] = "error"`.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn handle(
        &self,
        hub: HubHandle,
        params: Value,
    ) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> CapabilityHandler for FnHandler<F>
where
    F: Fn(HubHandle, Value) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        hub: HubHandle,
        params: Value,
    ) -> anyhow::Result<Value> {
        (self.0)(hub, params).await
    }
}

/// Wrap an async closure as a [`CapabilityHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CapabilityHandler>
where
    F: Fn(HubHandle, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(
        move |hub, params| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(f(hub, params))
        },
    ))
}

struct SdkShared {
    worker_id: String,
    outbound: mpsc::Sender<Message>,
    pending: DashMap<String, oneshot::Sender<Message>>,
}

/// Cloneable handle onto the worker's hub connection.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<SdkShared>,
}

impl HubHandle {
    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    /// Send a raw frame to the hub.
    pub async fn send(&self, msg: Message) -> HubResult<()> {
        self.shared
            .outbound
            .send(msg)
            .await
            .map_err(|_| HubError::Disconnected)
    }

    /// Call a capability on another worker and wait for its response.
    ///
    /// On timeout the pending entry is removed and a late response is
    /// dropped. An error RESPONSE surfaces as [`HubError::Handler`] with
    /// the upstream error text.
    pub async fn call(
        &self,
        target: &str,
        capability: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> HubResult<Value> {
        let msg = Message::worker_call(
            self.shared.worker_id.clone(),
            target,
            capability,
            params.to_string(),
        );
        let call_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(call_id.clone(), tx);
        if let Err(err) = self.send(msg).await {
            self.shared.pending.remove(&call_id);
            return Err(err);
        }

        let response = match tokio::time::timeout(
            timeout.unwrap_or(CALL_TIMEOUT),
            rx,
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.shared.pending.remove(&call_id);
                return Err(HubError::Disconnected);
            }
            Err(_) => {
                self.shared.pending.remove(&call_id);
                return Err(HubError::Timeout);
            }
        };

        if response.is_error() {
            let error = serde_json::from_str::<Value>(&response.content)
                .ok()
                .and_then(|content| {
                    content.get("error").and_then(|e| e.as_str()).map(str::to_owned)
                })
                .unwrap_or_else(|| response.content.clone());
            return Err(HubError::Handler(error));
        }
        Ok(serde_json::from_str(&response.content)
            .unwrap_or(Value::String(response.content)))
    }
}

/// Builder for a hub worker.
pub struct Worker {
    id: String,
    worker_type: String,
    metadata: HashMap<String, String>,
    capabilities: Vec<Capability>,
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        worker_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            worker_type: worker_type.into(),
            metadata: HashMap::new(),
            capabilities: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Declare a capability together with its handler.
    pub fn capability(
        mut self,
        capability: Capability,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        self.handlers.insert(capability.name.clone(), handler);
        self.capabilities.push(capability);
        self
    }

    pub fn metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Connect to the hub and send the REGISTER frame. The returned
    /// connection serves until the stream ends; registration confirmation
    /// is awaited optimistically inside the serve loop.
    pub async fn connect(
        self,
        hub_addr: &str,
    ) -> HubResult<WorkerConnection> {
        let socket = TcpStream::connect(hub_addr).await?;
        socket.set_nodelay(true).ok();
        let (read_half, write_half) = socket.into_split();
        let inbound = FramedRead::new(read_half, MessageCodec::new());
        let mut sink = FramedWrite::new(write_half, MessageCodec::new());

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let shared = Arc::new(SdkShared {
            worker_id: self.id.clone(),
            outbound: tx,
            pending: DashMap::new(),
        });

        let registration = RegistrationPayload {
            worker_id: self.id.clone(),
            worker_type: self.worker_type.clone(),
            capabilities: self.capabilities.clone(),
            metadata: self.metadata.clone(),
        };
        let handle = HubHandle {
            shared: Arc::clone(&shared),
        };
        handle.send(Message::register(&registration)).await?;
        tracing::info!(
            worker_id = %self.id,
            capabilities = self.capabilities.len(),
            "Registered with hub"
        );

        Ok(WorkerConnection {
            inbound,
            shared,
            handlers: Arc::new(self.handlers),
        })
    }

    /// Connect, register and serve until the hub goes away.
    pub async fn run(self, hub_addr: &str) -> HubResult<()> {
        self.connect(hub_addr).await?.serve().await
    }
}

pub struct WorkerConnection {
    inbound: FramedRead<OwnedReadHalf, MessageCodec>,
    shared: Arc<SdkShared>,
    handlers: Arc<HashMap<String, Arc<dyn CapabilityHandler>>>,
}

impl WorkerConnection {
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drive the serve loop: dispatch invocations to handlers on their own
    /// tasks, demultiplex responses into pending worker-to-worker calls.
    pub async fn serve(mut self) -> HubResult<()> {
        while let Some(frame) = self.inbound.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(%err, "Stream error, shutting down");
                    return Err(err);
                }
            };
            match msg.kind {
                MessageType::Request | MessageType::WorkerCall => {
                    let handlers = Arc::clone(&self.handlers);
                    let handle = self.handle();
                    tokio::spawn(async move {
                        dispatch(handlers, handle, msg).await;
                    });
                }
                MessageType::Response => {
                    let key = msg.request_ref().to_owned();
                    if let Some((_, waiter)) =
                        self.shared.pending.remove(&key)
                    {
                        let _ = waiter.send(msg);
                    } else {
                        // Registration ack or a late response.
                        tracing::debug!(
                            request_id = %key,
                            "Unmatched response"
                        );
                    }
                }
                other => {
                    tracing::debug!(kind = %other, "Ignoring frame");
                }
            }
        }
        tracing::info!("Hub closed the stream");
        Ok(())
    }
}

async fn dispatch(
    handlers: Arc<HashMap<String, Arc<dyn CapabilityHandler>>>,
    handle: HubHandle,
    msg: Message,
) {
    let worker_id = handle.worker_id().to_owned();
    let Some(capability) = msg.capability() else {
        let reply = Message::error_response_to(
            &msg,
            worker_id.as_str(),
            "request names no capability",
        );
        let _ = handle.send(reply).await;
        return;
    };

    let Some(handler) = handlers.get(&capability) else {
        let reply = Message::error_response_to(
            &msg,
            worker_id.as_str(),
            &format!("unknown capability: {capability}"),
        );
        let _ = handle.send(reply).await;
        return;
    };

    let params = serde_json::from_str::<Value>(&msg.content)
        .unwrap_or_else(|_| serde_json::json!({}));

    let reply = match handler.handle(handle.clone(), params).await {
        Ok(result) => {
            // Scalars go out wrapped so content is always a JSON object.
            let result = if result.is_object() {
                result
            } else {
                serde_json::json!({ "result": result })
            };
            Message::response_to(&msg, worker_id.as_str(), result.to_string())
        }
        Err(err) => {
            tracing::warn!(%capability, error = %err, "Handler failed");
            Message::error_response_to(&msg, worker_id.as_str(), &err.to_string())
        }
    };
    let _ = handle.send(reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::meta;

    fn sdk_fixture() -> (
        Arc<HashMap<String, Arc<dyn CapabilityHandler>>>,
        HubHandle,
        mpsc::Receiver<Message>,
    ) {
        let mut handlers: HashMap<String, Arc<dyn CapabilityHandler>> =
            HashMap::new();
        handlers.insert(
            "echo".into(),
            handler_fn(|_hub, params| async move {
                Ok(serde_json::json!({ "echo": params["msg"] }))
            }),
        );
        handlers.insert(
            "count".into(),
            handler_fn(|_hub, _params| async move {
                Ok(serde_json::json!(42))
            }),
        );
        handlers.insert(
            "fail".into(),
            handler_fn(|_hub, _params| async move {
                anyhow::bail!("kaboom")
            }),
        );

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = HubHandle {
            shared: Arc::new(SdkShared {
                worker_id: "w1".into(),
                outbound: tx,
                pending: DashMap::new(),
            }),
        };
        (Arc::new(handlers), handle, rx)
    }

    #[tokio::test]
    async fn dispatch_runs_handler_and_replies() {
        let (handlers, handle, mut rx) = sdk_fixture();
        let req = Message::request("client", "w1", "echo", r#"{"msg":"hi"}"#);
        let id = req.id.clone();

        dispatch(handlers, handle, req).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.id, id);
        assert_eq!(reply.to, "client");
        assert_eq!(reply.metadata[meta::REQUEST_ID], id);
        assert_eq!(reply.metadata[meta::STATUS], meta::SUCCESS);
        let content: Value = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(content["echo"], "hi");
    }

    #[tokio::test]
    async fn scalar_results_are_wrapped() {
        let (handlers, handle, mut rx) = sdk_fixture();
        dispatch(
            handlers,
            handle,
            Message::request("client", "w1", "count", "{}"),
        )
        .await;

        let reply = rx.recv().await.unwrap();
        let content: Value = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(content["result"], 42);
    }

    #[tokio::test]
    async fn handler_errors_become_error_responses() {
        let (handlers, handle, mut rx) = sdk_fixture();
        dispatch(
            handlers,
            handle,
            Message::request("client", "w1", "fail", "{}"),
        )
        .await;

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_error());
        let content: Value = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(content["error"], "kaboom");
        assert_eq!(content["status"], "failed");
    }

    #[tokio::test]
    async fn unknown_capability_is_reported() {
        let (handlers, handle, mut rx) = sdk_fixture();
        dispatch(
            handlers,
            handle,
            Message::request("client", "w1", "missing", "{}"),
        )
        .await;

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_error());
        assert!(reply.content.contains("unknown capability: missing"));
    }

    #[tokio::test]
    async fn call_times_out_and_clears_pending() {
        let (_handlers, handle, _rx) = sdk_fixture();
        let err = handle
            .call(
                "other",
                "slow",
                serde_json::json!({}),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout));
        assert!(handle.shared.pending.is_empty());
    }
}
