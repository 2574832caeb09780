//! The bidirectional stream endpoint.
//!
//! One accept loop; per connection, one receive-loop task driving the
//! framed reader and one writer task draining the connection's outbound
//! queue into the framed writer. The first inbound frame binds the client
//! id; any framing error is fatal to that connection only.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use ulid::Ulid;

use crate::error::HubResult;
use crate::hub::HubState;
use crate::hub::connections::OUTBOUND_QUEUE;
use crate::hub::handler::MessageHandler;
use crate::wire::codec::MessageCodec;
use crate::wire::{Message, MessageType};

pub struct HubServer {
    listener: TcpListener,
    state: Arc<HubState>,
}

impl HubServer {
    pub async fn bind(addr: &str, state: Arc<HubState>) -> HubResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> HubResult<()> {
        tracing::info!(addr = %self.local_addr()?, "Hub listening");
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                handle_connection(state, socket, peer).await;
            });
        }
    }
}

/// The client id a connection is keyed by: the registration's declared
/// worker id when the first frame is a REGISTER, else the frame's `from`,
/// else a synthesized id.
fn client_id_for(first: &Message) -> String {
    if first.kind == MessageType::Register
        && let Ok(content) =
            serde_json::from_str::<serde_json::Value>(&first.content)
        && let Some(worker_id) =
            content.get("worker_id").and_then(|id| id.as_str())
        && !worker_id.is_empty()
    {
        return worker_id.to_owned();
    }
    if !first.from.is_empty() {
        return first.from.clone();
    }
    format!("client-{}", Ulid::new())
}

async fn handle_connection(
    state: Arc<HubState>,
    socket: TcpStream,
    peer: std::net::SocketAddr,
) {
    socket.set_nodelay(true).ok();
    let (read_half, write_half) = socket.into_split();
    let mut inbound = FramedRead::new(read_half, MessageCodec::new());
    let mut sink = FramedWrite::new(write_half, MessageCodec::new());

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = sink.send(msg).await {
                tracing::debug!(%err, "Write failed, stopping writer");
                break;
            }
        }
    });

    // The connection exists only once its first frame names it.
    let first = match inbound.next().await {
        Some(Ok(msg)) => msg,
        Some(Err(err)) => {
            tracing::warn!(%peer, %err, "Framing error before first frame");
            writer.abort();
            return;
        }
        None => {
            writer.abort();
            return;
        }
    };

    let client_id = client_id_for(&first);
    let connection_id = state.connections.register(&client_id, tx);
    let handler = MessageHandler::new(Arc::clone(&state));
    handler.handle(&client_id, first).await;

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(msg) => handler.handle(&client_id, msg).await,
            Err(err) => {
                tracing::warn!(client_id, %err, "Framing error, closing");
                break;
            }
        }
    }

    // Only the connection that still owns the id tears its state down; a
    // superseded connection must leave the replacement untouched.
    if state
        .connections
        .unregister(&client_id, Some(connection_id))
    {
        state.subscriptions.remove_client(&client_id);
        state.registry.unregister(&client_id);
    }
    tracing::info!(client_id, %peer, "Connection ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        Capability, DISCOVERY_CHANNEL, DiscoveryResponse,
        RegistrationPayload, meta,
    };
    use tokio::time::{Duration, timeout};

    type Client = (
        FramedWrite<tokio::net::tcp::OwnedWriteHalf, MessageCodec>,
        FramedRead<tokio::net::tcp::OwnedReadHalf, MessageCodec>,
    );

    async fn start_hub() -> (std::net::SocketAddr, Arc<HubState>) {
        let state = HubState::new(None);
        let server = HubServer::bind("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, state)
    }

    async fn connect(addr: std::net::SocketAddr) -> Client {
        let socket = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = socket.into_split();
        (
            FramedWrite::new(write_half, MessageCodec::new()),
            FramedRead::new(read_half, MessageCodec::new()),
        )
    }

    async fn recv(client: &mut Client) -> Message {
        timeout(Duration::from_secs(5), client.1.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("framing error")
    }

    fn registration(worker_id: &str, caps: &[&str]) -> Message {
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
    async fn register_then_invoke_round_trips() {
        let (addr, _state) = start_hub().await;

        let mut worker = connect(addr).await;
        worker.0.send(registration("w1", &["echo"])).await.unwrap();
        assert!(!recv(&mut worker).await.is_error());

        let mut client = connect(addr).await;
        let req = Message::request("client", "", "echo", r#"{"msg":"hi"}"#);
        let req_id = req.id.clone();
        client.0.send(req).await.unwrap();

        // Worker sees the routed request and answers it.
        let inbound = recv(&mut worker).await;
        assert_eq!(inbound.id, req_id);
        let reply =
            Message::response_to(&inbound, "w1", r#"{"echo":"hi"}"#);
        worker.0.send(reply).await.unwrap();

        let resp = recv(&mut client).await;
        assert_eq!(resp.id, req_id);
        assert_eq!(resp.content, r#"{"echo":"hi"}"#);
        assert_eq!(resp.metadata[meta::REQUEST_ID], req_id);
    }

    #[tokio::test]
    async fn disconnect_unregisters_worker() {
        let (addr, state) = start_hub().await;

        let mut worker = connect(addr).await;
        worker.0.send(registration("w1", &["echo"])).await.unwrap();
        recv(&mut worker).await;
        assert!(state.registry.resolve("echo").is_some());

        drop(worker);
        // Teardown is asynchronous; poll briefly.
        for _ in 0..50 {
            if state.registry.resolve("echo").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(state.registry.resolve("echo").is_none());
        assert!(!state.connections.is_connected("w1"));
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_registration() {
        let (addr, state) = start_hub().await;

        let mut first = connect(addr).await;
        first.0.send(registration("w1", &["ping"])).await.unwrap();
        recv(&mut first).await;

        let mut second = connect(addr).await;
        second
            .0
            .send(registration("w1", &["ping", "pong"]))
            .await
            .unwrap();
        recv(&mut second).await;

        // The superseded stream going away must not unregister w1.
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.connections.is_connected("w1"));
        assert_eq!(state.registry.resolve("pong").as_deref(), Some("w1"));

        // And the reconnected stream is the one that gets routed to.
        let mut client = connect(addr).await;
        client
            .0
            .send(Message::request("client", "", "ping", "{}"))
            .await
            .unwrap();
        let inbound = recv(&mut second).await;
        assert_eq!(inbound.channel, "ping");
    }

    #[tokio::test]
    async fn discovery_over_the_wire() {
        let (addr, _state) = start_hub().await;

        let mut worker = connect(addr).await;
        worker
            .0
            .send(registration("w1", &["echo", "reverse"]))
            .await
            .unwrap();
        recv(&mut worker).await;

        let mut client = connect(addr).await;
        let mut query = Message::new(MessageType::Request);
        query.from = "client".into();
        query.channel = DISCOVERY_CHANNEL.into();
        client.0.send(query).await.unwrap();

        let reply = recv(&mut client).await;
        let snapshot: DiscoveryResponse =
            serde_json::from_str(&reply.content).unwrap();
        assert_eq!(snapshot.capabilities.len(), 2);
        assert_eq!(snapshot.workers[0].id, "w1");
    }

    #[tokio::test]
    async fn framing_garbage_kills_only_that_connection() {
        let (addr, state) = start_hub().await;

        let mut worker = connect(addr).await;
        worker.0.send(registration("w1", &["echo"])).await.unwrap();
        recv(&mut worker).await;

        // A client that speaks garbage gets dropped...
        let mut raw = TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(
            &mut raw,
            &[0xff, 0xff, 0xff, 0xff, 0x00],
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // ...while the registered worker keeps serving.
        assert!(state.connections.is_connected("w1"));
        let mut client = connect(addr).await;
        client
            .0
            .send(Message::request("client", "", "echo", "{}"))
            .await
            .unwrap();
        assert_eq!(recv(&mut worker).await.channel, "echo");
    }
}
