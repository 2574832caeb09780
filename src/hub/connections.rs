//! Registry of connected clients and their outbound queues.
//!
//! Every connection gets one bounded mpsc queue; the stream endpoint spawns
//! a writer task that drains it into the socket. Components that need to
//! reach a client go through this map, never through a raw stream handle,
//! so a handle is unreachable the moment its client disconnects.
//!
//! ## Connection id for safe cleanup
//!
//! Reconnection with an id that is still registered supersedes the old
//! entry. Each entry carries a unique, monotonically increasing
//! `connection_id` so the superseded connection's teardown cannot remove
//! the entry that replaced it:
//!
//! ```text
//! Connection A (id=1):  [register]─────────[exit]─[unregister(id=1)]
//!                                              │
//! Connection B (id=2):              [register]─┼───────────────────▶
//!                                              │
//!                                     id check: entry has id=2, no-op
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{HubError, HubResult};
use crate::wire::Message;

/// Outbound queue capacity per connection. A full queue blocks the sender,
/// which back-pressures the receive loop whose traffic is filling it.
pub const OUTBOUND_QUEUE: usize = 100;

struct ConnectionEntry {
    tx: mpsc::Sender<Message>,
    connection_id: u64,
}

pub struct ConnectionManager {
    connections: DashMap<String, ConnectionEntry>,
    connection_id_counter: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            connection_id_counter: AtomicU64::new(0),
        }
    }

    /// Register a client's outbound queue, superseding any existing entry
    /// for the same id. Returns the connection id to pass to
    /// [`unregister`](Self::unregister) at teardown.
    pub fn register(
        &self,
        client_id: &str,
        tx: mpsc::Sender<Message>,
    ) -> u64 {
        let connection_id =
            self.connection_id_counter.fetch_add(1, Ordering::Relaxed);
        let superseded = self
            .connections
            .insert(
                client_id.to_owned(),
                ConnectionEntry { tx, connection_id },
            )
            .is_some();
        tracing::info!(client_id, connection_id, superseded, "Client connected");
        connection_id
    }

    /// Remove a client's entry.
    ///
    /// With `Some(id)` the entry is removed only while it still belongs to
    /// that connection; a superseded connection's cleanup is then a no-op.
    /// `None` force-removes whatever is registered. Returns whether an
    /// entry was removed.
    pub fn unregister(
        &self,
        client_id: &str,
        connection_id: Option<u64>,
    ) -> bool {
        let removed = match connection_id {
            Some(id) => self
                .connections
                .remove_if(client_id, |_, entry| entry.connection_id == id)
                .is_some(),
            None => self.connections.remove(client_id).is_some(),
        };
        if removed {
            tracing::info!(client_id, "Client disconnected");
        }
        removed
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn sender(&self, client_id: &str) -> Option<mpsc::Sender<Message>> {
        self.connections.get(client_id).map(|entry| entry.tx.clone())
    }

    /// Queue a message for one client. Waits for queue capacity; fails only
    /// when the client is not connected or its writer has gone away.
    pub async fn send(&self, to: &str, msg: Message) -> HubResult<()> {
        let Some(tx) = self.sender(to) else {
            return Err(HubError::UnknownTarget(to.to_owned()));
        };
        if tx.send(msg).await.is_err() {
            // Writer task exited; the receive loop will unregister soon,
            // but don't leave a dead entry addressable meanwhile.
            self.unregister(to, None);
            return Err(HubError::Disconnected);
        }
        Ok(())
    }

    /// Best-effort fan-out to every connected client except `from`. Send
    /// errors are swallowed; the dead connection's own receive loop will
    /// notice and clean up.
    pub async fn broadcast(&self, from: &str, msg: &Message) -> usize {
        let targets: Vec<(String, mpsc::Sender<Message>)> = self
            .connections
            .iter()
            .filter(|entry| entry.key() != from)
            .map(|entry| (entry.key().clone(), entry.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (client_id, tx) in targets {
            if tx.send(msg.clone()).await.is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(client_id, "Broadcast target gone");
            }
        }
        delivered
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
