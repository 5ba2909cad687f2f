use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Opaque handle for one persistent add-in connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound side of every open add-in connection.
///
/// Each socket has a writer task draining its channel; the hub only holds the
/// senders, so dropping an entry never closes the socket by itself.
pub struct ConnectionHub {
    next_connection_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<String>>>,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            next_connection_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, tx: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        self.connections.write().await.insert(id, tx);
        id
    }

    pub async fn remove_connection(&self, connection: ConnectionId) {
        self.connections.write().await.remove(&connection);
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Serializes `message` and queues it on the connection's writer.
    ///
    /// Returns `false` when the connection is unknown or its writer is gone.
    pub async fn send_json<T: Serialize>(&self, connection: ConnectionId, message: &T) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(error) => {
                warn!(%connection, %error, "failed to serialize outbound message");
                return false;
            }
        };

        let connections = self.connections.read().await;
        match connections.get(&connection) {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }
}
