use conductor_core::{ConductorError, ConductorResult, Event, EventSink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Represents a connected WebSocket client.
#[derive(Debug)]
pub struct Connection {
    /// Connection id, unique per socket.
    pub id: Uuid,
    /// Session id sent in the welcome frame.
    pub session_id: Uuid,
    /// Outbound frames for the socket writer.
    pub tx: mpsc::UnboundedSender<String>,
}

/// Manages active WebSocket connections.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionManager {
    /// Empty manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a new connection.
    pub async fn add(&self, conn: Connection) {
        let id = conn.id;
        self.connections.write().await.insert(id, conn);
        tracing::info!(connection_id = %id, "Connection added");
    }

    /// Stop tracking a connection, returning it if present.
    pub async fn remove(&self, id: Uuid) -> Option<Connection> {
        let removed = self.connections.write().await.remove(&id);
        tracing::info!(connection_id = %id, "Connection removed");
        removed
    }

    /// Send a frame to one connection. Returns false if it is gone.
    pub async fn send_to(&self, id: Uuid, message: &str) -> bool {
        match self.connections.read().await.get(&id) {
            Some(conn) => conn.tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

/// Event-bus subscriber that writes every event as a JSON text frame.
pub struct ConnectionSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionSink {
    /// Sink writing into the socket's outbound channel.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl EventSink for ConnectionSink {
    fn deliver(&self, event: &Event) -> ConductorResult<()> {
        let frame = serde_json::to_string(event)?;
        self.tx
            .send(frame)
            .map_err(|_| ConductorError::SubscriberClosed)
    }
}
