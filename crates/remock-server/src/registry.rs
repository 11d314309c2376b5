//! Connection registry: per-connection state and the live-connection table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use remock_core::ConnectionId;
use remock_core::protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connected interceptor client.
///
/// Only successfully authenticated sockets are ever registered, so
/// presence in the registry implies authentication; `token_id` records
/// which credential (if any) the handshake used.
pub struct Connection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Id of the interceptor token that authenticated this connection,
    /// when the server has a tokens directory configured.
    token_id: Option<String>,
    /// Outbound frames to the connection's WebSocket write loop.
    tx: mpsc::Sender<ServerMessage>,
    /// Cancelling this token closes the connection.
    cancel: CancellationToken,
    /// Whether the client has shown liveness since the last heartbeat check.
    is_alive: AtomicBool,
    /// Frames dropped because the outbound queue was full.
    dropped: AtomicU64,
    /// When the connection was registered.
    pub connected_at: Instant,
}

impl Connection {
    fn new(
        token_id: Option<String>,
        tx: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            token_id,
            tx,
            cancel,
            is_alive: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    /// Token id this connection authenticated with, if any.
    pub fn token_id(&self) -> Option<&str> {
        self.token_id.as_deref()
    }

    /// Queue a frame for delivery. Returns `false` (and counts the drop)
    /// if the queue is full or the write loop is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                connection_id = %self.id,
                total_drops = dropped,
                "outbound queue full or closed, dropping frame"
            );
            false
        }
    }

    /// Request this connection to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that fires when the connection should close.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record liveness (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the liveness flag; returns whether the client was
    /// alive since the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Frames dropped so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register an authenticated connection. Returns the connection and
    /// the receiver its write loop drains.
    pub fn register(
        &self,
        token_id: Option<String>,
        cancel: CancellationToken,
        queue_size: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let connection = Arc::new(Connection::new(token_id, tx, cancel));
        let _ = self
            .connections
            .insert(connection.id.clone(), Arc::clone(&connection));
        (connection, rx)
    }

    /// Remove a connection. The caller is responsible for the cascade
    /// (uncommitting its handlers, failing its pending calls).
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, c)| c)
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Request every live connection to close.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
