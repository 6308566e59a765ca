//! Server-side connection handle and the registry of open connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use tether_core::{ConnectionId, ServerFrame};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::PUSH_DROPS_TOTAL;

/// One connected client, as seen by the rest of the server.
///
/// Frames go through a bounded queue drained by the session's writer task.
/// Replies wait for queue space; pushes never wait, and a push that does not
/// fit marks the connection as too slow and closes it.
#[derive(Debug)]
pub struct ClientConnection {
    /// Unique connection id.
    pub id: ConnectionId,
    tx: mpsc::Sender<ServerFrame>,
    closer: CancellationToken,
    /// When the connection was established.
    pub connected_at: Instant,
    dropped_pushes: AtomicU64,
}

impl ClientConnection {
    /// Create a connection handle writing into `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id,
            tx,
            closer: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped_pushes: AtomicU64::new(0),
        }
    }

    /// Enqueue a correlated reply (or close frame), waiting for queue space.
    ///
    /// Returns `false` once the writer is gone.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Enqueue a push without waiting.
    ///
    /// A full queue drops the push, counts it and asks the session to close,
    /// so the subscriber observes a lost connection rather than a gap.
    pub fn push(&self, frame: ServerFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.drop_push();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Count a push that could not be queued and close the connection.
    pub fn drop_push(&self) {
        let _ = self.dropped_pushes.fetch_add(1, Ordering::Relaxed);
        counter!(PUSH_DROPS_TOTAL).increment(1);
        if !self.closer.is_cancelled() {
            warn!(conn_id = %self.id, "outbound queue full, closing slow connection");
        }
        self.closer.cancel();
    }

    /// Outbound queue depth.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Pushes dropped on this connection.
    pub fn dropped_pushes(&self) -> u64 {
        self.dropped_pushes.load(Ordering::Relaxed)
    }

    /// Ask the session to terminate.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Whether termination was requested.
    pub fn is_closing(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves when termination was requested.
    pub async fn closing(&self) {
        self.closer.cancelled().await;
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Open connections indexed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self
            .connections
            .write()
            .await
            .insert(connection.id.clone(), connection);
    }

    /// Remove a connection by id.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.write().await.remove(id)
    }

    /// Look up a connection.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Number of open connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}
