//! Dependencies shared by every handler, plus the per-call view of the
//! connection a request arrived on.

use std::sync::Arc;
use std::time::Instant;

use tether_core::{Identity, TetherError};

use crate::accounts::{AccountStore, MemoryAccountStore};
use crate::connection::ClientConnection;
use crate::publisher::WatchPublisher;
use crate::store::{EntityStore, MemoryEntityStore};

/// Shared context passed to every request handler.
#[derive(Clone)]
pub struct ServerContext {
    /// Account storage.
    pub accounts: Arc<dyn AccountStore>,
    /// Entity storage.
    pub entities: Arc<dyn EntityStore>,
    /// Watch fan-out.
    pub publisher: Arc<WatchPublisher>,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
}

impl ServerContext {
    /// Context over caller-supplied stores.
    pub fn new(accounts: Arc<dyn AccountStore>, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            accounts,
            entities,
            publisher: Arc::new(WatchPublisher::new()),
            start_time: Instant::now(),
        }
    }

    /// Context backed by in-process stores.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAccountStore::new()), Arc::new(MemoryEntityStore::new()))
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("publisher", &self.publisher)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

/// The connection and identity a request runs under.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Connection the request arrived on.
    pub conn: Arc<ClientConnection>,
    /// Identity bound to the connection when the request was read.
    pub identity: Option<Identity>,
}

impl CallContext {
    /// The bound identity, or `UNAUTHORIZED`.
    pub fn identity(&self) -> Result<&Identity, TetherError> {
        self.identity.as_ref().ok_or(TetherError::Unauthorized)
    }

    /// Whether the caller is an authenticated admin.
    pub fn is_admin(&self) -> bool {
        self.identity.as_ref().is_some_and(Identity::is_admin)
    }
}
