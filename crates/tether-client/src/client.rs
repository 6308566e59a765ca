//! The [`Client`] handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tether_core::request::{
    CreateEntityBody, Empty, EntityRef, ListBody, LoginBody, RegisterBody, Secret, UpdateEntityBody, WatchBody,
};
use tether_core::wire::RegisterAck;
use tether_core::{AuthState, Entity, Identity, Request, Role, Selector, TetherError, UserId, Visibility};
use tether_transport::ByteStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{self, Command, ConnectionStatus, IdSequence, decode};
use crate::multiplexer::Responder;
use crate::watch::Watcher;

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    ids: Arc<IdSequence>,
    request_timeout: Option<Duration>,
    auth: watch::Receiver<AuthState>,
    status: watch::Receiver<ConnectionStatus>,
}

/// A multiplexed connection to a tether server.
///
/// Cheap to clone; every clone talks to the same connection actor. Any
/// number of requests may be in flight at once, each resolving only with
/// its own reply. The connection closes when [`Client::shutdown`] is called,
/// when the server ends it, or when the last clone (and watcher) is dropped.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connect to `config.addr`, over TLS when configured.
    pub async fn connect(config: &ClientConfig) -> Result<Self, TetherError> {
        let tls = config.tls.as_ref().map(|t| (&t.connector, t.server_name.as_str()));
        let stream = tether_transport::connect(&config.addr, tls)
            .await
            .map_err(|e| TetherError::HandshakeFailed { detail: e.to_string() })?;
        info!(addr = %config.addr, tls = config.tls.is_some(), "connected");
        Ok(Self::from_boxed(stream, config))
    }

    /// Run the protocol over an already-established stream.
    pub fn from_stream<S: ByteStream>(stream: S, config: &ClientConfig) -> Self {
        Self::from_boxed(Box::new(stream), config)
    }

    fn from_boxed(stream: tether_transport::BoxedStream, config: &ClientConfig) -> Self {
        let ids = Arc::new(IdSequence::default());
        let spawned = connection::spawn(stream, config.max_frame_bytes, Arc::clone(&ids));
        Self {
            shared: Arc::new(Shared {
                commands: spawned.commands,
                ids,
                request_timeout: config.request_timeout,
                auth: spawned.auth,
                status: spawned.status,
            }),
        }
    }

    pub(crate) fn submit(&self, cmd: Command) {
        if self.shared.commands.send(cmd).is_err() {
            debug!("connection actor gone, command dropped");
        }
    }

    fn closed_error(&self) -> TetherError {
        match &*self.shared.status.borrow() {
            ConnectionStatus::Closed(reason) => reason.to_error(),
            ConnectionStatus::Open => TetherError::ConnectionLost,
        }
    }

    async fn call<T>(
        &self,
        request: Request,
        responder: fn(oneshot::Sender<Result<T, TetherError>>) -> Responder,
    ) -> Result<T, TetherError> {
        request.validate()?;
        let (tx, rx) = oneshot::channel();
        let id = self.shared.ids.next();
        let kind = request.kind();
        let cmd = Command::Send {
            id: id.clone(),
            request,
            responder: responder(tx),
        };
        if self.shared.commands.send(cmd).is_err() {
            return Err(self.closed_error());
        }

        let outcome = match self.shared.request_timeout {
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, rx).await {
                    outcome
                } else {
                    debug!(request_id = %id, %kind, timeout_ms = limit.as_millis(), "request timed out");
                    self.submit(Command::Abandon(id));
                    return Err(TetherError::Timeout);
                }
            }
            None => rx.await,
        };
        outcome.unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// Send any request and wait for its raw reply body.
    pub async fn send(&self, request: Request) -> Result<Value, TetherError> {
        self.call(request, Responder::Value).await
    }

    // ── Typed helpers ───────────────────────────────────────────────

    /// `system.ping`
    pub async fn ping(&self) -> Result<Value, TetherError> {
        self.send(Request::Ping(Empty {})).await
    }

    /// `auth.login`; binds the returned identity to this connection.
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, TetherError> {
        let body = LoginBody {
            username: username.to_owned(),
            password: Secret::new(password),
        };
        decode(self.send(Request::Login(body)).await?)
    }

    /// `auth.logout`; closes every watcher on this connection.
    pub async fn logout(&self) -> Result<(), TetherError> {
        self.send(Request::Logout(Empty {})).await.map(|_| ())
    }

    /// `account.register`. On an anonymous connection the server closes the
    /// socket right after replying.
    pub async fn register(&self, username: &str, password: &str, role: Role) -> Result<UserId, TetherError> {
        let body = RegisterBody {
            username: username.to_owned(),
            password: Secret::new(password),
            role,
        };
        let ack: RegisterAck = decode(self.send(Request::Register(body)).await?)?;
        Ok(ack.user_id)
    }

    /// `account.remove` for the bound identity.
    pub async fn remove_account(&self) -> Result<(), TetherError> {
        self.send(Request::RemoveAccount(Empty {})).await.map(|_| ())
    }

    /// `entity.create`
    pub async fn create(
        &self,
        kind: &str,
        key: &str,
        data: Value,
        visibility: Visibility,
    ) -> Result<Entity, TetherError> {
        let body = CreateEntityBody {
            kind: kind.to_owned(),
            key: key.to_owned(),
            data,
            visibility,
        };
        decode(self.send(Request::CreateEntity(body)).await?)
    }

    /// `entity.update`
    pub async fn update(&self, kind: &str, key: &str, data: Value) -> Result<Entity, TetherError> {
        let body = UpdateEntityBody {
            kind: kind.to_owned(),
            key: key.to_owned(),
            data,
        };
        decode(self.send(Request::UpdateEntity(body)).await?)
    }

    /// `entity.remove`; returns the entity's last state.
    pub async fn remove(&self, kind: &str, key: &str) -> Result<Entity, TetherError> {
        decode(self.send(Request::RemoveEntity(entity_ref(kind, key))).await?)
    }

    /// `entity.get`
    pub async fn get(&self, kind: &str, key: &str) -> Result<Entity, TetherError> {
        decode(self.send(Request::GetEntity(entity_ref(kind, key))).await?)
    }

    /// `entity.list`
    pub async fn list(&self, kind: &str) -> Result<Vec<Entity>, TetherError> {
        let body = ListBody { kind: kind.to_owned() };
        decode(self.send(Request::ListEntities(body)).await?)
    }

    /// Subscribe to `selector`.
    ///
    /// The returned watcher is already registered: pushes arriving before a
    /// listener is attached are held, behind the snapshot, for the first
    /// listener.
    pub async fn watch(&self, selector: Selector) -> Result<Watcher, TetherError> {
        let opened = self
            .call(Request::Watch(WatchBody { selector }), Responder::Watch)
            .await?;
        Ok(Watcher::new(
            opened.watch_id,
            opened.selector,
            opened.snapshot,
            opened.state,
            self.clone(),
        ))
    }

    // ── Connection state ────────────────────────────────────────────

    /// Current authentication state.
    pub fn auth_state(&self) -> AuthState {
        self.shared.auth.borrow().clone()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Configured request timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.shared.request_timeout
    }

    /// Wait until the connection has closed, for whatever reason.
    pub async fn closed(&self) -> ConnectionStatus {
        let mut status = self.shared.status.clone();
        match status.wait_for(ConnectionStatus::is_closed).await {
            Ok(closed) => closed.clone(),
            Err(_) => self.status(),
        }
    }

    /// Close the connection. Pending requests resolve with
    /// [`TetherError::ConnectionLost`] and every watcher is closed.
    pub async fn shutdown(&self) -> ConnectionStatus {
        self.submit(Command::Shutdown);
        self.closed().await
    }
}

fn entity_ref(kind: &str, key: &str) -> EntityRef {
    EntityRef {
        kind: kind.to_owned(),
        key: key.to_owned(),
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("status", &*self.shared.status.borrow())
            .field("auth", &*self.shared.auth.borrow())
            .finish_non_exhaustive()
    }
}
