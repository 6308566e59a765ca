//! The connection actor.
//!
//! One task per socket owns the pending-request table, the watch registry
//! and the authentication state. Callers talk to it through [`Command`]s;
//! inbound frames are processed one at a time, so neither table needs a
//! lock. Writes go through a separate forwarder task so a slow socket never
//! stalls inbound processing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::request::UnwatchBody;
use tether_core::wire::WatchAck;
use tether_core::{
    AuthState, ConnectionId, Identity, Request, RequestFrame, RequestId, RequestKind, ServerFrame, TetherError,
    WatchId,
};
use tether_transport::{BoxedStream, ClientCodec, TransportError};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::multiplexer::{Abandoned, Pending, PendingTable, Responder, Target, WatchOpened};
use crate::watch::{Dispatch, Listener, ListenerId, WatchEvent, WatchRegistry};

// ── Status ──────────────────────────────────────────────────────────

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The server sent `socket-closed` before terminating. Graceful.
    ServerClosed {
        /// Reason given by the server.
        reason: String,
    },
    /// The stream failed or hit EOF without a close frame.
    Lost,
    /// An inbound frame could not be decoded.
    Malformed {
        /// What was wrong.
        detail: String,
    },
    /// [`crate::Client::shutdown`] or every handle dropped.
    Shutdown,
}

impl CloseReason {
    /// The error every pending request resolves with.
    pub fn to_error(&self) -> TetherError {
        match self {
            Self::ServerClosed { .. } => TetherError::SocketClosed,
            Self::Lost | Self::Shutdown => TetherError::ConnectionLost,
            Self::Malformed { detail } => TetherError::MalformedFrame { detail: detail.clone() },
        }
    }

    /// Whether the teardown was announced by the server.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::ServerClosed { .. } | Self::Shutdown)
    }
}

/// Client view of the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Requests may be sent.
    Open,
    /// Terminal.
    Closed(CloseReason),
}

impl ConnectionStatus {
    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// Messages from handles to the actor.
pub(crate) enum Command {
    /// Write a request and register its continuation.
    Send {
        id: RequestId,
        request: Request,
        responder: Responder,
    },
    /// The caller timed out; forget its continuation.
    Abandon(RequestId),
    /// Attach a watch listener.
    AddListener {
        watch_id: WatchId,
        listener_id: ListenerId,
        listener: Listener,
    },
    /// Detach a watch listener.
    RemoveListener {
        watch_id: WatchId,
        listener_id: ListenerId,
    },
    /// The writer could not encode one frame; fail just that request.
    WriteRejected { id: RequestId, error: TransportError },
    /// The writer lost the socket.
    WriteFailed(TransportError),
    /// Close the connection.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send { id, request, .. } => write!(f, "Send({id}, {})", request.kind()),
            Self::Abandon(id) => write!(f, "Abandon({id})"),
            Self::AddListener { watch_id, listener_id, .. } => write!(f, "AddListener({watch_id}, {listener_id:?})"),
            Self::RemoveListener { watch_id, listener_id } => {
                write!(f, "RemoveListener({watch_id}, {listener_id:?})")
            }
            Self::WriteRejected { id, error } => write!(f, "WriteRejected({id}, {error})"),
            Self::WriteFailed(e) => write!(f, "WriteFailed({e})"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Per-connection request id sequence, shared by handles and the actor.
#[derive(Debug, Default)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub fn next(&self) -> RequestId {
        RequestId::from_sequence(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ── Actor ───────────────────────────────────────────────────────────

enum Flow {
    Continue,
    Stop(CloseReason),
}

pub(crate) struct Actor {
    conn_id: ConnectionId,
    pending: PendingTable,
    watches: WatchRegistry,
    ids: Arc<IdSequence>,
    outbound: mpsc::UnboundedSender<RequestFrame>,
    writable: bool,
    auth: watch::Sender<AuthState>,
    status: watch::Sender<ConnectionStatus>,
}

/// Channels the [`crate::Client`] keeps after spawning the actor.
pub(crate) struct Spawned {
    pub commands: mpsc::UnboundedSender<Command>,
    pub auth: watch::Receiver<AuthState>,
    pub status: watch::Receiver<ConnectionStatus>,
}

/// Split `stream`, start the writer and the actor, and return the handle side.
pub(crate) fn spawn(stream: BoxedStream, max_frame_bytes: usize, ids: Arc<IdSequence>) -> Spawned {
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, ClientCodec::new(max_frame_bytes));
    let writer = FramedWrite::new(write_half, ClientCodec::new(max_frame_bytes));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (auth_tx, auth_rx) = watch::channel(AuthState::Anonymous);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Open);

    let conn_id = ConnectionId::new();
    let _ = tokio::spawn(write_loop(writer, out_rx, writer_tx));

    let actor = Actor {
        conn_id,
        pending: PendingTable::default(),
        watches: WatchRegistry::default(),
        ids,
        outbound: out_tx,
        writable: true,
        auth: auth_tx,
        status: status_tx,
    };
    let _ = tokio::spawn(actor.run(reader, cmd_rx, writer_rx));

    Spawned {
        commands: cmd_tx,
        auth: auth_rx,
        status: status_rx,
    }
}

/// Outbound forwarder: encodes frames onto the socket in submission order.
///
/// Failures are reported on `report`, a channel separate from the handle
/// commands so the actor still sees every handle go away.
async fn write_loop(
    mut sink: FramedWrite<WriteHalf<BoxedStream>, ClientCodec>,
    mut frames: mpsc::UnboundedReceiver<RequestFrame>,
    report: mpsc::UnboundedSender<Command>,
) {
    while let Some(frame) = frames.recv().await {
        let id = frame.id.clone();
        match sink.send(frame).await {
            Ok(()) => {}
            Err(error @ (TransportError::FrameTooLarge { .. } | TransportError::Malformed(_))) => {
                let _ = report.send(Command::WriteRejected { id, error });
            }
            Err(error) => {
                let _ = report.send(Command::WriteFailed(error));
                return;
            }
        }
    }
    let _ = sink.close().await;
}

impl Actor {
    #[instrument(name = "client_connection", skip_all, fields(conn_id = %self.conn_id))]
    async fn run(
        mut self,
        mut reader: FramedRead<ReadHalf<BoxedStream>, ClientCodec>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut writer: mpsc::UnboundedReceiver<Command>,
    ) {
        debug!("connection actor started");
        let reason = loop {
            let flow = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => Flow::Stop(CloseReason::Shutdown),
                },
                Some(report) = writer.recv() => self.on_command(report),
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame),
                    Some(Err(TransportError::Io(e))) => {
                        warn!(error = %e, "read failed");
                        Flow::Stop(CloseReason::Lost)
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "malformed frame from server");
                        Flow::Stop(CloseReason::Malformed { detail: e.to_string() })
                    }
                    None => {
                        debug!("server closed the stream");
                        Flow::Stop(CloseReason::Lost)
                    }
                },
            };
            if let Flow::Stop(reason) = flow {
                break reason;
            }
        };
        self.teardown(reason);
    }

    fn teardown(&mut self, reason: CloseReason) {
        let err = reason.to_error();
        let failed = self.pending.fail_all(&err);
        let closed = self.watches.close_all();
        info!(?reason, failed_requests = failed, closed_watches = closed, "connection closed");
        let _ = self.auth.send_replace(AuthState::Anonymous);
        let _ = self.status.send_replace(ConnectionStatus::Closed(reason));
    }

    // ── Commands ────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Send { id, request, responder } => self.on_send(id, request, responder),
            Command::Abandon(id) => {
                if self.pending.abandon(&id) {
                    debug!(request_id = %id, "caller gave up waiting");
                }
            }
            Command::AddListener {
                watch_id,
                listener_id,
                listener,
            } => {
                if !self.watches.add_listener(&watch_id, listener_id, listener) {
                    debug!(%watch_id, "listener added to a closed watch");
                }
            }
            Command::RemoveListener { watch_id, listener_id } => {
                let _ = self.watches.remove_listener(&watch_id, listener_id);
            }
            Command::WriteRejected { id, error } => {
                warn!(request_id = %id, %error, "request frame rejected by encoder");
                if let Some(pending) = self.pending.take(&id) {
                    self.finish_unwatch(&pending.target);
                    pending.responder.fail(TetherError::validation(error.to_string()));
                }
            }
            Command::WriteFailed(error) => {
                // Keep reading: a socket-closed frame may still be buffered.
                warn!(%error, "write failed");
                self.writable = false;
            }
            Command::Shutdown => return Flow::Stop(CloseReason::Shutdown),
        }
        Flow::Continue
    }

    fn on_send(&mut self, id: RequestId, request: Request, responder: Responder) {
        if !self.writable {
            responder.fail(TetherError::ConnectionLost);
            return;
        }
        let kind = request.kind();
        let target = match &request {
            Request::Watch(body) => Target::Watch(body.selector.clone()),
            Request::Unwatch(body) => Target::Unwatch(body.watch_id.clone()),
            _ => Target::None,
        };
        let closing = match &target {
            Target::Unwatch(watch_id) => Some(watch_id.clone()),
            _ => None,
        };
        let frame = RequestFrame::new(id.clone(), &request);
        let pending = Pending {
            kind,
            target,
            responder,
        };
        if let Err(pending) = self.pending.insert(id.clone(), pending) {
            warn!(request_id = %id, "request id already outstanding");
            pending
                .responder
                .fail(TetherError::unknown(format!("request id {id} already outstanding")));
            return;
        }
        if let Some(watch_id) = closing {
            self.watches.begin_close(&watch_id);
        }
        debug!(request_id = %id, %kind, "sending request");
        if self.outbound.send(frame).is_err() {
            // Writer gone; its WriteFailed is already queued.
            debug!(request_id = %id, "writer closed before send");
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    fn on_frame(&mut self, frame: ServerFrame) -> Flow {
        match frame {
            ServerFrame::Respond { id, message } => self.on_reply(&id, Ok(message)),
            ServerFrame::Error { id, message } => self.on_reply(&id, Err(TetherError::from_error_body(&message))),
            ServerFrame::SocketClosed { payload } => {
                info!(reason = %payload.reason, "server announced socket close");
                return Flow::Stop(CloseReason::ServerClosed { reason: payload.reason });
            }
            push => {
                if let Some((change, payload)) = push.as_push() {
                    let event = WatchEvent::from_push(change, payload.entity.clone());
                    match self.watches.dispatch(&payload.watch_id, event) {
                        Dispatch::Delivered(n) => {
                            debug!(watch_id = %payload.watch_id, change = change.as_str(), listeners = n, "push dispatched");
                        }
                        Dispatch::Overflowed => self.unwatch_quietly(payload.watch_id.clone()),
                        Dispatch::Buffered | Dispatch::Dropped => {}
                    }
                }
            }
        }
        Flow::Continue
    }

    fn on_reply(&mut self, id: &RequestId, result: Result<Value, TetherError>) {
        let Some(pending) = self.pending.take(id) else {
            match self.pending.take_abandoned(id) {
                Some(abandoned) => self.on_abandoned_reply(id, abandoned, result),
                None => debug!(request_id = %id, "discarding reply with no pending request"),
            }
            return;
        };

        let Pending {
            kind,
            target,
            responder,
        } = pending;

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                debug!(request_id = %id, %kind, code = err.code(), "request failed");
                self.finish_unwatch(&target);
                responder.fail(err);
                return;
            }
        };

        match (kind, target) {
            (RequestKind::Login, _) => match decode::<Identity>(value.clone()) {
                Ok(identity) => self.authenticate(identity),
                Err(err) => {
                    responder.fail(err);
                    return;
                }
            },
            (RequestKind::Logout | RequestKind::RemoveAccount, _) => self.drop_identity(),
            (RequestKind::Watch, Target::Watch(selector)) => {
                let ack = match decode::<WatchAck>(value.clone()) {
                    Ok(ack) => ack,
                    Err(err) => {
                        responder.fail(err);
                        return;
                    }
                };
                let state = self.watches.open(ack.watch_id.clone(), selector.clone(), ack.snapshot.clone());
                debug!(watch_id = %ack.watch_id, snapshot = ack.snapshot.len(), "watch opened");
                if let Responder::Watch(tx) = responder {
                    let opened = WatchOpened {
                        watch_id: ack.watch_id.clone(),
                        selector,
                        state,
                        snapshot: ack.snapshot,
                    };
                    if tx.send(Ok(opened)).is_err() {
                        let _ = self.watches.close(&ack.watch_id);
                        self.unwatch_quietly(ack.watch_id);
                    }
                    return;
                }
            }
            (RequestKind::Unwatch, target) => self.finish_unwatch(&target),
            _ => {}
        }

        match responder {
            Responder::Value(tx) => {
                let _ = tx.send(Ok(value));
            }
            Responder::Watch(tx) => {
                let _ = tx.send(Err(TetherError::unknown(format!("'{kind}' does not open a watch"))));
            }
        }
    }

    /// Reply for a request whose caller timed out. Nobody is told, but
    /// identity and watch state still follow the server.
    fn on_abandoned_reply(&mut self, id: &RequestId, abandoned: Abandoned, result: Result<Value, TetherError>) {
        let Abandoned { kind, target } = abandoned;
        debug!(request_id = %id, %kind, "late reply for abandoned request");
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                debug!(request_id = %id, %kind, code = err.code(), "abandoned request failed");
                self.finish_unwatch(&target);
                return;
            }
        };
        match kind {
            RequestKind::Login => match decode::<Identity>(value) {
                Ok(identity) => self.authenticate(identity),
                Err(err) => warn!(request_id = %id, %err, "late login reply unreadable"),
            },
            RequestKind::Logout | RequestKind::RemoveAccount => self.drop_identity(),
            RequestKind::Watch => {
                if let Ok(ack) = decode::<WatchAck>(value) {
                    self.unwatch_quietly(ack.watch_id);
                }
            }
            RequestKind::Unwatch => self.finish_unwatch(&target),
            _ => {}
        }
    }

    fn authenticate(&mut self, identity: Identity) {
        info!(user_id = %identity.user_id, "authenticated");
        let _ = self.auth.send_replace(AuthState::Authenticated(identity));
    }

    fn drop_identity(&mut self) {
        let closed = self.watches.close_all();
        info!(closed_watches = closed, "identity dropped");
        let _ = self.auth.send_replace(AuthState::Anonymous);
    }

    fn finish_unwatch(&mut self, target: &Target) {
        if let Target::Unwatch(watch_id) = target {
            let _ = self.watches.close(watch_id);
        }
    }

    /// Cancel a server subscription nobody holds a handle for. The reply is
    /// uncorrelated and gets discarded.
    fn unwatch_quietly(&mut self, watch_id: WatchId) {
        debug!(%watch_id, "unwatching orphaned subscription");
        let frame = RequestFrame::new(self.ids.next(), &Request::Unwatch(UnwatchBody { watch_id }));
        let _ = self.outbound.send(frame);
    }
}

/// Decode a reply body into its typed shape.
pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TetherError> {
    serde_json::from_value(value).map_err(|e| TetherError::unknown(format!("unexpected reply shape: {e}")))
}
