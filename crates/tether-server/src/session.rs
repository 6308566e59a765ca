//! Per-connection session: one task reading frames and running them one at a
//! time, plus a writer task draining the outbound queue onto the socket.
//!
//! Replies are enqueued before any connection-state change they imply is
//! applied, so a `watch` reply always precedes that watch's pushes and a
//! one-shot reply always precedes `socket-closed`.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tether_core::{ConnectionId, ErrorCategory, RequestFrame, ServerFrame};
use tether_transport::{BoxedStream, ServerCodec, TransportError};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthGate;
use crate::config::ServerConfig;
use crate::connection::{ClientConnection, ConnectionRegistry};
use crate::context::CallContext;
use crate::dispatcher::{Dispatcher, Effect};
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL, ERRORS_TOTAL,
    MALFORMED_FRAMES_TOTAL,
};

/// How long teardown waits for queued frames to reach the socket.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Close reason sent on shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Close reason sent after a one-shot anonymous request.
pub const ONE_SHOT_REASON: &str = "one-shot request complete, reconnect to continue";

/// Close reason sent after a protocol error (unknown request type).
pub const PROTOCOL_ERROR_REASON: &str = "protocol error, reconnect to continue";

/// Per-connection sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLimits {
    /// Max frame payload in bytes, both directions.
    pub max_frame_bytes: usize,
    /// Outbound frame queue depth.
    pub outbound_queue: usize,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            outbound_queue: config.outbound_queue.max(1),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// What the read loop does after a frame.
enum Flow {
    Continue,
    /// Send `socket-closed` with this reason, then terminate.
    Close(&'static str),
    /// Terminate without a close frame: the writer is gone or the
    /// connection fell behind.
    Abort,
}

/// Serve one connection until the peer leaves, the input turns malformed or
/// names an unknown request type, a one-shot request completes, the
/// connection falls behind, or `shutdown` fires.
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_session(
    stream: BoxedStream,
    conn_id: ConnectionId,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    limits: SessionLimits,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, ServerCodec::new(limits.max_frame_bytes));
    let mut sink = FramedWrite::new(write_half, ServerCodec::new(limits.max_frame_bytes));

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(limits.outbound_queue);
    let conn = Arc::new(ClientConnection::new(conn_id, tx));

    info!("client connected");
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    registry.add(conn.clone()).await;

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let last = matches!(frame, ServerFrame::SocketClosed { .. });
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "write failed, stopping writer");
                break;
            }
            if last {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut gate = AuthGate::new();
    let close_reason = loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break Some(SHUTDOWN_REASON),
            () = conn.closing() => {
                warn!(dropped = conn.dropped_pushes(), "closing connection that fell behind on pushes");
                break None;
            }
            next = frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(TransportError::Io(e))) => {
                debug!(error = %e, "read failed");
                break None;
            }
            Some(Err(e)) => {
                counter!(MALFORMED_FRAMES_TOTAL).increment(1);
                warn!(error = %e, "malformed frame, terminating connection");
                break None;
            }
            None => {
                debug!("peer closed the stream");
                break None;
            }
        };
        match handle_frame(frame, &mut gate, &dispatcher, &conn, &shutdown).await {
            Flow::Continue => {}
            Flow::Close(reason) => break Some(reason),
            Flow::Abort => break None,
        }
    };

    if let Some(reason) = close_reason {
        info!(reason, "closing socket");
        let sent = tokio::time::timeout(DRAIN_TIMEOUT, conn.send(ServerFrame::socket_closed(reason))).await;
        if !matches!(sent, Ok(true)) {
            debug!("socket-closed frame could not be queued");
        }
    }

    let watches = dispatcher.context().publisher.remove_connection(&conn.id);
    let _ = registry.remove(&conn.id).await;
    let age = conn.age();
    drop(conn);
    drop(frames);

    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not drain in time, aborting");
        writer.abort();
    }

    info!(watches, "client disconnected");
    counter!(DISCONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(age.as_secs_f64());
}

/// Gate, dispatch and answer one request, then apply its effect.
async fn handle_frame(
    frame: RequestFrame,
    gate: &mut AuthGate,
    dispatcher: &Dispatcher,
    conn: &Arc<ClientConnection>,
    shutdown: &CancellationToken,
) -> Flow {
    let id = frame.id.clone();
    let outcome = match frame.decode() {
        Err(err) => {
            warn!(request_id = %id, tag = %frame.kind, code = err.code(), "request rejected at decode");
            counter!(ERRORS_TOTAL, "kind" => "undecodable", "code" => err.code()).increment(1);
            Err(err)
        }
        Ok(request) => {
            let kind = request.kind();
            match gate.check(kind) {
                Err(err) => {
                    debug!(request_id = %id, %kind, code = err.code(), "request refused by auth gate");
                    counter!(ERRORS_TOTAL, "kind" => kind.tag(), "code" => err.code()).increment(1);
                    Err(err)
                }
                Ok(()) => {
                    let closes = gate.closes_after(kind);
                    let call = CallContext {
                        conn: conn.clone(),
                        identity: gate.identity().cloned(),
                    };
                    dispatcher
                        .dispatch(&id, request, &call)
                        .await
                        .map(|reply| (reply, closes))
                }
            }
        }
    };

    let (reply, closes) = match outcome {
        Ok(ok) => ok,
        Err(err) => {
            let protocol = err.category() == ErrorCategory::Protocol;
            return match respond(conn, shutdown, ServerFrame::error(id, &err)).await {
                Flow::Continue if protocol => Flow::Close(PROTOCOL_ERROR_REASON),
                flow => flow,
            };
        }
    };
    match respond(conn, shutdown, ServerFrame::respond(id, reply.body)).await {
        Flow::Continue => {}
        flow => return flow,
    }

    match reply.effect {
        Effect::None => {}
        Effect::Authenticated(identity) => gate.login(identity),
        Effect::SignedOut => {
            let _ = gate.logout();
        }
        Effect::WatchOpened(watch_id) => {
            let _ = dispatcher.context().publisher.activate(&watch_id);
        }
    }
    if closes {
        return Flow::Close(ONE_SHOT_REASON);
    }
    Flow::Continue
}

/// Queue a reply. A full queue never outlasts shutdown or a close request.
async fn respond(conn: &ClientConnection, shutdown: &CancellationToken, frame: ServerFrame) -> Flow {
    tokio::select! {
        biased;
        sent = conn.send(frame) => {
            if sent {
                Flow::Continue
            } else {
                Flow::Abort
            }
        }
        () = shutdown.cancelled() => {
            debug!("shutdown while waiting for outbound queue space");
            Flow::Close(SHUTDOWN_REASON)
        }
        () = conn.closing() => {
            warn!(dropped = conn.dropped_pushes(), "closing connection with a full outbound queue");
            Flow::Abort
        }
    }
}
