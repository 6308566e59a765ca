//! `TetherServer`: the protocol listener plus an axum health/metrics endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::ConnectionId;
use tether_transport::BoxedStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionRegistry;
use crate::context::ServerContext;
use crate::dispatcher::Dispatcher;
use crate::health::{self, HealthResponse};
use crate::metrics::{HANDSHAKE_FAILURES_TOTAL, render};
use crate::session::{SessionLimits, run_session};
use crate::shutdown::ShutdownCoordinator;

/// Upper bound on a TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Open protocol connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Request dispatcher (for its context).
    pub dispatcher: Arc<Dispatcher>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The tether server.
pub struct TetherServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    tls: Option<TlsAcceptor>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl TetherServer {
    /// Create a server running every handler against `ctx`.
    pub fn new(config: ServerConfig, ctx: ServerContext) -> Self {
        let dispatcher = Dispatcher::with_default_handlers(ctx, config.handler_timeout);
        Self::with_dispatcher(config, dispatcher)
    }

    /// Create a server around a prepared dispatcher.
    pub fn with_dispatcher(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            tls: None,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Terminate TLS on accepted sockets.
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router for the operations endpoint.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind the protocol socket and start accepting. Returns the bound
    /// address and the accept loop's handle; the loop ends on shutdown.
    pub async fn listen(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.protocol_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, tls = self.tls.is_some(), "tether protocol listener started");

        let acceptor = Acceptor {
            tls: self.tls.clone(),
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            limits: SessionLimits::from(&self.config),
        };
        let handle = tokio::spawn(acceptor.run(listener));
        Ok((local_addr, handle))
    }

    /// Bind and serve the health/metrics endpoint until shutdown.
    pub async fn listen_http(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.health_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "health endpoint started");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                warn!(error = %e, "health endpoint failed");
            }
        });
        Ok((local_addr, handle))
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Open connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Request dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handler context.
    pub fn context(&self) -> &ServerContext {
        self.dispatcher.context()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Everything the accept loop needs, detached from the server's lifetime.
struct Acceptor {
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    limits: SessionLimits,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let token = self.shutdown.token();
        loop {
            let accepted = tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (tcp, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = tcp.set_nodelay(true) {
                debug!(error = %e, %peer, "could not set TCP_NODELAY");
            }

            let tls = self.tls.clone();
            let dispatcher = self.dispatcher.clone();
            let registry = self.registry.clone();
            let limits = self.limits;
            let token = token.clone();
            self.shutdown.track(tokio::spawn(async move {
                let Some(stream) = upgrade(tcp, peer, tls.as_ref()).await else {
                    return;
                };
                let conn_id = ConnectionId::new();
                debug!(%peer, %conn_id, "connection accepted");
                run_session(stream, conn_id, dispatcher, registry, limits, token).await;
            }));
        }
        info!("tether protocol listener stopped");
    }
}

/// Wrap an accepted socket, running the TLS handshake when configured.
async fn upgrade(tcp: TcpStream, peer: SocketAddr, tls: Option<&TlsAcceptor>) -> Option<BoxedStream> {
    let Some(acceptor) = tls else {
        return Some(Box::new(tcp));
    };
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => Some(Box::new(stream)),
        Ok(Err(e)) => {
            counter!(HANDSHAKE_FAILURES_TOTAL).increment(1);
            warn!(%peer, error = %e, "tls handshake failed");
            None
        }
        Err(_elapsed) => {
            counter!(HANDSHAKE_FAILURES_TOTAL).increment(1);
            warn!(%peer, "tls handshake timed out");
            None
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.count().await;
    let watches = state.dispatcher.context().publisher.count();
    Json(health::health_check(state.start_time, connections, watches))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, render(handle)),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_owned()),
    }
}
