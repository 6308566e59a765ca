//! Client connection configuration.

use std::fmt;
use std::time::Duration;

use tether_settings::ClientSettings;
use tether_transport::DEFAULT_MAX_FRAME_BYTES;
use tokio_rustls::TlsConnector;

/// Default time a caller waits for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS parameters for [`crate::Client::connect`].
#[derive(Clone)]
pub struct TlsTarget {
    /// Connector carrying the trusted roots.
    pub connector: TlsConnector,
    /// Name the server certificate must be issued for.
    pub server_name: String,
}

/// How to reach and talk to a tether server.
#[derive(Clone)]
pub struct ClientConfig {
    /// `host:port` of the protocol socket.
    pub addr: String,
    /// TLS upgrade; plain TCP when `None`.
    pub tls: Option<TlsTarget>,
    /// How long a request waits for its reply; `None` waits until the
    /// connection closes.
    pub request_timeout: Option<Duration>,
    /// Maximum frame payload in bytes, both directions.
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    /// Plain-TCP config with default limits.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Config for `addr` with limits taken from loaded settings.
    pub fn from_settings(addr: impl Into<String>, settings: &ClientSettings) -> Self {
        Self {
            request_timeout: (settings.request_timeout_ms > 0)
                .then(|| Duration::from_millis(settings.request_timeout_ms)),
            max_frame_bytes: settings.max_frame_bytes,
            ..Self::new(addr)
        }
    }

    /// Upgrade the connection to TLS.
    #[must_use]
    pub fn with_tls(mut self, connector: TlsConnector, server_name: impl Into<String>) -> Self {
        self.tls = Some(TlsTarget {
            connector,
            server_name: server_name.into(),
        });
        self
    }

    /// Override the request timeout (`None` disables it).
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("addr", &self.addr)
            .field("tls", &self.tls.as_ref().map(|t| t.server_name.as_str()))
            .field("request_timeout", &self.request_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish()
    }
}
