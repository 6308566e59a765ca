//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use tether_settings::ServerSettings;
use tether_transport::DEFAULT_MAX_FRAME_BYTES;

/// PEM files for the TLS listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    /// Certificate chain.
    pub cert_path: PathBuf,
    /// Private key.
    pub key_path: PathBuf,
}

/// Configuration for the tether server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Protocol port (default `0` for auto-assign).
    pub port: u16,
    /// Health/metrics HTTP port (default `0` for auto-assign).
    pub health_port: u16,
    /// TLS material; plaintext TCP when `None`.
    pub tls: Option<TlsPaths>,
    /// Max frame payload in bytes, both directions.
    pub max_frame_bytes: usize,
    /// Upper bound on a single handler's run time.
    pub handler_timeout: Duration,
    /// Outbound frame queue depth per connection.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            health_port: 0,
            tls: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            handler_timeout: Duration::from_secs(30),
            outbound_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            health_port: settings.health_port,
            tls: settings.tls.as_ref().map(|tls| TlsPaths {
                cert_path: PathBuf::from(&tls.cert_path),
                key_path: PathBuf::from(&tls.key_path),
            }),
            max_frame_bytes: settings.max_frame_bytes,
            handler_timeout: Duration::from_millis(settings.handler_timeout_ms),
            outbound_queue: settings.outbound_queue,
        }
    }

    /// `host:port` of the protocol socket.
    pub fn protocol_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:port` of the health/metrics endpoint.
    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.host, self.health_port)
    }
}
