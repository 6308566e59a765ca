//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! partial settings file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 7443, "tls": { "certPath": "cert.pem", "keyPath": "key.pem" } },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Server listener settings.
    pub server: ServerSettings,
    /// Client connection settings.
    pub client: ClientSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// PEM files for the TLS listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    /// Certificate chain (PEM).
    pub cert_path: String,
    /// Private key (PEM).
    pub key_path: String,
}

/// Server network and runtime settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Protocol socket port.
    pub port: u16,
    /// Health/metrics HTTP port.
    pub health_port: u16,
    /// TLS material; plaintext TCP when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
    /// Maximum frame payload in bytes.
    pub max_frame_bytes: usize,
    /// Upper bound on a single handler's run time in milliseconds.
    pub handler_timeout_ms: u64,
    /// Outbound queue depth per connection.
    pub outbound_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7443,
            health_port: 7444,
            tls: None,
            max_frame_bytes: 16 * 1024 * 1024,
            handler_timeout_ms: 30_000,
            outbound_queue: 1024,
        }
    }
}

/// Client connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// How long a caller waits for a reply; `0` waits indefinitely.
    pub request_timeout_ms: u64,
    /// Maximum frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
