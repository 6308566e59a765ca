//! Errors from loading `settings.json`.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The file is not JSON, or a field has the wrong shape.
    #[error("{} is not valid tether settings: {source}", .path.display())]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Underlying decode failure.
        source: serde_json::Error,
    },
    /// A value the server or client cannot run with.
    #[error("{key} {problem}")]
    OutOfRange {
        /// camelCase settings key, e.g. `server.outboundQueue`.
        key: &'static str,
        /// What is wrong with it.
        problem: String,
    },
    /// TLS is configured but one of its paths is empty.
    #[error("server.tls.{field} is empty")]
    EmptyTlsPath {
        /// `certPath` or `keyPath`.
        field: &'static str,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
