//! Transport-layer errors.

use tether_core::TetherError;

/// Failure below the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying socket failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the configured maximum length.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared or encoded frame length, when known.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// A frame body was not valid JSON for the expected frame type.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// TLS material could not be loaded or the handshake failed.
    #[error("tls: {0}")]
    Tls(String),
}

impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

impl From<TransportError> for TetherError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(_) => Self::ConnectionLost,
            TransportError::FrameTooLarge { .. } | TransportError::Malformed(_) => Self::MalformedFrame {
                detail: e.to_string(),
            },
            TransportError::Tls(detail) => Self::HandshakeFailed { detail },
        }
    }
}
