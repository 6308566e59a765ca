//! The flat protocol error enum and its wire representation.
//!
//! Every failure a caller can observe is one [`TetherError`] variant. The
//! variants fall into three categories (see [`ErrorCategory`]):
//!
//! - **Transport**: the socket itself failed. Connection-wide.
//! - **Protocol**: a frame could not be understood. Connection-wide when the
//!   receiving side detects it locally.
//! - **Application**: a single request was refused. Delivered only to the
//!   request that produced it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ── Error code constants ────────────────────────────────────────────

/// The socket closed or failed without a graceful close frame.
pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
/// The TLS or TCP handshake did not complete.
pub const HANDSHAKE_FAILED: &str = "HANDSHAKE_FAILED";
/// The server closed the socket deliberately after a `socket-closed` frame.
pub const SOCKET_CLOSED: &str = "SOCKET_CLOSED";
/// The caller stopped waiting for a reply.
pub const TIMEOUT: &str = "TIMEOUT";
/// A frame could not be decoded.
pub const MALFORMED_FRAME: &str = "MALFORMED_FRAME";
/// A request carried a type tag the server does not know.
pub const UNKNOWN_REQUEST_TYPE: &str = "UNKNOWN_REQUEST_TYPE";
/// The request requires an authenticated identity (or a different one).
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
/// The addressed entity or account does not exist.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// A unique key is already taken.
pub const DUPLICATE_KEY: &str = "DUPLICATE_KEY";
/// The request body failed validation.
pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
/// Anything else, including handler faults.
pub const UNKNOWN: &str = "UNKNOWN";

/// Coarse grouping of [`TetherError`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The byte stream failed.
    Transport,
    /// A frame was not understood.
    Protocol,
    /// One request was refused.
    Application,
}

/// Every error observable through the protocol.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TetherError {
    /// The connection dropped; every pending request resolves with this.
    #[error("connection lost")]
    ConnectionLost,

    /// Connecting or the TLS handshake failed.
    #[error("handshake failed: {detail}")]
    HandshakeFailed {
        /// Underlying cause.
        detail: String,
    },

    /// The server sent `socket-closed` and tore the connection down.
    #[error("socket closed by server")]
    SocketClosed,

    /// No reply arrived within the configured request timeout.
    #[error("request timed out")]
    Timeout,

    /// A frame was not valid JSON or did not match the frame schema.
    #[error("malformed frame: {detail}")]
    MalformedFrame {
        /// What was wrong with the frame.
        detail: String,
    },

    /// The request type tag is not known to the server.
    #[error("unknown request type '{kind}'")]
    UnknownRequestType {
        /// The unrecognised tag.
        kind: String,
    },

    /// The request needs authentication or ownership the caller lacks.
    #[error("unauthorized")]
    Unauthorized,

    /// The addressed resource does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing resource.
        what: String,
    },

    /// A unique key collided with an existing record.
    #[error("duplicate key '{key}'")]
    DuplicateKey {
        /// The colliding key.
        key: String,
    },

    /// The request body was rejected.
    #[error("validation failed: {detail}")]
    ValidationFailed {
        /// Why the body was rejected.
        detail: String,
    },

    /// Unclassified failure, including handler faults.
    #[error("unknown error: {detail}")]
    Unknown {
        /// Diagnostic detail.
        detail: String,
    },
}

/// Structured error body inside an `error` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `DUPLICATE_KEY`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TetherError {
    /// Shorthand for [`TetherError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Shorthand for [`TetherError::ValidationFailed`].
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::ValidationFailed {
            detail: detail.into(),
        }
    }

    /// Shorthand for [`TetherError::Unknown`].
    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::Unknown {
            detail: detail.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionLost => CONNECTION_LOST,
            Self::HandshakeFailed { .. } => HANDSHAKE_FAILED,
            Self::SocketClosed => SOCKET_CLOSED,
            Self::Timeout => TIMEOUT,
            Self::MalformedFrame { .. } => MALFORMED_FRAME,
            Self::UnknownRequestType { .. } => UNKNOWN_REQUEST_TYPE,
            Self::Unauthorized => UNAUTHORIZED,
            Self::NotFound { .. } => NOT_FOUND,
            Self::DuplicateKey { .. } => DUPLICATE_KEY,
            Self::ValidationFailed { .. } => VALIDATION_FAILED,
            Self::Unknown { .. } => UNKNOWN,
        }
    }

    /// Which category the variant belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionLost | Self::HandshakeFailed { .. } | Self::SocketClosed | Self::Timeout => {
                ErrorCategory::Transport
            }
            Self::MalformedFrame { .. } | Self::UnknownRequestType { .. } => ErrorCategory::Protocol,
            Self::Unauthorized
            | Self::NotFound { .. }
            | Self::DuplicateKey { .. }
            | Self::ValidationFailed { .. }
            | Self::Unknown { .. } => ErrorCategory::Application,
        }
    }

    /// Structured details carried next to the code, if any.
    fn details(&self) -> Option<Value> {
        match self {
            Self::HandshakeFailed { detail }
            | Self::MalformedFrame { detail }
            | Self::ValidationFailed { detail }
            | Self::Unknown { detail } => Some(json!({ "detail": detail })),
            Self::UnknownRequestType { kind } => Some(json!({ "type": kind })),
            Self::NotFound { what } => Some(json!({ "what": what })),
            Self::DuplicateKey { key } => Some(json!({ "key": key })),
            Self::ConnectionLost | Self::SocketClosed | Self::Timeout | Self::Unauthorized => None,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    /// Rebuild a typed error from a wire-format body.
    ///
    /// Unrecognised codes become [`TetherError::Unknown`] carrying the
    /// original message so nothing is lost.
    pub fn from_error_body(body: &ErrorBody) -> Self {
        let field = |name: &str| {
            body.details
                .as_ref()
                .and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .map_or_else(|| body.message.clone(), str::to_owned)
        };
        match body.code.as_str() {
            CONNECTION_LOST => Self::ConnectionLost,
            HANDSHAKE_FAILED => Self::HandshakeFailed { detail: field("detail") },
            SOCKET_CLOSED => Self::SocketClosed,
            TIMEOUT => Self::Timeout,
            MALFORMED_FRAME => Self::MalformedFrame { detail: field("detail") },
            UNKNOWN_REQUEST_TYPE => Self::UnknownRequestType { kind: field("type") },
            UNAUTHORIZED => Self::Unauthorized,
            NOT_FOUND => Self::NotFound { what: field("what") },
            DUPLICATE_KEY => Self::DuplicateKey { key: field("key") },
            VALIDATION_FAILED => Self::ValidationFailed { detail: field("detail") },
            UNKNOWN => Self::Unknown { detail: field("detail") },
            other => Self::Unknown {
                detail: format!("{other}: {}", body.message),
            },
        }
    }
}
