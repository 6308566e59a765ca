//! Wire-format frames.
//!
//! One JSON object per frame. Client → server frames are [`RequestFrame`]s;
//! server → client frames are [`ServerFrame`]s, discriminated by `event`:
//!
//! - `respond` / `error`: correlated reply, carries the echoed `id`
//! - `created` / `updated` / `removed`: unsolicited push tied to a watch id
//! - `socket-closed`: the server is about to terminate the connection

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::entity::Entity;
use crate::errors::{ErrorBody, TetherError};
use crate::ids::{RequestId, UserId, WatchId};
use crate::request::Request;

fn empty_body() -> Value {
    json!({})
}

/// Client → server frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, unique among the connection's outstanding requests.
    pub id: RequestId,
    /// Request kind tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific body.
    #[serde(default = "empty_body")]
    pub body: Value,
}

impl RequestFrame {
    /// Build the frame for a typed request.
    pub fn new(id: RequestId, request: &Request) -> Self {
        let (tag, body) = request.encode();
        Self {
            id,
            kind: tag.to_owned(),
            body,
        }
    }

    /// Decode the typed request carried by this frame.
    pub fn decode(&self) -> Result<Request, TetherError> {
        Request::decode(&self.kind, self.body.clone())
    }
}

/// What happened to the entity in a push frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// The entity was created.
    Created,
    /// The entity's payload changed.
    Updated,
    /// The entity was deleted; the payload is its last state.
    Removed,
}

impl ChangeKind {
    /// Wire event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }
}

/// Payload of a push frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchPush {
    /// Subscription the push belongs to.
    pub watch_id: WatchId,
    /// Entity state after the change.
    pub entity: Entity,
}

/// Payload of a `socket-closed` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePayload {
    /// Why the server is closing.
    pub reason: String,
}

/// Server → client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerFrame {
    /// Successful reply.
    #[serde(rename = "respond")]
    Respond {
        /// Echoed correlation id.
        id: RequestId,
        /// Result payload.
        message: Value,
    },
    /// Failed reply.
    #[serde(rename = "error")]
    Error {
        /// Echoed correlation id.
        id: RequestId,
        /// Error body.
        message: ErrorBody,
    },
    /// A matching entity was created.
    #[serde(rename = "created")]
    Created {
        /// Push payload.
        payload: WatchPush,
    },
    /// A matching entity was updated.
    #[serde(rename = "updated")]
    Updated {
        /// Push payload.
        payload: WatchPush,
    },
    /// A matching entity was removed.
    #[serde(rename = "removed")]
    Removed {
        /// Push payload.
        payload: WatchPush,
    },
    /// Graceful teardown signal.
    #[serde(rename = "socket-closed")]
    SocketClosed {
        /// Close details.
        payload: ClosePayload,
    },
}

impl ServerFrame {
    /// Success reply for `id`.
    pub fn respond(id: RequestId, message: Value) -> Self {
        Self::Respond { id, message }
    }

    /// Error reply for `id`.
    pub fn error(id: RequestId, error: &TetherError) -> Self {
        Self::Error {
            id,
            message: error.to_error_body(),
        }
    }

    /// Push frame for a change.
    pub fn push(change: ChangeKind, watch_id: WatchId, entity: Entity) -> Self {
        let payload = WatchPush { watch_id, entity };
        match change {
            ChangeKind::Created => Self::Created { payload },
            ChangeKind::Updated => Self::Updated { payload },
            ChangeKind::Removed => Self::Removed { payload },
        }
    }

    /// Graceful close frame.
    pub fn socket_closed(reason: impl Into<String>) -> Self {
        Self::SocketClosed {
            payload: ClosePayload { reason: reason.into() },
        }
    }

    /// Correlation id, present only on replies.
    pub fn correlation_id(&self) -> Option<&RequestId> {
        match self {
            Self::Respond { id, .. } | Self::Error { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Change kind and payload, present only on pushes.
    pub fn as_push(&self) -> Option<(ChangeKind, &WatchPush)> {
        match self {
            Self::Created { payload } => Some((ChangeKind::Created, payload)),
            Self::Updated { payload } => Some((ChangeKind::Updated, payload)),
            Self::Removed { payload } => Some((ChangeKind::Removed, payload)),
            _ => None,
        }
    }
}

/// Reply body of a successful `watch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchAck {
    /// Server-assigned subscription id.
    pub watch_id: WatchId,
    /// Every matching entity at subscription time, in key order.
    pub snapshot: Vec<Entity>,
}

/// Reply body of a successful `account.register`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAck {
    /// New account id.
    pub user_id: UserId,
}
