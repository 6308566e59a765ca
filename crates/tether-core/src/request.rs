//! The typed request sum type.
//!
//! Requests travel as `{id, type, body}`. The `type` tag selects a
//! [`Request`] variant and the body is decoded into that variant's typed
//! payload exactly once, at the connection boundary. Handlers never see
//! loosely-typed JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::auth::Role;
use crate::entity::{Selector, Visibility};
use crate::errors::TetherError;
use crate::ids::WatchId;

/// A password that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a plaintext secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Body with no fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

/// `auth.login` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginBody {
    /// Account name.
    pub username: String,
    /// Plaintext password.
    pub password: Secret,
}

/// `account.register` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterBody {
    /// Account name, unique.
    pub username: String,
    /// Plaintext password.
    pub password: Secret,
    /// Requested role.
    #[serde(default)]
    pub role: Role,
}

/// `entity.create` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateEntityBody {
    /// Entity kind.
    pub kind: String,
    /// Key, unique within the kind.
    pub key: String,
    /// Opaque payload.
    pub data: Value,
    /// Read visibility.
    #[serde(default)]
    pub visibility: Visibility,
}

/// `entity.update` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntityBody {
    /// Entity kind.
    pub kind: String,
    /// Entity key.
    pub key: String,
    /// Replacement payload.
    pub data: Value,
}

/// `entity.get` / `entity.remove` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity kind.
    pub kind: String,
    /// Entity key.
    pub key: String,
}

/// `entity.list` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListBody {
    /// Entity kind.
    pub kind: String,
}

/// `watch` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WatchBody {
    /// What to subscribe to.
    pub selector: Selector,
}

/// `unwatch` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwatchBody {
    /// Subscription to cancel.
    pub watch_id: WatchId,
}

/// Every request the server understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Request {
    /// Liveness probe.
    #[serde(rename = "system.ping")]
    Ping(Empty),
    /// Bind an identity to the connection.
    #[serde(rename = "auth.login")]
    Login(LoginBody),
    /// Drop the bound identity.
    #[serde(rename = "auth.logout")]
    Logout(Empty),
    /// Create an account.
    #[serde(rename = "account.register")]
    Register(RegisterBody),
    /// Delete the bound account.
    #[serde(rename = "account.remove")]
    RemoveAccount(Empty),
    /// Create an entity.
    #[serde(rename = "entity.create")]
    CreateEntity(CreateEntityBody),
    /// Replace an entity's payload.
    #[serde(rename = "entity.update")]
    UpdateEntity(UpdateEntityBody),
    /// Delete an entity.
    #[serde(rename = "entity.remove")]
    RemoveEntity(EntityRef),
    /// Read one entity.
    #[serde(rename = "entity.get")]
    GetEntity(EntityRef),
    /// Read every visible entity of a kind.
    #[serde(rename = "entity.list")]
    ListEntities(ListBody),
    /// Open a subscription.
    #[serde(rename = "watch")]
    Watch(WatchBody),
    /// Close a subscription.
    #[serde(rename = "unwatch")]
    Unwatch(UnwatchBody),
}

/// Fieldless mirror of [`Request`], used for routing, gating and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `system.ping`
    Ping,
    /// `auth.login`
    Login,
    /// `auth.logout`
    Logout,
    /// `account.register`
    Register,
    /// `account.remove`
    RemoveAccount,
    /// `entity.create`
    CreateEntity,
    /// `entity.update`
    UpdateEntity,
    /// `entity.remove`
    RemoveEntity,
    /// `entity.get`
    GetEntity,
    /// `entity.list`
    ListEntities,
    /// `watch`
    Watch,
    /// `unwatch`
    Unwatch,
}

impl RequestKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::Ping,
        Self::Login,
        Self::Logout,
        Self::Register,
        Self::RemoveAccount,
        Self::CreateEntity,
        Self::UpdateEntity,
        Self::RemoveEntity,
        Self::GetEntity,
        Self::ListEntities,
        Self::Watch,
        Self::Unwatch,
    ];

    /// Wire tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Ping => "system.ping",
            Self::Login => "auth.login",
            Self::Logout => "auth.logout",
            Self::Register => "account.register",
            Self::RemoveAccount => "account.remove",
            Self::CreateEntity => "entity.create",
            Self::UpdateEntity => "entity.update",
            Self::RemoveEntity => "entity.remove",
            Self::GetEntity => "entity.get",
            Self::ListEntities => "entity.list",
            Self::Watch => "watch",
            Self::Unwatch => "unwatch",
        }
    }

    /// Look up a kind by wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Whether the request is refused on an anonymous connection.
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Ping | Self::Login | Self::Register | Self::Unwatch)
    }

    /// Whether a successful reply on an anonymous connection is followed by
    /// a `socket-closed` frame and teardown.
    pub fn closes_anonymous_socket(self) -> bool {
        matches!(self, Self::Register)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Request {
    /// The fieldless kind of this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Ping(_) => RequestKind::Ping,
            Self::Login(_) => RequestKind::Login,
            Self::Logout(_) => RequestKind::Logout,
            Self::Register(_) => RequestKind::Register,
            Self::RemoveAccount(_) => RequestKind::RemoveAccount,
            Self::CreateEntity(_) => RequestKind::CreateEntity,
            Self::UpdateEntity(_) => RequestKind::UpdateEntity,
            Self::RemoveEntity(_) => RequestKind::RemoveEntity,
            Self::GetEntity(_) => RequestKind::GetEntity,
            Self::ListEntities(_) => RequestKind::ListEntities,
            Self::Watch(_) => RequestKind::Watch,
            Self::Unwatch(_) => RequestKind::Unwatch,
        }
    }

    /// Decode a request from its wire tag and body.
    ///
    /// An unknown tag is a protocol error; a body that does not fit the
    /// tag's schema, or fails [`Request::validate`], is a validation error.
    pub fn decode(tag: &str, body: Value) -> Result<Self, TetherError> {
        if RequestKind::from_tag(tag).is_none() {
            return Err(TetherError::UnknownRequestType { kind: tag.to_owned() });
        }
        let body = if body.is_null() { json!({}) } else { body };
        let request: Self = serde_json::from_value(json!({ "type": tag, "body": body }))
            .map_err(|e| TetherError::validation(format!("invalid body for '{tag}': {e}")))?;
        request.validate()?;
        Ok(request)
    }

    /// Split into wire tag and body.
    pub fn encode(&self) -> (&'static str, Value) {
        let body = serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("body").map(Value::take))
            .unwrap_or_else(|| json!({}));
        (self.kind().tag(), body)
    }

    /// Structural checks the schema cannot express.
    pub fn validate(&self) -> Result<(), TetherError> {
        fn non_empty(field: &str, value: &str) -> Result<(), TetherError> {
            if value.trim().is_empty() {
                Err(TetherError::validation(format!("'{field}' must not be empty")))
            } else {
                Ok(())
            }
        }
        match self {
            Self::Ping(_) | Self::Logout(_) | Self::RemoveAccount(_) => Ok(()),
            Self::Login(body) => {
                non_empty("username", &body.username)?;
                non_empty("password", body.password.expose())
            }
            Self::Register(body) => {
                non_empty("username", &body.username)?;
                non_empty("password", body.password.expose())
            }
            Self::CreateEntity(CreateEntityBody { kind, key, .. })
            | Self::UpdateEntity(UpdateEntityBody { kind, key, .. })
            | Self::RemoveEntity(EntityRef { kind, key })
            | Self::GetEntity(EntityRef { kind, key }) => {
                non_empty("kind", kind)?;
                non_empty("key", key)
            }
            Self::ListEntities(body) => non_empty("kind", &body.kind),
            Self::Watch(body) => {
                non_empty("selector.kind", &body.selector.kind)?;
                match &body.selector.scope {
                    crate::entity::Scope::Entity(key) => non_empty("selector.scope.entity", key),
                    _ => Ok(()),
                }
            }
            Self::Unwatch(body) => non_empty("watchId", body.watch_id.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn decode_login() {
        let req = Request::decode("auth.login", json!({"username": "ann", "password": "pw"})).unwrap();
        assert_matches!(req, Request::Login(LoginBody { ref username, .. }) if username == "ann");
        assert_eq!(req.kind(), RequestKind::Login);
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        assert_matches!(
            Request::decode("order.approve", json!({})),
            Err(TetherError::UnknownRequestType { kind }) if kind == "order.approve"
        );
    }

    #[test]
    fn wrong_body_is_validation_error() {
        assert_matches!(
            Request::decode("entity.get", json!({"kind": "listing"})),
            Err(TetherError::ValidationFailed { .. })
        );
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_matches!(
            Request::decode("entity.get", json!({"kind": "listing", "key": "  "})),
            Err(TetherError::ValidationFailed { detail }) if detail.contains("'key'")
        );
    }

    #[test]
    fn null_body_means_empty() {
        assert_eq!(Request::decode("system.ping", Value::Null).unwrap(), Request::Ping(Empty {}));
    }

    #[test]
    fn register_role_defaults_to_buyer() {
        let req = Request::decode("account.register", json!({"username": "u", "password": "p"})).unwrap();
        assert_matches!(req, Request::Register(RegisterBody { role: Role::Buyer, .. }));
    }

    #[test]
    fn encode_splits_tag_and_body() {
        let req = Request::Watch(WatchBody {
            selector: Selector::entity("listing", "l1"),
        });
        let (tag, body) = req.encode();
        assert_eq!(tag, "watch");
        assert_eq!(body, json!({"selector": {"kind": "listing", "scope": {"entity": "l1"}}}));
    }

    #[test]
    fn unwatch_body_is_camel_case() {
        let (_, body) = Request::Unwatch(UnwatchBody { watch_id: WatchId::from("w1") }).encode();
        assert_eq!(body, json!({"watchId": "w1"}));
    }

    #[test]
    fn every_tag_round_trips() {
        for kind in RequestKind::ALL {
            assert_eq!(RequestKind::from_tag(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn auth_gating_table() {
        assert!(!RequestKind::Ping.requires_auth());
        assert!(!RequestKind::Login.requires_auth());
        assert!(!RequestKind::Register.requires_auth());
        assert!(!RequestKind::Unwatch.requires_auth());
        assert!(RequestKind::Logout.requires_auth());
        assert!(RequestKind::CreateEntity.requires_auth());
        assert!(RequestKind::Watch.requires_auth());
        assert!(RequestKind::Register.closes_anonymous_socket());
        assert!(!RequestKind::Login.closes_anonymous_socket());
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let body = LoginBody {
            username: "ann".into(),
            password: Secret::new("hunter2"),
        };
        let rendered = format!("{body:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
