//! Opaque entities and the selectors used to watch them.
//!
//! The protocol does not interpret entity payloads. It only needs an
//! entity's kind, key, owner and visibility to decide who may see a change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Identity;
use crate::ids::UserId;

/// Who may read an entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Any authenticated identity.
    #[default]
    Public,
    /// The owner and admins only.
    Private,
}

/// A stored record flowing through the protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Entity kind (e.g. `listing`, `order`).
    pub kind: String,
    /// Unique key within the kind.
    pub key: String,
    /// Account that created the entity.
    pub owner: UserId,
    /// Read visibility.
    #[serde(default)]
    pub visibility: Visibility,
    /// Monotonic revision, starting at 1 on create.
    pub version: u64,
    /// Opaque payload.
    pub data: Value,
}

impl Entity {
    /// Whether `identity` may read this entity.
    pub fn is_visible_to(&self, identity: &Identity) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Private => identity.is_admin() || self.owner == identity.user_id,
        }
    }

    /// Whether `identity` may mutate this entity.
    pub fn is_mutable_by(&self, identity: &Identity) -> bool {
        identity.is_admin() || self.owner == identity.user_id
    }
}

/// Which entities of a kind a selector covers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Exactly one entity, by key.
    Entity(String),
    /// Every visible entity of the kind.
    Collection,
    /// Entities owned by the subscriber.
    Owned,
}

/// Entity kind plus key/filter, as sent in a `watch` request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    /// Entity kind.
    pub kind: String,
    /// Key or filter within the kind.
    pub scope: Scope,
}

impl Selector {
    /// Selector for a single entity.
    pub fn entity(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: Scope::Entity(key.into()),
        }
    }

    /// Selector for every entity of a kind.
    pub fn collection(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: Scope::Collection,
        }
    }

    /// Selector for the subscriber's own entities of a kind.
    pub fn owned(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: Scope::Owned,
        }
    }

    /// Whether a change to `entity` should reach a subscriber holding
    /// `identity` on this selector.
    pub fn matches(&self, entity: &Entity, identity: &Identity) -> bool {
        if self.kind != entity.kind || !entity.is_visible_to(identity) {
            return false;
        }
        match &self.scope {
            Scope::Entity(key) => *key == entity.key,
            Scope::Collection => true,
            Scope::Owned => entity.owner == identity.user_id,
        }
    }
}
