//! Authentication state shared by both ends of a connection.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Account role, bound to the identity on successful login.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Browses and orders.
    #[default]
    Buyer,
    /// Publishes entities.
    Seller,
    /// Sees and mutates everything.
    Admin,
}

/// The identity context bound to an authenticated connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Account id.
    pub user_id: UserId,
    /// Account role.
    pub role: Role,
}

impl Identity {
    /// Whether this identity bypasses ownership and visibility rules.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Per-connection authentication state.
///
/// `Anonymous → Authenticated` only through a successful `auth.login`;
/// `Authenticated → Anonymous` only through `auth.logout` or
/// `account.remove`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    /// No identity bound.
    #[default]
    Anonymous,
    /// Identity bound for all subsequent requests on the socket.
    Authenticated(Identity),
}

impl AuthState {
    /// The bound identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(identity) => Some(identity),
        }
    }

    /// Whether an identity is bound.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}
