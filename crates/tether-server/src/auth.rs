//! Per-connection authentication gate.
//!
//! Owned by the session task, so it is a plain value with no locking. The
//! gate decides whether a request may reach the dispatcher and whether a
//! successful reply must be followed by a forced close.

use tether_core::{AuthState, Identity, RequestKind, TetherError};
use tracing::info;

/// Authentication state machine for one socket.
#[derive(Debug, Default)]
pub struct AuthGate {
    state: AuthState,
}

impl AuthGate {
    /// A gate for a fresh, anonymous connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// The bound identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.state.identity()
    }

    /// Refuse requests the current state does not permit.
    ///
    /// Anonymous sockets get `UNAUTHORIZED` for auth-only kinds; a second
    /// login on an authenticated socket is a validation error.
    pub fn check(&self, kind: RequestKind) -> Result<(), TetherError> {
        match (&self.state, kind) {
            (AuthState::Anonymous, kind) if kind.requires_auth() => Err(TetherError::Unauthorized),
            (AuthState::Authenticated(_), RequestKind::Login) => {
                Err(TetherError::validation("connection is already authenticated"))
            }
            _ => Ok(()),
        }
    }

    /// Whether a successful `kind` ends this socket.
    pub fn closes_after(&self, kind: RequestKind) -> bool {
        !self.state.is_authenticated() && kind.closes_anonymous_socket()
    }

    /// `Anonymous → Authenticated`.
    pub fn login(&mut self, identity: Identity) {
        info!(user_id = %identity.user_id, role = ?identity.role, "connection authenticated");
        self.state = AuthState::Authenticated(identity);
    }

    /// `Authenticated → Anonymous`. Returns the identity that was dropped.
    pub fn logout(&mut self) -> Option<Identity> {
        match std::mem::take(&mut self.state) {
            AuthState::Authenticated(identity) => {
                info!(user_id = %identity.user_id, "connection signed out");
                Some(identity)
            }
            AuthState::Anonymous => None,
        }
    }
}
