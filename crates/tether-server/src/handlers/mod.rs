//! Request handlers and registration.

pub mod account;
pub mod auth;
pub mod entity;
pub mod system;
pub mod watch;

use tether_core::{Request, RequestKind, TetherError};

use crate::dispatcher::Dispatcher;

/// Register every request handler with the dispatcher.
pub fn register_all(dispatcher: &mut Dispatcher) {
    // System
    dispatcher.register(RequestKind::Ping, system::PingHandler);

    // Auth
    dispatcher.register(RequestKind::Login, auth::LoginHandler);
    dispatcher.register(RequestKind::Logout, auth::LogoutHandler);

    // Account
    dispatcher.register(RequestKind::Register, account::RegisterHandler);
    dispatcher.register(RequestKind::RemoveAccount, account::RemoveAccountHandler);

    // Entity
    dispatcher.register(RequestKind::CreateEntity, entity::CreateHandler);
    dispatcher.register(RequestKind::UpdateEntity, entity::UpdateHandler);
    dispatcher.register(RequestKind::RemoveEntity, entity::RemoveHandler);
    dispatcher.register(RequestKind::GetEntity, entity::GetHandler);
    dispatcher.register(RequestKind::ListEntities, entity::ListHandler);

    // Watch
    dispatcher.register(RequestKind::Watch, watch::WatchHandler);
    dispatcher.register(RequestKind::Unwatch, watch::UnwatchHandler);
}

/// Error for a request routed to the wrong handler.
pub(crate) fn misrouted(request: &Request) -> TetherError {
    TetherError::unknown(format!("no handler arm for '{}'", request.kind()))
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;

    use serde_json::json;
    use tether_core::{ConnectionId, Entity, Identity, Role, ServerFrame, UserId, Visibility};
    use tokio::sync::mpsc;

    use crate::connection::ClientConnection;
    use crate::context::{CallContext, ServerContext};

    pub fn make_test_context() -> ServerContext {
        ServerContext::in_memory()
    }

    pub fn identity(user: &str, role: Role) -> Identity {
        Identity {
            user_id: UserId::from(user),
            role,
        }
    }

    /// A call on a fresh connection, plus that connection's outbound queue.
    pub fn call_as(identity: Option<Identity>) -> (CallContext, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        (CallContext { conn, identity }, rx)
    }

    pub fn entity(kind: &str, key: &str, owner: &str, visibility: Visibility) -> Entity {
        Entity {
            kind: kind.into(),
            key: key.into(),
            owner: UserId::from(owner),
            visibility,
            version: 1,
            data: json!({ "key": key }),
        }
    }
}
