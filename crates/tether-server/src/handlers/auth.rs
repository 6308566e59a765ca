//! Auth handlers: login, logout.

use async_trait::async_trait;
use serde_json::json;
use tether_core::{Request, TetherError};
use tracing::{debug, instrument};

use crate::context::{CallContext, ServerContext};
use crate::dispatcher::{Effect, Reply, RequestHandler};
use crate::handlers::misrouted;

/// Checks credentials and binds the identity to the connection.
pub struct LoginHandler;

#[async_trait]
impl RequestHandler for LoginHandler {
    #[instrument(skip_all, fields(kind = "auth.login"))]
    async fn handle(&self, request: Request, _call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::Login(body) => body,
            other => return Err(misrouted(&other)),
        };
        let identity = ctx
            .accounts
            .authenticate(&body.username, body.password.expose())
            .await?;
        Ok(Reply::json(&identity)?.with_effect(Effect::Authenticated(identity)))
    }
}

/// Unbinds the identity and closes the watches it held on this connection.
pub struct LogoutHandler;

#[async_trait]
impl RequestHandler for LogoutHandler {
    #[instrument(skip_all, fields(kind = "auth.logout"))]
    async fn handle(&self, _request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let identity = call.identity()?;
        let closed = ctx.publisher.remove_identity(&call.conn.id, &identity.user_id);
        debug!(user_id = %identity.user_id, closed, "watches closed on logout");
        Ok(Reply::new(json!({ "loggedOut": true })).with_effect(Effect::SignedOut))
    }
}
