//! Account handlers: register, remove.

use async_trait::async_trait;
use serde_json::json;
use tether_core::wire::RegisterAck;
use tether_core::{Request, Role, TetherError};
use tracing::{info, instrument};

use crate::context::{CallContext, ServerContext};
use crate::dispatcher::{Effect, Reply, RequestHandler};
use crate::handlers::misrouted;

/// Creates an account.
///
/// Only an authenticated admin may create another admin. On an anonymous
/// connection the session closes the socket after the reply.
pub struct RegisterHandler;

#[async_trait]
impl RequestHandler for RegisterHandler {
    #[instrument(skip_all, fields(kind = "account.register"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::Register(body) => body,
            other => return Err(misrouted(&other)),
        };
        if body.role == Role::Admin && !call.is_admin() {
            return Err(TetherError::Unauthorized);
        }
        let account = ctx
            .accounts
            .register(&body.username, body.password.expose(), body.role)
            .await?;
        info!(user_id = %account.user_id, role = ?account.role, "account registered");
        Reply::json(&RegisterAck {
            user_id: account.user_id,
        })
    }
}

/// Deletes the bound account, then signs the connection out.
pub struct RemoveAccountHandler;

#[async_trait]
impl RequestHandler for RemoveAccountHandler {
    #[instrument(skip_all, fields(kind = "account.remove"))]
    async fn handle(&self, _request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let identity = call.identity()?;
        let account = ctx.accounts.remove(&identity.user_id).await?;
        let closed = ctx.publisher.remove_identity(&call.conn.id, &identity.user_id);
        info!(user_id = %account.user_id, closed, "account removed");
        Ok(Reply::new(json!({ "removed": true })).with_effect(Effect::SignedOut))
    }
}
