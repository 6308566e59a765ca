//! Entity handlers: create, update, remove, get, list.
//!
//! Mutations commit and publish under the publisher's ordering barrier.
//! An entity the caller cannot see is reported as `NOT_FOUND`; one it can
//! see but does not own is `UNAUTHORIZED`.

use async_trait::async_trait;
use tether_core::{ChangeKind, Entity, Identity, Request, TetherError};
use tracing::{debug, instrument};

use crate::context::{CallContext, ServerContext};
use crate::dispatcher::{Reply, RequestHandler};
use crate::handlers::misrouted;

fn not_found(kind: &str, key: &str) -> TetherError {
    TetherError::not_found(format!("{kind}/{key}"))
}

/// Load an entity the caller may mutate.
async fn load_mutable(ctx: &ServerContext, identity: &Identity, kind: &str, key: &str) -> Result<Entity, TetherError> {
    let entity = ctx
        .entities
        .get(kind, key)
        .await
        .filter(|entity| entity.is_visible_to(identity))
        .ok_or_else(|| not_found(kind, key))?;
    if !entity.is_mutable_by(identity) {
        return Err(TetherError::Unauthorized);
    }
    Ok(entity)
}

/// Creates an entity owned by the caller.
pub struct CreateHandler;

#[async_trait]
impl RequestHandler for CreateHandler {
    #[instrument(skip_all, fields(kind = "entity.create"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::CreateEntity(body) => body,
            other => return Err(misrouted(&other)),
        };
        let identity = call.identity()?;
        let barrier = ctx.publisher.lock().await;
        let entity = ctx
            .entities
            .insert(Entity {
                kind: body.kind,
                key: body.key,
                owner: identity.user_id.clone(),
                visibility: body.visibility,
                version: 1,
                data: body.data,
            })
            .await?;
        let reached = ctx.publisher.publish(&barrier, ChangeKind::Created, &entity);
        drop(barrier);
        debug!(entity_kind = %entity.kind, key = %entity.key, reached, "entity created");
        Reply::json(&entity)
    }
}

/// Replaces an entity's payload and bumps its version.
pub struct UpdateHandler;

#[async_trait]
impl RequestHandler for UpdateHandler {
    #[instrument(skip_all, fields(kind = "entity.update"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::UpdateEntity(body) => body,
            other => return Err(misrouted(&other)),
        };
        let identity = call.identity()?;
        let barrier = ctx.publisher.lock().await;
        let current = load_mutable(ctx, identity, &body.kind, &body.key).await?;
        let entity = ctx
            .entities
            .replace(Entity {
                version: current.version + 1,
                data: body.data,
                ..current
            })
            .await?;
        let reached = ctx.publisher.publish(&barrier, ChangeKind::Updated, &entity);
        drop(barrier);
        debug!(entity_kind = %entity.kind, key = %entity.key, version = entity.version, reached, "entity updated");
        Reply::json(&entity)
    }
}

/// Deletes an entity; the reply and the push carry its last state.
pub struct RemoveHandler;

#[async_trait]
impl RequestHandler for RemoveHandler {
    #[instrument(skip_all, fields(kind = "entity.remove"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let target = match request {
            Request::RemoveEntity(target) => target,
            other => return Err(misrouted(&other)),
        };
        let identity = call.identity()?;
        let barrier = ctx.publisher.lock().await;
        let _ = load_mutable(ctx, identity, &target.kind, &target.key).await?;
        let entity = ctx
            .entities
            .delete(&target.kind, &target.key)
            .await
            .ok_or_else(|| not_found(&target.kind, &target.key))?;
        let reached = ctx.publisher.publish(&barrier, ChangeKind::Removed, &entity);
        drop(barrier);
        debug!(entity_kind = %entity.kind, key = %entity.key, reached, "entity removed");
        Reply::json(&entity)
    }
}

/// Reads one visible entity.
pub struct GetHandler;

#[async_trait]
impl RequestHandler for GetHandler {
    #[instrument(skip_all, fields(kind = "entity.get"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let target = match request {
            Request::GetEntity(target) => target,
            other => return Err(misrouted(&other)),
        };
        let identity = call.identity()?;
        let entity = ctx
            .entities
            .get(&target.kind, &target.key)
            .await
            .filter(|entity| entity.is_visible_to(identity))
            .ok_or_else(|| not_found(&target.kind, &target.key))?;
        Reply::json(&entity)
    }
}

/// Lists the visible entities of a kind, in key order.
pub struct ListHandler;

#[async_trait]
impl RequestHandler for ListHandler {
    #[instrument(skip_all, fields(kind = "entity.list"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::ListEntities(body) => body,
            other => return Err(misrouted(&other)),
        };
        let identity = call.identity()?;
        let visible: Vec<Entity> = ctx
            .entities
            .list(&body.kind)
            .await
            .into_iter()
            .filter(|entity| entity.is_visible_to(identity))
            .collect();
        Reply::json(&visible)
    }
}
