//! Watch handlers: watch, unwatch.

use async_trait::async_trait;
use serde_json::json;
use tether_core::wire::WatchAck;
use tether_core::{Entity, Identity, Request, Scope, Selector, TetherError};
use tracing::{debug, instrument};

use crate::context::{CallContext, ServerContext};
use crate::dispatcher::{Effect, Reply, RequestHandler};
use crate::handlers::misrouted;

/// Current state matching `selector` for `identity`, in key order.
async fn snapshot(ctx: &ServerContext, selector: &Selector, identity: &Identity) -> Vec<Entity> {
    let candidates: Vec<Entity> = match &selector.scope {
        Scope::Entity(key) => ctx.entities.get(&selector.kind, key).await.into_iter().collect(),
        Scope::Collection | Scope::Owned => ctx.entities.list(&selector.kind).await,
    };
    candidates
        .into_iter()
        .filter(|entity| selector.matches(entity, identity))
        .collect()
}

/// Reads the snapshot and registers the subscription under one barrier.
///
/// The subscription stays pending until the session has enqueued this
/// reply, so no push can overtake the snapshot.
pub struct WatchHandler;

#[async_trait]
impl RequestHandler for WatchHandler {
    #[instrument(skip_all, fields(kind = "watch"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::Watch(body) => body,
            other => return Err(misrouted(&other)),
        };
        let identity = call.identity()?.clone();
        let selector = body.selector;

        let barrier = ctx.publisher.lock().await;
        let snapshot = snapshot(ctx, &selector, &identity).await;
        let watch_id = ctx
            .publisher
            .subscribe(&barrier, call.conn.clone(), identity, selector);
        drop(barrier);

        debug!(%watch_id, entries = snapshot.len(), "watch opened");
        let effect = Effect::WatchOpened(watch_id.clone());
        Ok(Reply::json(&WatchAck { watch_id, snapshot })?.with_effect(effect))
    }
}

/// Cancels a subscription. Unknown ids reply `closed: false`.
pub struct UnwatchHandler;

#[async_trait]
impl RequestHandler for UnwatchHandler {
    #[instrument(skip_all, fields(kind = "unwatch"))]
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError> {
        let body = match request {
            Request::Unwatch(body) => body,
            other => return Err(misrouted(&other)),
        };
        let closed = ctx.publisher.unsubscribe(&call.conn.id, &body.watch_id);
        Ok(Reply::new(json!({ "closed": closed })))
    }
}
