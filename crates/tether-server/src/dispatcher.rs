//! Handler registry and request dispatch.
//!
//! Every decoded request reaches exactly one handler and yields exactly one
//! `Result`. Handler panics and overruns are folded into `UNKNOWN` here, so
//! a buggy handler can never leave a request without a reply.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use tether_core::{Identity, Request, RequestId, RequestKind, TetherError, WatchId};
use tracing::{debug, error, instrument, warn};

use crate::context::{CallContext, ServerContext};
use crate::handlers;
use crate::metrics::{ERRORS_TOTAL, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL};

/// Requests slower than this are logged.
const SLOW_REQUEST: Duration = Duration::from_secs(5);

/// Connection-state change a successful handler asks the session to apply
/// once its reply is enqueued.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Effect {
    /// Nothing to apply.
    #[default]
    None,
    /// Bind `identity` to the connection.
    Authenticated(Identity),
    /// Unbind the connection's identity.
    SignedOut,
    /// Start delivering pushes for a freshly registered subscription.
    WatchOpened(WatchId),
}

/// A successful handler result.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Reply `message`.
    pub body: Value,
    /// Follow-up for the session.
    pub effect: Effect,
}

impl Reply {
    /// Plain reply with no follow-up.
    pub fn new(body: Value) -> Self {
        Self {
            body,
            effect: Effect::None,
        }
    }

    /// Serialize `body` into a reply.
    pub fn json<T: Serialize>(body: &T) -> Result<Self, TetherError> {
        serde_json::to_value(body)
            .map(Self::new)
            .map_err(|e| TetherError::unknown(format!("failed to encode reply: {e}")))
    }

    /// Attach a follow-up.
    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }
}

/// Implemented by every request handler.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Execute the request on behalf of `call`.
    async fn handle(&self, request: Request, call: &CallContext, ctx: &ServerContext) -> Result<Reply, TetherError>;
}

/// Routes decoded requests to their handlers.
pub struct Dispatcher {
    handlers: HashMap<RequestKind, Arc<dyn RequestHandler>>,
    ctx: ServerContext,
    handler_timeout: Duration,
}

impl Dispatcher {
    /// A dispatcher with no handlers.
    pub fn new(ctx: ServerContext, handler_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            ctx,
            handler_timeout,
        }
    }

    /// A dispatcher serving every request kind.
    pub fn with_default_handlers(ctx: ServerContext, handler_timeout: Duration) -> Self {
        let mut dispatcher = Self::new(ctx, handler_timeout);
        handlers::register_all(&mut dispatcher);
        dispatcher
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: RequestKind, handler: impl RequestHandler + 'static) {
        let _ = self.handlers.insert(kind, Arc::new(handler));
    }

    /// Whether `kind` has a handler.
    pub fn handles(&self, kind: RequestKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Shared handler context.
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Run one request to completion.
    #[instrument(skip_all, fields(request_id = %id, kind = %request.kind(), conn_id = %call.conn.id))]
    pub async fn dispatch(&self, id: &RequestId, request: Request, call: &CallContext) -> Result<Reply, TetherError> {
        let kind = request.kind();
        counter!(REQUESTS_TOTAL, "kind" => kind.tag()).increment(1);

        let Some(handler) = self.handlers.get(&kind).cloned() else {
            let err = TetherError::UnknownRequestType {
                kind: kind.tag().to_owned(),
            };
            counter!(ERRORS_TOTAL, "kind" => kind.tag(), "code" => err.code()).increment(1);
            return Err(err);
        };

        let start = Instant::now();
        let run = AssertUnwindSafe(handler.handle(request, call, &self.ctx)).catch_unwind();
        let result = match tokio::time::timeout(self.handler_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "request handler panicked");
                Err(TetherError::unknown(format!("handler for '{kind}' crashed: {msg}")))
            }
            Err(_elapsed) => {
                error!(timeout_ms = self.handler_timeout.as_millis() as u64, "request handler timed out");
                Err(TetherError::unknown(format!(
                    "handler for '{kind}' timed out after {}ms",
                    self.handler_timeout.as_millis()
                )))
            }
        };

        let duration = start.elapsed();
        histogram!(REQUEST_DURATION_SECONDS, "kind" => kind.tag()).record(duration.as_secs_f64());
        if duration >= SLOW_REQUEST {
            warn!(duration_secs = duration.as_secs_f64(), "slow request");
        }

        match &result {
            Ok(_) => debug!("request succeeded"),
            Err(err) => {
                counter!(ERRORS_TOTAL, "kind" => kind.tag(), "code" => err.code()).increment(1);
                debug!(code = err.code(), error = %err, "request failed");
            }
        }
        result
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|kind| kind.tag()).collect();
        kinds.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("handlers", &kinds)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned()
}
