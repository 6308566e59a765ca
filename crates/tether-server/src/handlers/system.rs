//! System handlers: ping.

use async_trait::async_trait;
use tether_core::{Request, TetherError};
use tracing::instrument;

use crate::context::{CallContext, ServerContext};
use crate::dispatcher::{Reply, RequestHandler};

/// Returns a pong with the current server timestamp.
pub struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    #[instrument(skip_all, fields(kind = "system.ping"))]
    async fn handle(&self, _request: Request, _call: &CallContext, _ctx: &ServerContext) -> Result<Reply, TetherError> {
        Ok(Reply::new(serde_json::json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_helpers::{call_as, make_test_context};
    use tether_core::request::Empty;

    #[tokio::test]
    async fn ping_returns_pong() {
        let ctx = make_test_context();
        let (call, _rx) = call_as(None);
        let reply = PingHandler.handle(Request::Ping(Empty {}), &call, &ctx).await.unwrap();
        assert_eq!(reply.body["pong"], true);
        assert!(reply.body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn ping_timestamp_is_rfc3339() {
        let ctx = make_test_context();
        let (call, _rx) = call_as(None);
        let reply = PingHandler.handle(Request::Ping(Empty {}), &call, &ctx).await.unwrap();
        let ts = reply.body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
