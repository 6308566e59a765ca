//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open protocol connections.
    pub connections: usize,
    /// Registered subscriptions across all connections.
    pub watches: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, watches: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        watches,
    }
}
