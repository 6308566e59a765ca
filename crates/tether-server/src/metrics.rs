//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
/// Connections closed (counter).
pub const DISCONNECTIONS_TOTAL: &str = "tether_disconnections_total";
/// Open connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
/// Connection lifetime (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "tether_connection_duration_seconds";
/// TLS handshakes that failed (counter).
pub const HANDSHAKE_FAILURES_TOTAL: &str = "tether_handshake_failures_total";
/// Requests dispatched (counter, labels: kind).
pub const REQUESTS_TOTAL: &str = "tether_requests_total";
/// Requests that failed (counter, labels: kind, code).
pub const ERRORS_TOTAL: &str = "tether_errors_total";
/// Handler run time (histogram, labels: kind).
pub const REQUEST_DURATION_SECONDS: &str = "tether_request_duration_seconds";
/// Push frames enqueued (counter, labels: change).
pub const PUSHES_TOTAL: &str = "tether_pushes_total";
/// Push frames dropped on a full outbound queue (counter).
pub const PUSH_DROPS_TOTAL: &str = "tether_push_drops_total";
/// Registered subscriptions (gauge).
pub const WATCHES_ACTIVE: &str = "tether_watches_active";
/// Inbound frames that could not be decoded (counter).
pub const MALFORMED_FRAMES_TOTAL: &str = "tether_malformed_frames_total";
