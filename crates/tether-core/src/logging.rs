//! `tracing` subscriber setup.
//!
//! Connection context (connection id, request id, watch id) travels as span
//! fields rather than being formatted into messages, so the same call sites
//! work for the compact and the JSON output.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG`, when set, wins over `level`. With `json` the output is one
/// JSON object per line; otherwise the compact human-readable format.
/// Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init is a no-op if a global default is already set
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
