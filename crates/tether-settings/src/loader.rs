//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{TetherSettings, TlsSettings};

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
fn load_file_layer(path: &Path) -> Result<TetherSettings> {
    let parse_error = |source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(TetherSettings::default()).map_err(parse_error)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(parse_error)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(parse_error)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` overrides read through `lookup`.
///
/// Each variable has strict parsing rules; invalid values are logged and
/// ignored (falling back to file/default). TLS is only overridden when both
/// the certificate and key variables are present.
pub fn apply_overrides(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |name: &str, min: u64, max: u64| {
        let val = string(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        parsed
    };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = number("TETHER_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = number("TETHER_HEALTH_PORT", 1, 65_535) {
        settings.server.health_port = v as u16;
    }
    if let (Some(cert_path), Some(key_path)) = (string("TETHER_TLS_CERT"), string("TETHER_TLS_KEY")) {
        settings.server.tls = Some(TlsSettings { cert_path, key_path });
    }
    if let Some(v) = number("TETHER_MAX_FRAME_BYTES", 1024, 1 << 30) {
        settings.server.max_frame_bytes = v as usize;
        settings.client.max_frame_bytes = v as usize;
    }
    if let Some(v) = number("TETHER_HANDLER_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.handler_timeout_ms = v;
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = number("TETHER_REQUEST_TIMEOUT_MS", 0, 3_600_000) {
        settings.client.request_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(val) = string("TETHER_LOG_JSON") {
        match parse_bool(&val) {
            Some(v) => settings.logging.json = v,
            None => tracing::warn!(key = "TETHER_LOG_JSON", value = %val, "invalid boolean env var, ignoring"),
        }
    }
}

/// Smallest frame limit either end accepts.
const MIN_FRAME_BYTES: usize = 1024;

fn validate(settings: &TetherSettings) -> Result<()> {
    for (key, limit) in [
        ("server.maxFrameBytes", settings.server.max_frame_bytes),
        ("client.maxFrameBytes", settings.client.max_frame_bytes),
    ] {
        if limit < MIN_FRAME_BYTES {
            return Err(SettingsError::OutOfRange {
                key,
                problem: format!("must be at least {MIN_FRAME_BYTES}, got {limit}"),
            });
        }
    }
    if settings.server.outbound_queue == 0 {
        return Err(SettingsError::OutOfRange {
            key: "server.outboundQueue",
            problem: "must be positive".into(),
        });
    }
    if let Some(tls) = &settings.server.tls {
        if tls.cert_path.is_empty() {
            return Err(SettingsError::EmptyTlsPath { field: "certPath" });
        }
        if tls.key_path.is_empty() {
            return Err(SettingsError::EmptyTlsPath { field: "keyPath" });
        }
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
