//! # tether-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`TetherSettings::default()`]
//! 2. **User file** - `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `TETHER_*` overrides (highest priority)
//!
//! The loaded value is passed explicitly to the server and client
//! constructors; there is no process-wide settings singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
