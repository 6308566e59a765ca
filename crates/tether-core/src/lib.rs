//! # tether-core
//!
//! Shared vocabulary for both ends of the tether protocol:
//!
//! - **Branded IDs**: `RequestId`, `WatchId`, `ConnectionId`, `UserId`
//! - **Requests**: the [`Request`] sum type, decoded once at the connection boundary
//! - **Frames**: [`RequestFrame`] (client → server) and [`ServerFrame`] (server → client)
//! - **Entities**: opaque [`Entity`] records and the [`Selector`] used to watch them
//! - **Errors**: the flat [`TetherError`] enum and its wire body
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod auth;
pub mod entity;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod request;
pub mod wire;

pub use auth::{AuthState, Identity, Role};
pub use entity::{Entity, Scope, Selector, Visibility};
pub use errors::{ErrorBody, ErrorCategory, TetherError};
pub use ids::{ConnectionId, RequestId, UserId, WatchId};
pub use request::{Request, RequestKind};
pub use wire::{ChangeKind, RequestFrame, ServerFrame, WatchPush};
