//! # tether-server
//!
//! Server side of the tether protocol: one session task per socket, gated by
//! a per-connection [`auth::AuthGate`], dispatching typed requests through
//! the [`dispatcher::Dispatcher`] and fanning committed mutations out via
//! the [`publisher::WatchPublisher`].
//!
//! - **Listener**: [`server::TetherServer`] accepts TCP (optionally TLS)
//!   sockets and serves `/health` and `/metrics` over axum
//! - **Stores**: [`accounts::AccountStore`] and [`store::EntityStore`] with
//!   in-memory implementations
//! - **Shutdown**: [`shutdown::ShutdownCoordinator`] cancels every session,
//!   which emits `socket-closed` before terminating

#![deny(unsafe_code)]

pub mod accounts;
pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod publisher;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;

pub use config::{ServerConfig, TlsPaths};
pub use context::{CallContext, ServerContext};
pub use dispatcher::{Dispatcher, Effect, Reply, RequestHandler};
pub use server::TetherServer;
