//! # tether-client
//!
//! Client side of the tether protocol over one persistent socket:
//!
//! - **Request Multiplexer**: correlation ids, pending callers, timeouts
//! - **Watch Registry**: server subscriptions as [`Watcher`] handles with
//!   ordered listener dispatch and idempotent close
//! - **Connection actor**: one task per socket owning all of the above
//!
//! ```text
//! let client = Client::connect(&ClientConfig::new("127.0.0.1:7443")).await?;
//! client.login("ann", "secret").await?;
//! let watcher = client.watch(Selector::collection("listing")).await?;
//! watcher.add_on_change_listener(|event| println!("{event:?}"));
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
mod multiplexer;
pub mod watch;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_REQUEST_TIMEOUT, TlsTarget};
pub use connection::{CloseReason, ConnectionStatus};
pub use watch::{ListenerId, MAX_BACKLOG, WatchEvent, Watcher, WatcherState};
