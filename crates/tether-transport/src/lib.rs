//! # tether-transport
//!
//! The byte-stream layer under a tether connection:
//!
//! - [`codec::JsonCodec`]: 4-byte big-endian length prefix + one JSON value per frame
//! - [`tls`]: PEM loading and `tokio-rustls` acceptor/connector construction
//! - [`ByteStream`]: the boxed duplex stream both ends run on, plain TCP or TLS
//!
//! Nothing here knows about correlation ids or watches.

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod stream;
pub mod tls;

pub use codec::{ClientCodec, DEFAULT_MAX_FRAME_BYTES, JsonCodec, ServerCodec};
pub use errors::TransportError;
pub use stream::{ByteStream, BoxedStream, connect};
