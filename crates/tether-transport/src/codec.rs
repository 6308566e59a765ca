//! Length-prefixed JSON frame codec.
//!
//! Each frame is a 4-byte big-endian payload length followed by exactly that
//! many bytes of UTF-8 JSON. A TCP read can return half a frame or several
//! frames at once; [`LengthDelimitedCodec`] reassembles them so each decode
//! yields one whole message.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_core::{RequestFrame, ServerFrame};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::errors::TransportError;

/// Default maximum frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec encoding `Out` and decoding `In`, one JSON value per frame.
pub struct JsonCodec<Out, In> {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
    _types: PhantomData<fn(Out) -> In>,
}

/// The client's view: writes requests, reads server frames.
pub type ClientCodec = JsonCodec<RequestFrame, ServerFrame>;

/// The server's view: writes server frames, reads requests.
pub type ServerCodec = JsonCodec<ServerFrame, RequestFrame>;

impl<Out, In> JsonCodec<Out, In> {
    /// Create a codec rejecting frames larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            inner,
            max_frame_bytes,
            _types: PhantomData,
        }
    }

    /// Configured frame limit.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn oversized(&self, err: &io::Error, len: usize) -> Option<TransportError> {
        err.get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
            .then_some(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            })
    }
}

impl<Out, In> Default for JsonCodec<Out, In> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<Out, In: DeserializeOwned> Decoder for JsonCodec<Out, In> {
    type Item = In;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, TransportError> {
        let declared = src
            .get(..4)
            .map_or(0, |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize);
        let frame = match self.inner.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.oversized(&e, declared).unwrap_or(TransportError::Io(e))),
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

impl<Out: Serialize, In> Encoder<Out> for JsonCodec<Out, In> {
    type Error = TransportError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&item).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let len = payload.len();
        self.inner
            .encode(Bytes::from(payload), dst)
            .map_err(|e| self.oversized(&e, len).unwrap_or(TransportError::Io(e)))
    }
}
