//! # Frame Codec
//!
//! Length-prefixed framing for the reliable channel, as a `tokio_util`
//! [`Decoder`]/[`Encoder`] pair.
//!
//! ## Wire Format
//! ```text
//! [Length(2, big-endian)] [Payload(Length)]
//! ```
//!
//! The length counts payload bytes only. A declared length of zero, or one
//! larger than the configured maximum, is a protocol violation and is fatal to
//! the connection.
//!
//! The decoder never reserves space on its own: a partial frame stays in the
//! caller's buffer untouched until enough bytes arrive, so the caller decides
//! how much memory accumulation may use. Decoded payloads are copied out so the
//! accumulation buffer stays uniquely owned and can be compacted in place.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use crate::error::{Result, TransportError};

/// Codec for `[u16 length][payload]` frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec accepting payloads up to `max_frame_size` bytes.
    ///
    /// The limit is clamped to [`MAX_FRAME_SIZE`] since the header cannot
    /// describe more than the working buffer holds.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.clamp(1, MAX_FRAME_SIZE),
        }
    }

    /// Largest payload this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Check a payload against the send-side contract
    pub fn check_payload(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(TransportError::EmptyFrame);
        }
        if len > self.max_frame_size {
            return Err(TransportError::OversizedFrame(len));
        }
        Ok(())
    }

    /// Encode a single payload into a standalone wire unit
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes> {
        self.check_payload(payload.len())?;
        let mut dst = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        dst.put_u16(payload.len() as u16);
        dst.extend_from_slice(payload);
        Ok(dst.freeze())
    }

    /// Peek at the declared length of the frame at the front of `src`
    fn declared_len(&self, src: &[u8]) -> Result<Option<usize>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len == 0 || len > self.max_frame_size {
            return Err(TransportError::InvalidFrameLength(len));
        }
        Ok(Some(len))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(len) = self.declared_len(src)? else {
            return Ok(None);
        };

        if src.len() < FRAME_HEADER_LEN + len {
            trace!(
                declared = len,
                buffered = src.len() - FRAME_HEADER_LEN,
                "Partial frame, waiting for more bytes"
            );
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let frame = Bytes::copy_from_slice(&src[..len]);
        src.advance(len);
        Ok(Some(frame))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.check_payload(item.len())?;
        dst.reserve(FRAME_HEADER_LEN + item.len());
        dst.put_u16(item.len() as u16);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
