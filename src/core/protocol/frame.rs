// src/core/protocol/frame.rs

//! Length-prefixed framing: a 4-byte big-endian payload length followed by
//! the payload. Implements `tokio_util::codec::{Encoder, Decoder}` so both
//! the agent and the daemon drive the same codec through `Framed`.

use crate::core::TallydError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size accepted in either direction. Frames larger than
/// this are a protocol error and close the connection.
pub const MAX_MSG_SIZE: u32 = 16 * 1024 * 1024;

/// Minimum payload size: the 2-byte message kind with an empty body.
pub const MIN_MSG_SIZE: u32 = 2;

const LEN_PREFIX: usize = 4;

/// Codec for one frame: `u32` big-endian length, then `length` payload bytes.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TallydError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if !(MIN_MSG_SIZE..=MAX_MSG_SIZE).contains(&len) {
            return Err(TallydError::BadFrameLength(len));
        }

        let len = len as usize;
        if src.len() < LEN_PREFIX + len {
            // Reserve what the rest of this frame needs and wait for more.
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TallydError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = payload.len() as u32;
        if !(MIN_MSG_SIZE..=MAX_MSG_SIZE).contains(&len) {
            return Err(TallydError::BadFrameLength(len));
        }

        dst.reserve(LEN_PREFIX + payload.len());
        dst.extend_from_slice(&len.to_be_bytes());
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
