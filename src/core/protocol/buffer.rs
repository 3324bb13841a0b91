// src/core/protocol/buffer.rs

//! A byte buffer with a read/write cursor used by every message body.
//!
//! All multi-byte integers are packed big-endian. Strings are length-prefixed
//! with a `u32`, with `0xFFFF_FFFF` reserved as the NULL sentinel so that a
//! missing string can be distinguished from an empty one. Every `unpack_*`
//! primitive checks the remaining length before touching the buffer and
//! fails with `TallydError::UnpackShort` on exhaustion; decoded length
//! fields are never trusted beyond the bytes actually present.

use crate::core::TallydError;
use bytes::{BufMut, Bytes, BytesMut};

/// Length sentinel marking a NULL (absent) string on the wire.
pub const NULL_STR_LEN: u32 = 0xFFFF_FFFF;

/// A pack/unpack buffer with an explicit read cursor.
#[derive(Debug, Default)]
pub struct PackBuf {
    data: BytesMut,
    cursor: usize,
}

impl PackBuf {
    /// Creates an empty buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            cursor: 0,
        }
    }

    /// Creates a buffer over existing bytes with the cursor at offset zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            cursor: 0,
        }
    }

    /// Consumes the buffer, yielding the packed bytes.
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }

    /// Current read cursor.
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// Moves the read cursor. Offsets past the end clamp to the end.
    pub fn set_offset(&mut self, offset: usize) {
        self.cursor = offset.min(self.data.len());
    }

    /// Total number of packed bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&[u8], TallydError> {
        if self.remaining() < n {
            return Err(TallydError::UnpackShort);
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.data[start..self.cursor])
    }

    // --- integer primitives ---

    pub fn pack_u8(&mut self, v: u8) {
        self.data.put_u8(v);
    }

    pub fn pack_u16(&mut self, v: u16) {
        self.data.put_u16(v);
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.data.put_u32(v);
    }

    pub fn pack_u64(&mut self, v: u64) {
        self.data.put_u64(v);
    }

    /// Seconds since the Unix epoch, packed as a `u64`.
    pub fn pack_time(&mut self, v: u64) {
        self.pack_u64(v);
    }

    pub fn unpack_u8(&mut self) -> Result<u8, TallydError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, TallydError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, TallydError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, TallydError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn unpack_time(&mut self) -> Result<u64, TallydError> {
        self.unpack_u64()
    }

    // --- strings and raw bytes ---

    /// Packs an optional string: `None` becomes the NULL sentinel, `Some`
    /// becomes a `u32` length followed by the UTF-8 bytes.
    pub fn pack_str(&mut self, s: Option<&str>) {
        match s {
            None => self.pack_u32(NULL_STR_LEN),
            Some(s) => {
                self.pack_u32(s.len() as u32);
                self.data.put_slice(s.as_bytes());
            }
        }
    }

    /// Unpacks an optional string, validating the length field against the
    /// bytes actually remaining.
    pub fn unpack_str(&mut self) -> Result<Option<String>, TallydError> {
        let len = self.unpack_u32()?;
        if len == NULL_STR_LEN {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?.to_vec();
        Ok(Some(String::from_utf8(bytes)?))
    }

    /// Packs raw bytes with a `u32` length prefix.
    pub fn pack_bytes(&mut self, b: &[u8]) {
        self.pack_u32(b.len() as u32);
        self.data.put_slice(b);
    }

    pub fn unpack_bytes(&mut self) -> Result<Bytes, TallydError> {
        let len = self.unpack_u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    // --- string arrays ---

    /// Packs a `u32` count followed by that many (non-NULL) strings.
    pub fn pack_str_array(&mut self, items: &[String]) {
        self.pack_u32(items.len() as u32);
        for item in items {
            self.pack_str(Some(item));
        }
    }

    pub fn unpack_str_array(&mut self) -> Result<Vec<String>, TallydError> {
        let count = self.unpack_u32()? as usize;
        // Each entry carries at least its 4-byte length prefix.
        if count.saturating_mul(4) > self.remaining() {
            return Err(TallydError::UnpackShort);
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            match self.unpack_str()? {
                Some(s) => items.push(s),
                None => {
                    return Err(TallydError::Malformed(
                        "NULL entry in string array".to_string(),
                    ));
                }
            }
        }
        Ok(items)
    }
}
