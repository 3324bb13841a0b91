// src/core/auth.rs

//! The authentication binding: a thin wrapper over a pluggable provider.
//!
//! The transport core never looks inside a credential. It packs and unpacks
//! the opaque bytes and hands them to the provider to mint or verify. The
//! default provider is a keyed MAC over the caller's identity; sites with
//! stronger requirements plug in their own [`AuthProvider`].

use crate::core::TallydError;
use crate::core::protocol::PackBuf;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// An opaque authentication credential travelling inside init messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential(Bytes);

impl Credential {
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Packs the credential as a length-prefixed opaque blob.
    pub fn pack(&self, buf: &mut PackBuf) {
        buf.pack_bytes(&self.0);
    }

    pub fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self(buf.unpack_bytes()?))
    }
}

/// A pluggable credential authority: mints a credential for the local
/// process and verifies a peer's, yielding the authenticated uid.
pub trait AuthProvider: Send + Sync {
    fn create(&self) -> Result<Credential, TallydError>;

    /// Verifies the credential and extracts the authenticated uid.
    fn verify(&self, cred: &Credential) -> Result<u32, TallydError>;
}

/// Default provider: HMAC-SHA256 over `{uid, created, nonce}` with a shared
/// key, plus a freshness window against replay.
pub struct MacAuth {
    key: Vec<u8>,
    max_age_secs: u64,
}

const MAC_LEN: usize = 32;
const BODY_LEN: usize = 4 + 8 + 8;

impl MacAuth {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            max_age_secs: 300,
        }
    }

    /// Loads a hex-encoded shared key from disk.
    pub fn from_key_file(path: &std::path::Path) -> Result<Self, TallydError> {
        let text = std::fs::read_to_string(path)?;
        let key = hex::decode(text.trim())
            .map_err(|e| TallydError::Config(format!("bad auth key in {}: {e}", path.display())))?;
        Ok(Self::new(key))
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl AuthProvider for MacAuth {
    fn create(&self) -> Result<Credential, TallydError> {
        let uid = unsafe { libc::geteuid() } as u32;
        let nonce: u64 = rand::random();

        let mut body = PackBuf::with_capacity(BODY_LEN + MAC_LEN);
        body.pack_u32(uid);
        body.pack_time(Self::now_secs());
        body.pack_u64(nonce);
        let mut blob = body.into_bytes().to_vec();

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| TallydError::Internal("invalid MAC key length".to_string()))?;
        mac.update(&blob);
        blob.extend_from_slice(&mac.finalize().into_bytes());

        Ok(Credential(Bytes::from(blob)))
    }

    fn verify(&self, cred: &Credential) -> Result<u32, TallydError> {
        let data = cred.as_bytes();
        if data.len() != BODY_LEN + MAC_LEN {
            return Err(TallydError::AccessDenied);
        }
        let (body, tag) = data.split_at(BODY_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| TallydError::Internal("invalid MAC key length".to_string()))?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| TallydError::AccessDenied)?;

        let mut buf = PackBuf::from_bytes(body);
        let uid = buf.unpack_u32().map_err(|_| TallydError::AccessDenied)?;
        let created = buf.unpack_time().map_err(|_| TallydError::AccessDenied)?;

        let now = Self::now_secs();
        if now.abs_diff(created) > self.max_age_secs {
            return Err(TallydError::AccessDenied);
        }
        Ok(uid)
    }
}
