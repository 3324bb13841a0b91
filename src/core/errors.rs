// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures in the agent,
/// the connection layer and the daemon.
///
/// IO errors are wrapped in an `Arc` so the whole enum stays cheaply
/// cloneable even though `std::io::Error` is not.
#[derive(Error, Debug, Clone)]
pub enum TallydError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame length {0} outside protocol bounds")]
    BadFrameLength(u32),

    #[error("not enough bytes left to unpack")]
    UnpackShort,

    #[error("failed to unpack {0} message")]
    Unpack(String),

    #[error("malformed field: {0}")]
    Malformed(String),

    #[error("access denied")]
    AccessDenied,

    #[error("protocol version {0:#06x} below minimum supported")]
    VersionMismatch(u16),

    #[error("operation timed out")]
    Timeout,

    #[error("agent queue is full, request discarded")]
    QueueFull,

    #[error("failed to spawn agent worker")]
    SpawnFailed,

    #[error("shutdown in progress")]
    Shutdown,

    #[error("unexpected response: {0}")]
    BadResponse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for TallydError {
    fn from(e: std::io::Error) -> Self {
        TallydError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for TallydError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        TallydError::Malformed("string field is not valid UTF-8".to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TallydError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TallydError::Timeout
    }
}
