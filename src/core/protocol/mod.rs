// src/core/protocol/mod.rs

//! The shared wire protocol: buffer codec, frame codec and the message
//! catalogue, plus the protocol version constants both sides negotiate on.

pub mod buffer;
pub mod frame;
pub mod message;

pub use buffer::PackBuf;
pub use frame::{FrameCodec, MAX_MSG_SIZE, MIN_MSG_SIZE};
pub use message::{Message, MessageKind};

/// Current protocol version proposed by this build.
pub const PROTOCOL_VERSION: u16 = 0x0B00;

/// First version in which `PersistRc` carries the connection-flag word.
pub const RC_FLAGS_VERSION: u16 = 0x0A00;

/// Oldest version either side will still talk to.
pub const MIN_PROTOCOL_VERSION: u16 = 0x0900;

/// Return codes carried in acknowledgement messages and produced by the
/// daemon's message handler.
pub mod rc {
    pub const SUCCESS: i32 = 0;
    /// Generic failure, e.g. a body that would not unpack.
    pub const ERROR: i32 = -1;
    pub const EINVAL: i32 = 22;

    /// Connection-fatal: the credential was rejected.
    pub const ACCESS_DENIED: i32 = 1001;
    /// Connection-fatal: negotiated version below the supported minimum.
    pub const PROTOCOL_VERSION_ERROR: i32 = 1002;

    // Positive conditions a handler may return without terminating the
    // connection.
    pub const FIRST_REGISTRATION: i32 = 1100;
    pub const TRES_CHANGED: i32 = 1101;
    pub const NODES_CHANGED: i32 = 1102;

    /// True for return codes that leave the connection open.
    pub fn is_positive(rc: i32) -> bool {
        matches!(rc, SUCCESS | FIRST_REGISTRATION | TRES_CHANGED | NODES_CHANGED)
    }
}
