// src/server/dispatch.rs

//! The host-supplied callback surface bridging decoded messages to domain
//! logic.

use crate::connection::PersistConn;
use crate::core::protocol::Message;
use async_trait::async_trait;

/// Outcome of dispatching one message: the handler's return code (which
/// drives connection policy) and an optional reply to send back as one
/// frame.
pub struct Dispatch {
    pub rc: i32,
    pub reply: Option<Message>,
}

impl Dispatch {
    pub fn new(rc: i32, reply: Option<Message>) -> Self {
        Self { rc, reply }
    }
}

/// Domain logic behind the persistent-connection manager. The manager owns
/// the accept loop, the pool and the handshake gate; the handler only sees
/// established, authenticated traffic.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handles one decoded message. `uid` is the peer's authenticated
    /// identity, established by the connection's init RPC.
    async fn on_message(&self, conn: &PersistConn, msg: &Message, uid: Option<u32>) -> Dispatch;

    /// Runs when a connection's service loop exits.
    async fn on_finish(&self, cluster_name: &str);
}
