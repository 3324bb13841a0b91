// src/server/service.rs

//! The per-connection service loop and its message-processing rules.
//!
//! Each accepted socket gets one loop: read a frame, unpack it, enforce the
//! first-RPC handshake gate, dispatch to the host handler, and send back
//! the reply frame. Unpack failures are answered, not fatal; handshake
//! violations are answered and fatal; a malformed frame header closes the
//! connection without a reply.

use super::dispatch::ServiceHandler;
use crate::connection::PersistConn;
use crate::core::TallydError;
use crate::core::protocol::message::PersistRcMsg;
use crate::core::protocol::{MIN_PROTOCOL_VERSION, Message, MessageKind, PROTOCOL_VERSION, rc};
use std::sync::Arc;
use tracing::{debug, error};

fn rc_reply(rc: i32, comment: impl Into<String>, ret_info: u16) -> Message {
    Message::PersistRc(PersistRcMsg {
        comment: Some(comment.into()),
        flags: 0,
        rc,
        ret_info,
    })
}

/// Drives one established connection until EOF, shutdown or a fatal
/// protocol violation.
pub(crate) async fn process_service_connection(
    mut conn: PersistConn,
    handler: Arc<dyn ServiceHandler>,
) {
    debug!("opened connection from {}", conn.remote_host());

    let mut first = !conn
        .flags
        .contains(crate::connection::ConnFlags::ALREADY_INITED);

    while !conn.is_shutdown() {
        let payload = match conn.recv_frame().await {
            Ok(Some(payload)) => payload,
            // EOF or shutdown.
            Ok(None) => break,
            Err(TallydError::BadFrameLength(len)) => {
                error!(
                    "invalid frame length {len} from connection {}",
                    conn.remote_host()
                );
                break;
            }
            Err(e) => {
                error!("read error on connection {}: {e}", conn.remote_host());
                break;
            }
        };

        let (reply, fatal) = process_msg(&mut conn, handler.as_ref(), &payload, first).await;
        first = false;

        if let Some(reply) = reply {
            let packed = match reply.pack(conn.version) {
                Ok(packed) => packed,
                Err(e) => {
                    error!("failed to pack reply: {e}");
                    break;
                }
            };
            if conn.send_frame(&packed).await.is_err() {
                // Not a big deal on a persistent connection: the peer will
                // resend once it reconnects.
                debug!(
                    "problem sending response to connection {}",
                    conn.remote_host()
                );
                break;
            }
        }

        if fatal {
            break;
        }
    }

    handler.on_finish(conn.cluster_name()).await;
    debug!("closed connection from {}", conn.remote_host());
}

/// Unpacks one frame payload and routes it. Returns the reply (if any) and
/// whether the connection must terminate afterwards.
async fn process_msg(
    conn: &mut PersistConn,
    handler: &dyn ServiceHandler,
    payload: &[u8],
    first: bool,
) -> (Option<Message>, bool) {
    let msg = match Message::unpack(payload, conn.version) {
        Ok(msg) => msg,
        Err(TallydError::VersionMismatch(version)) => {
            error!(
                "CONN:{} incompatible protocol version {version:#06x}",
                conn.remote_host()
            );
            let reply = rc_reply(
                rc::PROTOCOL_VERSION_ERROR,
                format!("protocol version {version:#06x} below minimum supported"),
                PROTOCOL_VERSION,
            );
            return (Some(reply), true);
        }
        Err(e) => {
            let kind_desc = MessageKind::peek(payload)
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let comment = format!("Failed to unpack {kind_desc} message");
            error!("CONN:{} {comment}: {e}", conn.remote_host());
            let ret_info = MessageKind::peek(payload).map(|k| k.code()).unwrap_or(0);
            return (Some(rc_reply(rc::ERROR, comment, ret_info)), false);
        }
    };

    let kind = msg.kind();
    let is_init = matches!(kind, MessageKind::PersistInit | MessageKind::LegacyInit);

    if first && !is_init {
        let comment = "Initial RPC not PersistInit";
        error!("CONN:{} {comment} (kind {kind})", conn.remote_host());
        let reply = rc_reply(rc::EINVAL, comment, MessageKind::PersistInit.code());
        return (Some(reply), true);
    }

    if !first && is_init {
        let comment = "PersistInit sent after connection established";
        error!("CONN:{} {comment}", conn.remote_host());
        let reply = rc_reply(rc::EINVAL, comment, MessageKind::PersistInit.code());
        return (Some(reply), true);
    }

    if is_init {
        return establish(conn, msg);
    }

    let dispatch = handler.on_message(conn, &msg, conn.uid()).await;
    if !rc::is_positive(dispatch.rc) {
        error!(
            "processing last message from connection {} uid {:?}",
            conn.remote_host(),
            conn.uid()
        );
    }
    let fatal = matches!(dispatch.rc, rc::ACCESS_DENIED | rc::PROTOCOL_VERSION_ERROR);
    (dispatch.reply, fatal)
}

/// Handles the first RPC: verifies the credential, negotiates the version,
/// and transfers the identity into the connection for the RPCs that follow
/// on this socket.
fn establish(conn: &mut PersistConn, msg: Message) -> (Option<Message>, bool) {
    let (proposed, cluster_name, credential) = match msg {
        Message::PersistInit(m) => (m.version, m.cluster_name, m.credential),
        Message::LegacyInit(m) => (m.version, String::new(), m.credential),
        _ => unreachable!("establish called with a non-init message"),
    };

    if proposed < MIN_PROTOCOL_VERSION {
        let reply = rc_reply(
            rc::PROTOCOL_VERSION_ERROR,
            format!("protocol version {proposed:#06x} below minimum supported"),
            PROTOCOL_VERSION,
        );
        return (Some(reply), true);
    }

    let uid = match conn.auth().verify(&credential) {
        Ok(uid) => uid,
        Err(_) => {
            error!(
                "CONN:{} authentication failure from cluster {cluster_name:?}",
                conn.remote_host()
            );
            return (
                Some(rc_reply(rc::ACCESS_DENIED, "authentication failure", 0)),
                true,
            );
        }
    };

    // The version spoken from here on is the highest both sides support;
    // ret_info announces it to the peer.
    let negotiated = proposed.min(PROTOCOL_VERSION);
    conn.version = negotiated;
    conn.set_cluster_name(cluster_name);
    conn.set_identity(credential, uid);

    debug!(
        "established connection from cluster {:?} uid {uid} at version {negotiated:#06x}",
        conn.cluster_name()
    );

    let reply = Message::PersistRc(PersistRcMsg {
        comment: None,
        flags: crate::connection::ConnFlags::DBD_MODE.bits(),
        rc: rc::SUCCESS,
        ret_info: negotiated,
    });
    (Some(reply), false)
}
