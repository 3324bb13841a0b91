// src/agent/worker.rs

//! The agent's single worker task.
//!
//! The worker owns delivery: it restores any spilled payloads, then loops
//! taking the head of the queue, sending it as one frame, and waiting for
//! the acknowledgement before popping. A failed delivery leaves the head in
//! place and backs off; the queue is spilled to disk when the worker exits.

use super::AgentShared;
use super::spill;
use crate::connection::PersistConn;
use crate::core::TallydError;
use crate::core::protocol::{Message, rc};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

/// Floor between reconnect attempts after a delivery failure.
const RECONNECT_FLOOR: Duration = Duration::from_secs(10);

/// Idle wait deadline; the worker re-evaluates its state at least this
/// often even without a wakeup.
const IDLE_DEADLINE: Duration = Duration::from_secs(10);

pub(crate) async fn run(shared: Arc<AgentShared>) {
    // Recover anything a previous incarnation left on disk, ahead of new
    // traffic.
    match spill::load(&shared.state_save_location).await {
        Ok(entries) if !entries.is_empty() => {
            info!("recovered {} pending RPCs", entries.len());
            let mut queue = shared.queue.lock().await;
            for payload in entries {
                queue.restore(payload);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("failed to recover agent state: {e}"),
    }

    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut fail_at: Option<Instant> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let conn_open = {
            let mut conn = shared.conn.lock().await;
            if !conn.is_open() && fail_at.is_none_or(|at| at.elapsed() >= RECONNECT_FLOOR) {
                if conn.open().await.is_err() {
                    fail_at = Some(Instant::now());
                }
            }
            conn.is_open()
        };

        let head = {
            let queue = shared.queue.lock().await;
            let depth = queue.len();
            let backing_off = fail_at.is_some_and(|at| at.elapsed() < RECONNECT_FLOOR);
            if depth == 0 || !conn_open || backing_off {
                None
            } else {
                if depth % 50 == 0 {
                    info!("agent queue size {depth}");
                }
                queue.peek_front()
            }
        };

        let Some(payload) = head else {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = shared.not_empty.notified() => {}
                _ = sleep(IDLE_DEADLINE) => {}
            }
            continue;
        };

        // The queue lock is clear while the RPC is in flight, so producers
        // keep enqueueing behind the head.
        let delivered = {
            let mut conn = shared.conn.lock().await;
            send_and_ack(&mut conn, &payload).await
        };

        match delivered {
            Ok(()) => {
                shared.queue.lock().await.pop_front();
                fail_at = None;
            }
            Err(TallydError::Shutdown) => break,
            Err(e) => {
                if *shutdown_rx.borrow() {
                    break;
                }
                error!("failed to deliver queued message: {e}");
                fail_at = Some(Instant::now());
            }
        }
    }

    let pending = shared.queue.lock().await.drain();
    if !pending.is_empty() {
        match spill::save(&shared.state_save_location, &pending).await {
            Ok(count) => info!("saved {count} pending RPCs"),
            Err(e) => error!("failed to save agent state: {e}"),
        }
    }
}

/// Sends one queued payload and reads its acknowledgement. Delivery counts
/// only when the peer answered with a success code.
async fn send_and_ack(conn: &mut PersistConn, payload: &Bytes) -> Result<(), TallydError> {
    conn.send_frame(payload).await?;

    let Some(reply) = conn.recv_frame().await? else {
        return Err(TallydError::ConnectionClosed);
    };

    let rc = match Message::unpack(&reply, conn.version)? {
        Message::Rc(m) => m.rc,
        Message::JobStartRc(m) => m.rc,
        Message::PersistRc(m) => m.rc,
        other => {
            return Err(TallydError::BadResponse(format!(
                "{} in reply to queued message",
                other.kind()
            )));
        }
    };

    if rc == rc::SUCCESS {
        Ok(())
    } else {
        Err(TallydError::BadResponse(format!("return code {rc}")))
    }
}
