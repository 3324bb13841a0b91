// src/agent/mod.rs

//! The client-side agent owning the persistent connection to the
//! accounting daemon.
//!
//! An [`Agent`] is a cheap handle over shared state: a bounded outbound
//! FIFO drained by one worker task, the single authenticated connection,
//! and the spill file carrying the queue across restarts. Fire-and-forget
//! records go through [`Agent::enqueue`]; request/response RPCs go through
//! [`Agent::send_recv`] / [`Agent::send_rc`] on the same connection.

pub mod queue;
pub mod spill;
mod worker;

pub use queue::{AgentQueue, MAX_AGENT_QUEUE};
pub use spill::SPILL_MAGIC;

use crate::connection::{ConnFlags, PersistConn};
use crate::core::TallydError;
use crate::core::auth::AuthProvider;
use crate::core::protocol::{Message, PROTOCOL_VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::error;

/// How long a graceful shutdown waits for the worker before abandoning it.
/// An abandoned worker may lose the spill save.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Connection settings for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub cluster_name: String,
    pub persist_type: u16,
    /// Our own listening port announced in the handshake, 0 if none.
    pub local_port: u16,
    pub state_save_location: PathBuf,
    /// Receive budget per reply.
    pub timeout: Duration,
    /// Demote connect-failure logging to debug.
    pub suppress_errors: bool,
}

pub(crate) struct AgentShared {
    pub(crate) queue: Mutex<AgentQueue>,
    pub(crate) not_empty: Notify,
    pub(crate) conn: Mutex<PersistConn>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) state_save_location: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the process's outbound accounting agent.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<AgentShared>,
}

impl Agent {
    /// Creates the agent and spawns its worker. The worker connects in the
    /// background; an unreachable daemon does not fail `open`, it just
    /// leaves the worker retrying.
    pub async fn open(
        config: AgentConfig,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, TallydError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut flags = ConnFlags::DBD_MODE | ConnFlags::RECONNECT;
        if config.suppress_errors {
            flags |= ConnFlags::SUPPRESS_ERR;
        }

        let conn = PersistConn::new(
            config.remote_host.clone(),
            config.remote_port,
            config.cluster_name.clone(),
            config.persist_type,
            config.local_port,
            flags,
            Some(config.timeout),
            auth,
            shutdown_rx,
        );

        let agent = Self {
            shared: Arc::new(AgentShared {
                queue: Mutex::new(AgentQueue::new()),
                not_empty: Notify::new(),
                conn: Mutex::new(conn),
                shutdown_tx,
                state_save_location: config.state_save_location,
                worker: Mutex::new(None),
            }),
        };
        agent.ensure_worker().await?;
        Ok(agent)
    }

    /// Spawns the worker if none is running. Called lazily from every
    /// enqueue so a worker that died is replaced.
    async fn ensure_worker(&self) -> Result<(), TallydError> {
        if *self.shared.shutdown_tx.borrow() {
            return Err(TallydError::SpawnFailed);
        }
        let mut worker = self.shared.worker.lock().await;
        if worker.as_ref().is_none_or(|handle| handle.is_finished()) {
            *worker = Some(tokio::spawn(worker::run(self.shared.clone())));
        }
        Ok(())
    }

    /// Queues a record for delivery and returns immediately. Fails only
    /// when the queue is saturated after the purge policy ran, or when no
    /// worker could be spawned.
    pub async fn enqueue(&self, msg: &Message) -> Result<(), TallydError> {
        let payload = msg.pack(PROTOCOL_VERSION)?;
        self.ensure_worker().await?;
        self.shared.queue.lock().await.push(payload)?;
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Sends one RPC on the persistent connection and waits for its reply,
    /// opening the connection first if needed. Not queued: an error here is
    /// the caller's to handle.
    pub async fn send_recv(&self, msg: &Message) -> Result<Message, TallydError> {
        let mut conn = self.shared.conn.lock().await;
        if !conn.is_open() {
            conn.open().await?;
        }
        conn.rpc(msg).await
    }

    /// Like [`Agent::send_recv`] but reduces the reply to its return code.
    pub async fn send_rc(&self, msg: &Message) -> Result<i32, TallydError> {
        match self.send_recv(msg).await? {
            Message::Rc(m) => Ok(m.rc),
            Message::JobStartRc(m) => Ok(m.rc),
            Message::PersistRc(m) => Ok(m.rc),
            other => Err(TallydError::BadResponse(format!(
                "{} in reply to {}",
                other.kind(),
                msg.kind()
            ))),
        }
    }

    /// Graceful shutdown: wakes the worker, gives it a short grace period
    /// to spill the queue, then closes the connection. An unresponsive
    /// worker is abandoned with an error; its spill save may be lost.
    pub async fn close(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.not_empty.notify_waiters();

        let handle = self.shared.worker.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                error!("agent failed to shut down gracefully");
            }
        }

        self.shared.conn.lock().await.close();
    }

    /// Current queue depth, for callers that degrade under back-pressure.
    pub async fn queue_depth(&self) -> usize {
        self.shared.queue.lock().await.len()
    }
}
