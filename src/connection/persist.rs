// src/connection/persist.rs

//! The persistent connection object shared by the agent and the daemon.
//!
//! A `PersistConn` owns one socket wrapped in a length-prefixed `Framed`
//! transport, the negotiated protocol version, the connection flag word and
//! a shutdown token observed inside every blocking helper. The socket has a
//! single writer and a single reader: the owning task.

use crate::core::TallydError;
use crate::core::auth::{AuthProvider, Credential};
use crate::core::protocol::message::{PersistInitMsg, PersistRcMsg};
use crate::core::protocol::{FrameCodec, Message, PROTOCOL_VERSION, rc};
use bitflags::bitflags;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, error};

/// Write-side poll budget per frame.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for establishing the TCP connection itself.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reopen attempts within one send before giving the message back to the
/// caller's retry loop.
const REOPEN_ATTEMPTS: u32 = 3;

/// Communication failures are logged at most once per this interval per
/// connection to keep a dead peer from flooding the logs.
const COMM_FAIL_LOG_INTERVAL: Duration = Duration::from_secs(600);

bitflags! {
    /// Connection behaviour flags. The low bits travel in `PersistRc`
    /// replies so a peer can grant them during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u16 {
        /// Connection speaks to the accounting daemon.
        const DBD_MODE = 0x0001;
        /// Reopen (with a fresh handshake) after a mid-stream hangup.
        const RECONNECT = 0x0002;
        /// Demote connect-failure logging to debug.
        const SUPPRESS_ERR = 0x0004;
        /// Handshake already ran on this socket before it was handed over.
        const ALREADY_INITED = 0x0008;
    }
}

enum Writability {
    Ready,
    HungUp,
    TimedOut,
}

/// One persistent, authenticated, framed connection.
pub struct PersistConn {
    framed: Option<Framed<TcpStream, FrameCodec>>,
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    cluster_name: String,
    persist_type: u16,
    /// Negotiated protocol version governing every message on this socket.
    pub version: u16,
    pub flags: ConnFlags,
    /// Receive budget. `None` waits forever (the daemon side), relying on
    /// the shutdown token and peer close for termination.
    timeout: Option<Duration>,
    auth: Arc<dyn AuthProvider>,
    shutdown: watch::Receiver<bool>,
    /// Credential and verified uid transferred from the peer's init RPC.
    identity: Option<(Credential, u32)>,
    comm_fail_at: Option<Instant>,
}

impl PersistConn {
    /// Creates an unconnected client-side connection object.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote_host: String,
        remote_port: u16,
        cluster_name: String,
        persist_type: u16,
        local_port: u16,
        flags: ConnFlags,
        timeout: Option<Duration>,
        auth: Arc<dyn AuthProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            framed: None,
            remote_host,
            remote_port,
            local_port,
            cluster_name,
            persist_type,
            version: PROTOCOL_VERSION,
            flags,
            timeout,
            auth,
            shutdown,
            identity: None,
            comm_fail_at: None,
        }
    }

    /// Wraps an accepted socket on the daemon side. No receive timeout.
    pub fn from_stream(
        stream: TcpStream,
        flags: ConnFlags,
        auth: Arc<dyn AuthProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (remote_host, remote_port) = match stream.peer_addr() {
            Ok(addr) => (addr.ip().to_string(), addr.port()),
            Err(_) => ("unknown".to_string(), 0),
        };
        Self {
            framed: Some(Framed::new(stream, FrameCodec)),
            remote_host,
            remote_port,
            local_port: 0,
            cluster_name: String::new(),
            persist_type: 0,
            version: PROTOCOL_VERSION,
            flags,
            timeout: None,
            auth,
            shutdown,
            identity: None,
            comm_fail_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Name the peer announced in its init RPC, once established.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn set_cluster_name(&mut self, name: String) {
        self.cluster_name = name;
    }

    /// Authenticated uid of the peer, once established.
    pub fn uid(&self) -> Option<u32> {
        self.identity.as_ref().map(|(_, uid)| *uid)
    }

    /// Transfers the credential from a decoded init RPC into the connection
    /// so later RPCs on the same socket inherit the identity.
    pub fn set_identity(&mut self, credential: Credential, uid: u32) {
        self.identity = Some((credential, uid));
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// True at most once per rate-limit window; used to keep repeated
    /// failures against a dead peer from flooding the logs.
    fn comm_fail_should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.comm_fail_at {
            Some(at) if now.duration_since(at) < COMM_FAIL_LOG_INTERVAL => false,
            _ => {
                self.comm_fail_at = Some(now);
                true
            }
        }
    }

    fn log_connect_failure(&mut self, why: &str) {
        if !self.comm_fail_should_log() {
            return;
        }
        let msg = format!(
            "failed to open persistent connection to {}:{}: {why}",
            self.remote_host, self.remote_port
        );
        if self.flags.contains(ConnFlags::SUPPRESS_ERR) {
            debug!("{msg}");
        } else {
            error!("{msg}");
        }
    }

    /// Connects the socket without running the handshake.
    pub async fn open_without_init(&mut self) -> Result<(), TallydError> {
        self.close();

        let addr = format!("{}:{}", self.remote_host, self.remote_port);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.log_connect_failure(&e.to_string());
                return Err(e.into());
            }
            Err(_) => {
                self.log_connect_failure("connect timed out");
                return Err(TallydError::Timeout);
            }
        };
        stream.set_nodelay(true).ok();
        self.framed = Some(Framed::new(stream, FrameCodec));
        Ok(())
    }

    /// Connects and negotiates: sends the init RPC, adopts the negotiated
    /// version and any granted flags from the reply. The socket is closed
    /// again on any failure.
    pub async fn open(&mut self) -> Result<(), TallydError> {
        self.open_without_init().await?;
        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Closes and opens again, with or without the handshake. Used after a
    /// mid-stream hangup is detected.
    pub async fn reopen(&mut self, with_init: bool) -> Result<(), TallydError> {
        self.close();
        if with_init {
            self.open().await
        } else {
            self.open_without_init().await
        }
    }

    /// Closes the socket and drops the transferred credential.
    pub fn close(&mut self) {
        self.framed = None;
        self.identity = None;
    }

    async fn handshake(&mut self) -> Result<(), TallydError> {
        let init = Message::PersistInit(PersistInitMsg {
            version: PROTOCOL_VERSION,
            cluster_name: self.cluster_name.clone(),
            persist_type: self.persist_type,
            port: self.local_port,
            credential: self.auth.create()?,
        });
        // The init body leads with the proposed version, and the reply is
        // packed at that proposed version, so both layouts are known to
        // both sides before negotiation completes.
        let payload = init.pack(PROTOCOL_VERSION)?;
        self.send_raw(payload).await?;

        let Some(reply) = self.recv_raw().await? else {
            if self.comm_fail_should_log() {
                error!(
                    "no response to connection init from {}:{}",
                    self.remote_host, self.remote_port
                );
            }
            return Err(TallydError::ConnectionClosed);
        };

        let msg = Message::unpack(&reply, PROTOCOL_VERSION)?;
        let Message::PersistRc(rc_msg) = msg else {
            return Err(TallydError::BadResponse(format!(
                "{} in reply to connection init",
                msg.kind()
            )));
        };
        self.finish_negotiation(rc_msg)
    }

    fn finish_negotiation(&mut self, reply: PersistRcMsg) -> Result<(), TallydError> {
        if reply.rc != rc::SUCCESS {
            let comment = reply.comment.as_deref().unwrap_or("(no comment)");
            error!(
                "connection init to {}:{} refused: {comment}",
                self.remote_host, self.remote_port
            );
            return Err(match reply.rc {
                rc::ACCESS_DENIED => TallydError::AccessDenied,
                rc::PROTOCOL_VERSION_ERROR => TallydError::VersionMismatch(reply.ret_info),
                other => TallydError::BadResponse(format!("connection init returned {other}")),
            });
        }
        // ret_info is the version the peer will actually speak on this
        // connection from here on.
        self.version = reply.ret_info;
        self.flags |= ConnFlags::from_bits_truncate(reply.flags);
        Ok(())
    }

    /// Waits until the socket can take a frame, within the write budget.
    async fn conn_writable(&mut self) -> Result<Writability, TallydError> {
        let Self {
            framed, shutdown, ..
        } = self;
        let framed = framed.as_mut().ok_or(TallydError::ConnectionClosed)?;
        let stream = framed.get_ref();
        let deadline = Instant::now() + WRITE_TIMEOUT;

        loop {
            tokio::select! {
                biased;
                res = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if res.is_err() || *shutdown.borrow() {
                        return Err(TallydError::Shutdown);
                    }
                }
                ready = stream.ready(Interest::WRITABLE) => {
                    let ready = ready?;
                    // An orderly close from the peer shows up as read-closed
                    // long before a write would fail.
                    if ready.is_read_closed() || ready.is_write_closed() {
                        return Ok(Writability::HungUp);
                    }
                    if ready.is_writable() {
                        return Ok(Writability::Ready);
                    }
                }
                _ = sleep_until(deadline) => return Ok(Writability::TimedOut),
            }
        }
    }

    async fn send_raw(&mut self, payload: Bytes) -> Result<(), TallydError> {
        let framed = self.framed.as_mut().ok_or(TallydError::ConnectionClosed)?;
        timeout(WRITE_TIMEOUT, framed.send(payload)).await?
    }

    async fn recv_raw(&mut self) -> Result<Option<Bytes>, TallydError> {
        let Self {
            framed,
            shutdown,
            timeout: recv_timeout,
            ..
        } = self;
        let framed = framed.as_mut().ok_or(TallydError::ConnectionClosed)?;
        let deadline = recv_timeout.map(|t| Instant::now() + t);
        let mut next = framed.next();

        loop {
            tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        // Mid-frame shutdown: the partial message is
                        // discarded with the stream.
                        return Ok(None);
                    }
                }
                _ = async {
                    match deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => return Err(TallydError::Timeout),
                res = &mut next => {
                    return match res {
                        None => Ok(None),
                        Some(Ok(payload)) => Ok(Some(payload)),
                        Some(Err(e)) => Err(e),
                    };
                }
            }
        }
    }

    /// Sends one frame. On a detected hangup with `RECONNECT` set, reopens
    /// the connection (full handshake) up to a small attempt budget;
    /// an access-denied result short-circuits the chain.
    pub async fn send_frame(&mut self, payload: &Bytes) -> Result<(), TallydError> {
        if !self.is_open() {
            return Err(TallydError::ConnectionClosed);
        }
        let mut attempts = 0;
        loop {
            // A socket lost to a failed reopen takes the hangup path, so a
            // reconnect that never came back still consumes its turn in
            // the attempt budget.
            let state = if self.is_open() {
                self.conn_writable().await?
            } else {
                Writability::HungUp
            };
            match state {
                Writability::Ready => break,
                Writability::TimedOut => return Err(TallydError::Timeout),
                Writability::HungUp => {
                    if !self.flags.contains(ConnFlags::RECONNECT) {
                        return Err(TallydError::ConnectionClosed);
                    }
                    attempts += 1;
                    if attempts > REOPEN_ATTEMPTS {
                        return Err(TallydError::ConnectionClosed);
                    }
                    match self.reopen(true).await {
                        Ok(()) => {}
                        Err(TallydError::AccessDenied) => return Err(TallydError::AccessDenied),
                        // Leave the rest of the budget to further attempts.
                        Err(_) => {}
                    }
                }
            }
        }
        self.send_raw(payload.clone()).await
    }

    /// Receives one frame. `Ok(None)` is a clean EOF (peer close or local
    /// shutdown). After an abandoned read the socket cannot be trusted for
    /// the next reply, so it is closed, and reopened when `RECONNECT` is
    /// set and no shutdown is in progress.
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, TallydError> {
        match self.recv_raw().await {
            Ok(Some(payload)) => Ok(Some(payload)),
            other => {
                self.close();
                if !self.is_shutdown() && self.flags.contains(ConnFlags::RECONNECT) {
                    let _ = self.reopen(true).await;
                }
                other
            }
        }
    }

    /// One request/response exchange at the negotiated version.
    pub async fn rpc(&mut self, msg: &Message) -> Result<Message, TallydError> {
        let payload = msg.pack(self.version)?;
        self.send_frame(&payload).await?;
        match self.recv_frame().await? {
            Some(reply) => Message::unpack(&reply, self.version),
            None => Err(TallydError::ConnectionClosed),
        }
    }
}
