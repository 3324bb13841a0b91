// src/core/protocol/message.rs

//! The closed catalogue of RPC messages exchanged over a persistent
//! connection, and the version-aware pack/unpack pair for each kind.
//!
//! Every frame payload starts with the 2-byte kind code; the rest is the
//! kind-specific body. Bodies allocate owned strings and vectors during
//! unpack, so an `Err` part-way through simply drops whatever was taken
//! from the buffer so far.

use super::buffer::PackBuf;
use super::{MIN_PROTOCOL_VERSION, RC_FLAGS_VERSION};
use crate::core::TallydError;
use crate::core::auth::Credential;
use bytes::Bytes;
use strum_macros::Display;

/// Numeric code for every message kind. Accounting records live in the
/// 1400 block, persistent-connection control in the 6500 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u16)]
pub enum MessageKind {
    /// Deprecated first-RPC alias still accepted by the handshake gate.
    LegacyInit = 1400,
    Rc = 1401,
    ClusterProcs = 1402,
    GetJobs = 1403,
    GotJobs = 1404,
    JobComplete = 1405,
    JobStart = 1406,
    JobStartRc = 1407,
    JobSuspend = 1408,
    NodeState = 1409,
    StepComplete = 1410,
    StepStart = 1411,
    PersistInit = 6500,
    PersistRc = 6501,
}

impl MessageKind {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use MessageKind::*;
        Some(match code {
            1400 => LegacyInit,
            1401 => Rc,
            1402 => ClusterProcs,
            1403 => GetJobs,
            1404 => GotJobs,
            1405 => JobComplete,
            1406 => JobStart,
            1407 => JobStartRc,
            1408 => JobSuspend,
            1409 => NodeState,
            1410 => StepComplete,
            1411 => StepStart,
            6500 => PersistInit,
            6501 => PersistRc,
            _ => return None,
        })
    }

    /// Reads the kind code off the front of a packed payload without
    /// consuming it. Used by the agent's purge policy.
    pub fn peek(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        Self::from_code(u16::from_be_bytes([payload[0], payload[1]]))
    }

    /// True for record kinds the controller can rebuild from its own state
    /// and therefore safely drop when the queue threatens to overflow.
    pub fn is_restartable(self) -> bool {
        matches!(self, MessageKind::JobStart | MessageKind::StepStart)
    }
}

/// Handshake request. Always the first frame on a persistent connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistInitMsg {
    /// Sender's protocol version; packed first, unconditionally, so the
    /// receiver can decide how to interpret the rest of the body.
    pub version: u16,
    /// May be empty, never NULL.
    pub cluster_name: String,
    /// Caller-defined connection tag.
    pub persist_type: u16,
    /// Sender's listening port, 0 if none.
    pub port: u16,
    /// Opaque credential produced by the auth provider.
    pub credential: Credential,
}

/// Handshake / generic error reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistRcMsg {
    pub comment: Option<String>,
    /// Connection flag bits granted by the peer. On the wire only from
    /// `RC_FLAGS_VERSION`; defaults to zero below that.
    pub flags: u16,
    pub rc: i32,
    /// Carries the responder's actual protocol version on success.
    pub ret_info: u16,
}

/// Plain acknowledgement carrying a return code.
#[derive(Debug, Clone, PartialEq)]
pub struct RcMsg {
    pub rc: i32,
}

/// Cluster processor-count report.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProcsMsg {
    pub cluster_name: Option<String>,
    pub proc_count: u32,
    pub event_time: u64,
}

/// Query for recorded jobs, optionally narrowed by partition.
#[derive(Debug, Clone, PartialEq)]
pub struct GetJobsMsg {
    pub cluster_name: Option<String>,
    pub partitions: Vec<String>,
}

/// Reply to [`GetJobsMsg`].
#[derive(Debug, Clone, PartialEq)]
pub struct GotJobsMsg {
    pub job_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobCompleteMsg {
    pub assoc_id: u32,
    pub db_index: u32,
    pub end_time: u64,
    pub exit_code: u32,
    pub job_id: u32,
    pub job_state: u16,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub priority: u32,
    pub start_time: u64,
    pub submit_time: u64,
    pub total_procs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStartMsg {
    pub assoc_id: u32,
    pub block_id: Option<String>,
    pub eligible_time: u64,
    pub job_id: u32,
    pub job_state: u16,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub priority: u32,
    pub start_time: u64,
    pub submit_time: u64,
    pub total_procs: u32,
}

/// Reply to [`JobStartMsg`] carrying the database index assigned to the job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStartRcMsg {
    pub db_index: u32,
    pub rc: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSuspendMsg {
    pub assoc_id: u32,
    pub db_index: u32,
    pub job_id: u32,
    pub job_state: u16,
    pub submit_time: u64,
    pub suspend_time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStateMsg {
    pub cluster_name: Option<String>,
    pub hostlist: Option<String>,
    pub reason: Option<String>,
    pub new_state: u16,
    pub event_time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepCompleteMsg {
    pub assoc_id: u32,
    pub db_index: u32,
    pub end_time: u64,
    pub job_id: u32,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub req_uid: u32,
    pub start_time: u64,
    pub job_submit_time: u64,
    pub step_id: u32,
    pub total_procs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepStartMsg {
    pub assoc_id: u32,
    pub db_index: u32,
    pub job_id: u32,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub req_uid: u32,
    pub start_time: u64,
    pub step_id: u32,
    pub total_procs: u32,
}

/// Body of the deprecated init RPC: version plus credential, nothing else.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyInitMsg {
    pub version: u16,
    pub credential: Credential,
}

/// One RPC message: kind plus kind-specific body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    LegacyInit(LegacyInitMsg),
    Rc(RcMsg),
    ClusterProcs(ClusterProcsMsg),
    GetJobs(GetJobsMsg),
    GotJobs(GotJobsMsg),
    JobComplete(JobCompleteMsg),
    JobStart(JobStartMsg),
    JobStartRc(JobStartRcMsg),
    JobSuspend(JobSuspendMsg),
    NodeState(NodeStateMsg),
    StepComplete(StepCompleteMsg),
    StepStart(StepStartMsg),
    PersistInit(PersistInitMsg),
    PersistRc(PersistRcMsg),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::LegacyInit(_) => MessageKind::LegacyInit,
            Message::Rc(_) => MessageKind::Rc,
            Message::ClusterProcs(_) => MessageKind::ClusterProcs,
            Message::GetJobs(_) => MessageKind::GetJobs,
            Message::GotJobs(_) => MessageKind::GotJobs,
            Message::JobComplete(_) => MessageKind::JobComplete,
            Message::JobStart(_) => MessageKind::JobStart,
            Message::JobStartRc(_) => MessageKind::JobStartRc,
            Message::JobSuspend(_) => MessageKind::JobSuspend,
            Message::NodeState(_) => MessageKind::NodeState,
            Message::StepComplete(_) => MessageKind::StepComplete,
            Message::StepStart(_) => MessageKind::StepStart,
            Message::PersistInit(_) => MessageKind::PersistInit,
            Message::PersistRc(_) => MessageKind::PersistRc,
        }
    }

    /// Packs the kind code and body into one frame payload.
    pub fn pack(&self, version: u16) -> Result<Bytes, TallydError> {
        let mut buf = PackBuf::with_capacity(256);
        buf.pack_u16(self.kind().code());
        match self {
            Message::LegacyInit(m) => m.pack(&mut buf),
            Message::Rc(m) => m.pack(&mut buf),
            Message::ClusterProcs(m) => m.pack(&mut buf),
            Message::GetJobs(m) => m.pack(&mut buf),
            Message::GotJobs(m) => m.pack(&mut buf),
            Message::JobComplete(m) => m.pack(&mut buf),
            Message::JobStart(m) => m.pack(&mut buf),
            Message::JobStartRc(m) => m.pack(&mut buf),
            Message::JobSuspend(m) => m.pack(&mut buf),
            Message::NodeState(m) => m.pack(&mut buf),
            Message::StepComplete(m) => m.pack(&mut buf),
            Message::StepStart(m) => m.pack(&mut buf),
            Message::PersistInit(m) => m.pack(&mut buf),
            Message::PersistRc(m) => m.pack(&mut buf, version),
        }
        Ok(buf.into_bytes())
    }

    /// Unpacks one frame payload. The error carries the kind name so a
    /// dispatcher can answer "Failed to unpack <kind>".
    pub fn unpack(payload: &[u8], version: u16) -> Result<Message, TallydError> {
        let mut buf = PackBuf::from_bytes(payload);
        let code = buf.unpack_u16()?;
        let kind = MessageKind::from_code(code)
            .ok_or_else(|| TallydError::Unpack(format!("unknown kind {code}")))?;

        let msg = match kind {
            MessageKind::LegacyInit => Message::LegacyInit(LegacyInitMsg::unpack(&mut buf)?),
            MessageKind::Rc => Message::Rc(RcMsg::unpack(&mut buf)?),
            MessageKind::ClusterProcs => Message::ClusterProcs(ClusterProcsMsg::unpack(&mut buf)?),
            MessageKind::GetJobs => Message::GetJobs(GetJobsMsg::unpack(&mut buf)?),
            MessageKind::GotJobs => Message::GotJobs(GotJobsMsg::unpack(&mut buf)?),
            MessageKind::JobComplete => Message::JobComplete(JobCompleteMsg::unpack(&mut buf)?),
            MessageKind::JobStart => Message::JobStart(JobStartMsg::unpack(&mut buf)?),
            MessageKind::JobStartRc => Message::JobStartRc(JobStartRcMsg::unpack(&mut buf)?),
            MessageKind::JobSuspend => Message::JobSuspend(JobSuspendMsg::unpack(&mut buf)?),
            MessageKind::NodeState => Message::NodeState(NodeStateMsg::unpack(&mut buf)?),
            MessageKind::StepComplete => Message::StepComplete(StepCompleteMsg::unpack(&mut buf)?),
            MessageKind::StepStart => Message::StepStart(StepStartMsg::unpack(&mut buf)?),
            MessageKind::PersistInit => Message::PersistInit(PersistInitMsg::unpack(&mut buf)?),
            MessageKind::PersistRc => Message::PersistRc(PersistRcMsg::unpack(&mut buf, version)?),
        };
        Ok(msg)
    }
}

impl PersistInitMsg {
    fn pack(&self, buf: &mut PackBuf) {
        // The version field leads, unconditionally, so a receiver on any
        // release can interpret the remainder.
        buf.pack_u16(self.version);
        buf.pack_str(Some(&self.cluster_name));
        buf.pack_u16(self.persist_type);
        buf.pack_u16(self.port);
        self.credential.pack(buf);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        let version = buf.unpack_u16()?;
        if version < MIN_PROTOCOL_VERSION {
            return Err(TallydError::VersionMismatch(version));
        }
        Ok(Self {
            version,
            cluster_name: buf.unpack_str()?.unwrap_or_default(),
            persist_type: buf.unpack_u16()?,
            port: buf.unpack_u16()?,
            credential: Credential::unpack(buf)?,
        })
    }
}

impl PersistRcMsg {
    fn pack(&self, buf: &mut PackBuf, version: u16) {
        buf.pack_str(self.comment.as_deref());
        if version >= RC_FLAGS_VERSION {
            buf.pack_u16(self.flags);
        }
        buf.pack_u32(self.rc as u32);
        buf.pack_u16(self.ret_info);
    }

    fn unpack(buf: &mut PackBuf, version: u16) -> Result<Self, TallydError> {
        let comment = buf.unpack_str()?;
        let flags = if version >= RC_FLAGS_VERSION {
            buf.unpack_u16()?
        } else {
            0
        };
        Ok(Self {
            comment,
            flags,
            rc: buf.unpack_u32()? as i32,
            ret_info: buf.unpack_u16()?,
        })
    }
}

impl RcMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.rc as u32);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            rc: buf.unpack_u32()? as i32,
        })
    }
}

impl ClusterProcsMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_str(self.cluster_name.as_deref());
        buf.pack_u32(self.proc_count);
        buf.pack_time(self.event_time);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            cluster_name: buf.unpack_str()?,
            proc_count: buf.unpack_u32()?,
            event_time: buf.unpack_time()?,
        })
    }
}

impl GetJobsMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_str(self.cluster_name.as_deref());
        buf.pack_str_array(&self.partitions);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            cluster_name: buf.unpack_str()?,
            partitions: buf.unpack_str_array()?,
        })
    }
}

impl GotJobsMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_ids.len() as u32);
        for id in &self.job_ids {
            buf.pack_u32(*id);
        }
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        let count = buf.unpack_u32()? as usize;
        if count.saturating_mul(4) > buf.remaining() {
            return Err(TallydError::UnpackShort);
        }
        let mut job_ids = Vec::with_capacity(count);
        for _ in 0..count {
            job_ids.push(buf.unpack_u32()?);
        }
        Ok(Self { job_ids })
    }
}

impl JobCompleteMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.assoc_id);
        buf.pack_u32(self.db_index);
        buf.pack_time(self.end_time);
        buf.pack_u32(self.exit_code);
        buf.pack_u32(self.job_id);
        buf.pack_u16(self.job_state);
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.nodes.as_deref());
        buf.pack_u32(self.priority);
        buf.pack_time(self.start_time);
        buf.pack_time(self.submit_time);
        buf.pack_u32(self.total_procs);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            assoc_id: buf.unpack_u32()?,
            db_index: buf.unpack_u32()?,
            end_time: buf.unpack_time()?,
            exit_code: buf.unpack_u32()?,
            job_id: buf.unpack_u32()?,
            job_state: buf.unpack_u16()?,
            name: buf.unpack_str()?,
            nodes: buf.unpack_str()?,
            priority: buf.unpack_u32()?,
            start_time: buf.unpack_time()?,
            submit_time: buf.unpack_time()?,
            total_procs: buf.unpack_u32()?,
        })
    }
}

impl JobStartMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.assoc_id);
        buf.pack_str(self.block_id.as_deref());
        buf.pack_time(self.eligible_time);
        buf.pack_u32(self.job_id);
        buf.pack_u16(self.job_state);
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.nodes.as_deref());
        buf.pack_u32(self.priority);
        buf.pack_time(self.start_time);
        buf.pack_time(self.submit_time);
        buf.pack_u32(self.total_procs);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            assoc_id: buf.unpack_u32()?,
            block_id: buf.unpack_str()?,
            eligible_time: buf.unpack_time()?,
            job_id: buf.unpack_u32()?,
            job_state: buf.unpack_u16()?,
            name: buf.unpack_str()?,
            nodes: buf.unpack_str()?,
            priority: buf.unpack_u32()?,
            start_time: buf.unpack_time()?,
            submit_time: buf.unpack_time()?,
            total_procs: buf.unpack_u32()?,
        })
    }
}

impl JobStartRcMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.db_index);
        buf.pack_u32(self.rc as u32);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            db_index: buf.unpack_u32()?,
            rc: buf.unpack_u32()? as i32,
        })
    }
}

impl JobSuspendMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.assoc_id);
        buf.pack_u32(self.db_index);
        buf.pack_u32(self.job_id);
        buf.pack_u16(self.job_state);
        buf.pack_time(self.submit_time);
        buf.pack_time(self.suspend_time);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            assoc_id: buf.unpack_u32()?,
            db_index: buf.unpack_u32()?,
            job_id: buf.unpack_u32()?,
            job_state: buf.unpack_u16()?,
            submit_time: buf.unpack_time()?,
            suspend_time: buf.unpack_time()?,
        })
    }
}

impl NodeStateMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_str(self.cluster_name.as_deref());
        buf.pack_str(self.hostlist.as_deref());
        buf.pack_str(self.reason.as_deref());
        buf.pack_u16(self.new_state);
        buf.pack_time(self.event_time);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            cluster_name: buf.unpack_str()?,
            hostlist: buf.unpack_str()?,
            reason: buf.unpack_str()?,
            new_state: buf.unpack_u16()?,
            event_time: buf.unpack_time()?,
        })
    }
}

impl StepCompleteMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.assoc_id);
        buf.pack_u32(self.db_index);
        buf.pack_time(self.end_time);
        buf.pack_u32(self.job_id);
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.nodes.as_deref());
        buf.pack_u32(self.req_uid);
        buf.pack_time(self.start_time);
        buf.pack_time(self.job_submit_time);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.total_procs);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            assoc_id: buf.unpack_u32()?,
            db_index: buf.unpack_u32()?,
            end_time: buf.unpack_time()?,
            job_id: buf.unpack_u32()?,
            name: buf.unpack_str()?,
            nodes: buf.unpack_str()?,
            req_uid: buf.unpack_u32()?,
            start_time: buf.unpack_time()?,
            job_submit_time: buf.unpack_time()?,
            step_id: buf.unpack_u32()?,
            total_procs: buf.unpack_u32()?,
        })
    }
}

impl StepStartMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.assoc_id);
        buf.pack_u32(self.db_index);
        buf.pack_u32(self.job_id);
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.nodes.as_deref());
        buf.pack_u32(self.req_uid);
        buf.pack_time(self.start_time);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.total_procs);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            assoc_id: buf.unpack_u32()?,
            db_index: buf.unpack_u32()?,
            job_id: buf.unpack_u32()?,
            name: buf.unpack_str()?,
            nodes: buf.unpack_str()?,
            req_uid: buf.unpack_u32()?,
            start_time: buf.unpack_time()?,
            step_id: buf.unpack_u32()?,
            total_procs: buf.unpack_u32()?,
        })
    }
}

impl LegacyInitMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.version);
        self.credential.pack(buf);
    }

    fn unpack(buf: &mut PackBuf) -> Result<Self, TallydError> {
        Ok(Self {
            version: buf.unpack_u16()?,
            credential: Credential::unpack(buf)?,
        })
    }
}
