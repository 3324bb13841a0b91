// src/server/store.rs

//! The daemon's in-memory bookkeeping store: the [`ServiceHandler`] that
//! applies accounting records arriving over persistent connections.

use super::dispatch::{Dispatch, ServiceHandler};
use crate::connection::PersistConn;
use crate::core::protocol::message::{GotJobsMsg, JobStartRcMsg, RcMsg};
use crate::core::protocol::{Message, rc};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub db_index: u32,
    pub job_id: u32,
    pub job_state: u16,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub submit_time: u64,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub exit_code: Option<u32>,
    pub total_procs: u32,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub db_index: u32,
    pub job_id: u32,
    pub step_id: u32,
    pub name: Option<String>,
    pub start_time: u64,
    pub end_time: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub proc_count: u32,
    pub last_event_time: u64,
}

/// In-memory accounting state. A real deployment would put a SQL storage
/// plugin behind this trait; the daemon itself only needs the handler
/// contract.
#[derive(Default)]
pub struct MemStore {
    jobs: Mutex<HashMap<u32, JobRecord>>,
    steps: Mutex<HashMap<(u32, u32), StepRecord>>,
    clusters: Mutex<HashMap<String, ClusterInfo>>,
    next_db_index: AtomicU32,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            next_db_index: AtomicU32::new(1),
            ..Self::default()
        }
    }

    pub fn job(&self, job_id: u32) -> Option<JobRecord> {
        self.jobs.lock().get(&job_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    fn ok() -> Dispatch {
        Dispatch::new(rc::SUCCESS, Some(Message::Rc(RcMsg { rc: rc::SUCCESS })))
    }
}

#[async_trait]
impl ServiceHandler for MemStore {
    async fn on_message(&self, _conn: &PersistConn, msg: &Message, uid: Option<u32>) -> Dispatch {
        match msg {
            Message::ClusterProcs(m) => {
                let name = m.cluster_name.clone().unwrap_or_default();
                let mut clusters = self.clusters.lock();
                let first_registration = !clusters.contains_key(&name);
                clusters.insert(
                    name.clone(),
                    ClusterInfo {
                        proc_count: m.proc_count,
                        last_event_time: m.event_time,
                    },
                );
                if first_registration {
                    info!("first registration of cluster {name:?} with {} procs", m.proc_count);
                    Dispatch::new(
                        rc::FIRST_REGISTRATION,
                        Some(Message::Rc(RcMsg { rc: rc::SUCCESS })),
                    )
                } else {
                    Self::ok()
                }
            }

            Message::NodeState(m) => {
                debug!(
                    "node state change: hosts {:?} -> {} ({:?})",
                    m.hostlist, m.new_state, m.reason
                );
                Dispatch::new(
                    rc::NODES_CHANGED,
                    Some(Message::Rc(RcMsg { rc: rc::SUCCESS })),
                )
            }

            Message::JobStart(m) => {
                let mut jobs = self.jobs.lock();
                let db_index = match jobs.get(&m.job_id) {
                    // A resent start for a job we already indexed keeps its
                    // assignment; duplicates are expected after restarts.
                    Some(existing) => existing.db_index,
                    None => self.next_db_index.fetch_add(1, Ordering::Relaxed),
                };
                jobs.insert(
                    m.job_id,
                    JobRecord {
                        db_index,
                        job_id: m.job_id,
                        job_state: m.job_state,
                        name: m.name.clone(),
                        nodes: m.nodes.clone(),
                        submit_time: m.submit_time,
                        start_time: m.start_time,
                        end_time: None,
                        exit_code: None,
                        total_procs: m.total_procs,
                    },
                );
                Dispatch::new(
                    rc::SUCCESS,
                    Some(Message::JobStartRc(JobStartRcMsg {
                        db_index,
                        rc: rc::SUCCESS,
                    })),
                )
            }

            Message::JobComplete(m) => {
                let mut jobs = self.jobs.lock();
                match jobs.get_mut(&m.job_id) {
                    Some(job) => {
                        job.job_state = m.job_state;
                        job.end_time = Some(m.end_time);
                        job.exit_code = Some(m.exit_code);
                    }
                    None => warn!("completion for unknown job {}", m.job_id),
                }
                Self::ok()
            }

            Message::JobSuspend(m) => {
                if let Some(job) = self.jobs.lock().get_mut(&m.job_id) {
                    job.job_state = m.job_state;
                }
                Self::ok()
            }

            Message::StepStart(m) => {
                self.steps.lock().insert(
                    (m.job_id, m.step_id),
                    StepRecord {
                        db_index: m.db_index,
                        job_id: m.job_id,
                        step_id: m.step_id,
                        name: m.name.clone(),
                        start_time: m.start_time,
                        end_time: None,
                    },
                );
                Self::ok()
            }

            Message::StepComplete(m) => {
                if let Some(step) = self.steps.lock().get_mut(&(m.job_id, m.step_id)) {
                    step.end_time = Some(m.end_time);
                }
                Self::ok()
            }

            Message::GetJobs(_) => {
                let mut job_ids: Vec<u32> = self.jobs.lock().keys().copied().collect();
                job_ids.sort_unstable();
                Dispatch::new(
                    rc::SUCCESS,
                    Some(Message::GotJobs(GotJobsMsg { job_ids })),
                )
            }

            // Reply kinds and init RPCs have no business arriving here.
            other => {
                warn!(
                    "unexpected {} message from uid {uid:?}",
                    other.kind()
                );
                Dispatch::new(rc::EINVAL, Some(Message::Rc(RcMsg { rc: rc::EINVAL })))
            }
        }
    }

    async fn on_finish(&self, cluster_name: &str) {
        debug!("persistent connection from cluster {cluster_name:?} has disconnected");
    }
}
