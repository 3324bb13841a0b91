// src/agent/queue.rs

//! The outbound FIFO and its back-pressure policy.
//!
//! Any task may produce; exactly one worker consumes. The queue stores
//! packed frame payloads so the purge policy can peek the leading kind
//! code without keeping typed messages alive.

use crate::core::TallydError;
use crate::core::protocol::MessageKind;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Hard capacity of the outbound queue.
pub const MAX_AGENT_QUEUE: usize = 10_000;

/// The half-full warning fires at most once per this interval.
const HIGH_WATER_LOG_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
pub struct AgentQueue {
    entries: VecDeque<Bytes>,
    last_high_water_log: Option<Instant>,
    /// Number of half-full warnings emitted so far.
    pub high_water_logs: u32,
}

impl AgentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Admits one payload under the back-pressure policy: warn at half
    /// capacity, purge re-sendable records at capacity, then admit or
    /// reject.
    pub fn push(&mut self, payload: Bytes) -> Result<(), TallydError> {
        let mut count = self.entries.len();

        if count >= MAX_AGENT_QUEUE / 2 {
            let now = Instant::now();
            let due = self
                .last_high_water_log
                .is_none_or(|at| now.duration_since(at) >= HIGH_WATER_LOG_INTERVAL);
            if due {
                self.last_high_water_log = Some(now);
                self.high_water_logs += 1;
                error!("agent queue filling, RESTART THE ACCOUNTING DAEMON NOW");
            }
        }

        if count == MAX_AGENT_QUEUE - 1 {
            count -= self.purge_restartable();
        }

        if count < MAX_AGENT_QUEUE {
            self.entries.push_back(payload);
            Ok(())
        } else {
            error!("agent queue is full, discarding request");
            Err(TallydError::QueueFull)
        }
    }

    /// Re-enqueues a payload recovered from the spill file, bypassing the
    /// admission policy.
    pub fn restore(&mut self, payload: Bytes) {
        self.entries.push_back(payload);
    }

    /// Drops every queued job-start and step-start record; the controller
    /// can rebuild those from its own state. Survivors keep their relative
    /// order. Returns the number removed.
    pub fn purge_restartable(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|payload| !MessageKind::peek(payload).is_some_and(|k| k.is_restartable()));
        let purged = before - self.entries.len();
        info!("purged {purged} job/step start records");
        purged
    }

    /// The head of the queue, left in place until its delivery is
    /// acknowledged.
    pub fn peek_front(&self) -> Option<Bytes> {
        self.entries.front().cloned()
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.entries.pop_front()
    }

    /// Empties the queue for the shutdown spill.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.entries.drain(..).collect()
    }
}
