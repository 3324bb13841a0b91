// src/server/pool.rs

//! The fixed-capacity pool of per-connection service tasks.
//!
//! Callers reserve a slot before spawning a service task and the task
//! releases it on exit, waking one waiting reserver. Capacity is never
//! exceeded; reservations past it wait until a slot frees.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Default cap on concurrently serviced connections.
pub const MAX_SERVICE_CONNS: usize = 100;

enum Slot {
    Empty,
    Reserved,
    Running(JoinHandle<()>),
}

struct SlotTable {
    slots: Vec<Slot>,
    count: usize,
    shutting_down: bool,
    last_over_limit_log: Option<Instant>,
}

struct PoolInner {
    table: Mutex<SlotTable>,
    freed: Notify,
    capacity: usize,
}

/// Cloneable handle to the pool; the accept loop and every service task
/// share one.
#[derive(Clone)]
pub struct ServicePool {
    inner: Arc<PoolInner>,
}

impl ServicePool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::Empty).collect();
        Self {
            inner: Arc::new(PoolInner {
                table: Mutex::new(SlotTable {
                    slots,
                    count: 0,
                    shutting_down: false,
                    last_over_limit_log: None,
                }),
                freed: Notify::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Waits until a slot is free, reserves it, and returns its index.
    /// Returns `None` once the pool is shutting down.
    pub async fn reserve(&self) -> Option<usize> {
        loop {
            {
                let mut table = self.inner.table.lock().await;
                if table.shutting_down {
                    return None;
                }
                if table.count < self.inner.capacity {
                    table.count += 1;
                    let idx = table
                        .slots
                        .iter()
                        .position(|slot| matches!(slot, Slot::Empty))
                        .expect("connection count and slot table out of sync");
                    table.slots[idx] = Slot::Reserved;
                    return Some(idx);
                }
                // This is back-pressure, not an error. It happens when many
                // clients reconnect at once.
                let due = table
                    .last_over_limit_log
                    .is_none_or(|at| at.elapsed() > Duration::from_secs(2));
                if due {
                    table.last_over_limit_log = Some(Instant::now());
                    debug!(
                        "service connection count over limit ({}), waiting",
                        table.count
                    );
                }
            }
            self.inner.freed.notified().await;
        }
    }

    /// Records the spawned task in its reserved slot so shutdown can join
    /// it. A task that already released its slot is left alone.
    pub async fn attach(&self, slot: usize, handle: JoinHandle<()>) {
        let mut table = self.inner.table.lock().await;
        if matches!(table.slots[slot], Slot::Reserved) {
            table.slots[slot] = Slot::Running(handle);
        }
    }

    /// Frees a slot on service-task exit and wakes one waiting reserver.
    /// During shutdown the final drain reclaims everything instead.
    pub async fn release(&self, slot: usize) {
        {
            let mut table = self.inner.table.lock().await;
            if table.shutting_down {
                return;
            }
            if table.count > 0 {
                table.count -= 1;
            } else {
                error!("service connection count underflow");
            }
            table.slots[slot] = Slot::Empty;
        }
        self.inner.freed.notify_one();
    }

    /// Stops admissions and joins every running service task. The table
    /// lock is not held across the joins: a task's exit path takes the same
    /// lock to release its slot.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut table = self.inner.table.lock().await;
            table.shutting_down = true;
            table
                .slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, Slot::Empty) {
                    Slot::Running(handle) => Some(handle),
                    _ => None,
                })
                .collect()
        };
        self.inner.freed.notify_waiters();

        for handle in handles {
            let _ = handle.await;
        }

        self.inner.table.lock().await.count = 0;
    }
}
