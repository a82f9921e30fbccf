// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Weighted bounded-concurrency admission.
//!
//! Each task declares a resource vector; the scheduler admits it only when
//! the running set's sum plus the candidate fits the configured caps.
//! Waiting suspends the task's future; a task must never hold a permit
//! while awaiting admission of its subtasks, which the engine guarantees by
//! issuing phases in waves.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A task's declared resource demand, or the scheduler's caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResourceAmounts {
    pub cpu: u32,
    pub memory: u32,
    pub disk_io: u32,
    pub network_io: u32,
}

impl ResourceAmounts {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn cpu(n: u32) -> Self {
        Self {
            cpu: n,
            ..Self::default()
        }
    }

    pub fn disk(n: u32) -> Self {
        Self {
            disk_io: n,
            ..Self::default()
        }
    }

    pub fn network(n: u32) -> Self {
        Self {
            network_io: n,
            ..Self::default()
        }
    }

    /// Whether `self` on top of `used` still fits under `caps`.
    fn fits(&self, used: &Self, caps: &Self) -> bool {
        used.cpu + self.cpu <= caps.cpu
            && used.memory + self.memory <= caps.memory
            && used.disk_io + self.disk_io <= caps.disk_io
            && used.network_io + self.network_io <= caps.network_io
    }

    /// Element-wise minimum, so an oversized demand can still admit alone.
    fn clamped_to(&self, caps: &Self) -> Self {
        Self {
            cpu: self.cpu.min(caps.cpu),
            memory: self.memory.min(caps.memory),
            disk_io: self.disk_io.min(caps.disk_io),
            network_io: self.network_io.min(caps.network_io),
        }
    }

    fn add(&mut self, other: &Self) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.disk_io += other.disk_io;
        self.network_io += other.network_io;
    }

    fn sub(&mut self, other: &Self) {
        self.cpu = self.cpu.saturating_sub(other.cpu);
        self.memory = self.memory.saturating_sub(other.memory);
        self.disk_io = self.disk_io.saturating_sub(other.disk_io);
        self.network_io = self.network_io.saturating_sub(other.network_io);
    }
}

/// How waiters are admitted as capacity frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Strict FIFO; a large waiter at the head blocks smaller ones behind it.
    #[default]
    Fair,
    /// Any waiter that fits is admitted, possibly jumping the queue.
    Unfair,
}

struct Waiter {
    amounts: ResourceAmounts,
    tx: oneshot::Sender<()>,
}

struct SchedState {
    used: ResourceAmounts,
    queue: VecDeque<Waiter>,
}

/// Weighted bounded-concurrency pool; see the module docs.
pub struct WeightedScheduler {
    caps: ResourceAmounts,
    policy: QueuePolicy,
    state: Mutex<SchedState>,
}

impl WeightedScheduler {
    pub fn new(caps: ResourceAmounts, policy: QueuePolicy) -> Self {
        Self {
            caps,
            policy,
            state: Mutex::new(SchedState {
                used: ResourceAmounts::zero(),
                queue: VecDeque::new(),
            }),
        }
    }

    /// Caps sized to the host: one cpu/memory/disk unit per core, twice as
    /// many in-flight network operations.
    pub fn for_host() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self::new(
            ResourceAmounts {
                cpu: cores,
                memory: cores,
                disk_io: cores,
                network_io: cores * 2,
            },
            QueuePolicy::default(),
        )
    }

    /// Suspend until the demand fits, then hold it until the permit drops.
    pub async fn acquire(self: Arc<Self>, amounts: ResourceAmounts) -> Permit {
        let amounts = amounts.clamped_to(&self.caps);
        let waiting = {
            let mut state = self.state.lock();
            let may_admit_now = match self.policy {
                QueuePolicy::Fair => state.queue.is_empty(),
                QueuePolicy::Unfair => true,
            };
            if may_admit_now && amounts.fits(&state.used, &self.caps) {
                state.used.add(&amounts);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter { amounts, tx });
                Some(rx)
            }
        };
        if let Some(rx) = waiting {
            // An error here means the scheduler itself went away; there is
            // nothing left to throttle against.
            let _ = rx.await;
        }
        Permit {
            scheduler: self,
            amounts,
        }
    }

    fn release(&self, amounts: &ResourceAmounts) {
        let mut state = self.state.lock();
        state.used.sub(amounts);
        match self.policy {
            QueuePolicy::Fair => {
                while let Some(front) = state.queue.front() {
                    if !front.amounts.fits(&state.used, &self.caps) {
                        break;
                    }
                    if let Some(waiter) = state.queue.pop_front() {
                        Self::admit(&mut state, waiter);
                    }
                }
            }
            QueuePolicy::Unfair => {
                let mut i = 0;
                while i < state.queue.len() {
                    let fits = state
                        .queue
                        .get(i)
                        .map(|w| w.amounts.fits(&state.used, &self.caps))
                        .unwrap_or(false);
                    if fits {
                        if let Some(waiter) = state.queue.remove(i) {
                            Self::admit(&mut state, waiter);
                        }
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }

    fn admit(state: &mut SchedState, waiter: Waiter) {
        state.used.add(&waiter.amounts);
        // The waiter's future may have been dropped; give its share back.
        if waiter.tx.send(()).is_err() {
            state.used.sub(&waiter.amounts);
        }
    }

    /// Current admitted demand, for diagnostics.
    pub fn in_use(&self) -> ResourceAmounts {
        self.state.lock().used
    }
}

/// Held resources; released on drop.
pub struct Permit {
    scheduler: Arc<WeightedScheduler>,
    amounts: ResourceAmounts,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.scheduler.release(&self.amounts);
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
