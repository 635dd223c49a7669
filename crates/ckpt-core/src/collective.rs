//! Collective barriers for a cooperating group of checkpoint writers
//!
//! Every participating process owns one [`Collective`] handle. A save only
//! commits after every process has passed the same sequence of barriers, and
//! any participant can abort a barrier to fail the save for the whole group.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{BarrierId, Error, Result};

type Outcome = std::result::Result<Option<String>, String>;

/// Failed barrier ids remembered for processes that arrive late
const FAILED_BARRIER_HISTORY: usize = 256;

/// Synchronisation primitive shared by the processes of a group
#[async_trait]
pub trait Collective: Send + Sync {
    /// Rank of this process within the group
    fn process_index(&self) -> usize;

    /// Number of processes in the group
    fn process_count(&self) -> usize;

    /// The leader writes the index and commits
    fn is_leader(&self) -> bool {
        self.process_index() == 0
    }

    /// Wait until every process reaches `barrier_id`
    ///
    /// Returns the payload contributed by the leader to every participant.
    /// Fails with [`Error::BarrierAborted`] if any participant aborted the
    /// barrier and with [`Error::BarrierTimeout`] if the group did not
    /// assemble within `timeout`.
    async fn barrier(
        &self,
        barrier_id: &str,
        leader_payload: Option<String>,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Fail `barrier_id` for every current and future participant
    fn abort(&self, barrier_id: &str, reason: &str);
}

/// Rendezvous state of a single barrier
#[derive(Debug)]
struct BarrierState {
    expected: usize,
    arrived: Vec<usize>,
    leader_payload: Option<String>,
    failure: Option<String>,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

impl BarrierState {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            arrived: Vec::new(),
            leader_payload: None,
            failure: None,
            waiters: Vec::new(),
        }
    }

    /// Record an arrival, returns true if the barrier should be released
    fn arrive(&mut self, process_index: usize) -> bool {
        if !self.arrived.contains(&process_index) {
            self.arrived.push(process_index);
        }
        self.failure.is_none() && self.arrived.len() >= self.expected
    }

    /// Arrival order of a process (1-indexed)
    fn arrival_order(&self, process_index: usize) -> Option<usize> {
        self.arrived
            .iter()
            .position(|&p| p == process_index)
            .map(|pos| pos + 1)
    }
}

/// Barrier table shared by the members of an in-process group
///
/// Only barriers still assembling are tracked. A failed barrier leaves the
/// table at once and its reason is kept in a bounded history, so processes
/// that never arrive do not pin it.
#[derive(Debug)]
pub struct InProcessGroup {
    barriers: DashMap<BarrierId, Arc<Mutex<BarrierState>>>,
    failed: Mutex<VecDeque<(BarrierId, String)>>,
    process_count: usize,
}

impl InProcessGroup {
    /// Create a group of `process_count` members sharing one barrier table
    pub fn new(process_count: usize) -> Vec<GroupMember> {
        let group = Arc::new(Self::with_capacity(process_count.max(1)));
        (0..group.process_count)
            .map(|process_index| GroupMember {
                group: Arc::clone(&group),
                process_index,
            })
            .collect()
    }

    /// A group with a single member, whose barriers release immediately
    pub fn single() -> GroupMember {
        GroupMember {
            group: Arc::new(Self::with_capacity(1)),
            process_index: 0,
        }
    }

    fn with_capacity(process_count: usize) -> Self {
        Self {
            barriers: DashMap::new(),
            failed: Mutex::new(VecDeque::new()),
            process_count,
        }
    }

    /// Number of barriers currently tracked
    pub fn pending_barriers(&self) -> usize {
        self.barriers.len()
    }

    fn slot(&self, barrier_id: &str) -> Arc<Mutex<BarrierState>> {
        self.barriers
            .entry(barrier_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BarrierState::new(self.process_count))))
            .value()
            .clone()
    }

    fn forget(&self, barrier_id: &str, slot: &Arc<Mutex<BarrierState>>) {
        self.barriers
            .remove_if(barrier_id, |_, existing| Arc::ptr_eq(existing, slot));
    }

    /// Record the failure of `barrier_id`, evicting the oldest one past the history limit
    fn record_failure(&self, barrier_id: &str, reason: &str) {
        let mut failed = self.failed.lock();
        if failed.iter().any(|(id, _)| id == barrier_id) {
            return;
        }
        if failed.len() >= FAILED_BARRIER_HISTORY {
            failed.pop_front();
        }
        failed.push_back((barrier_id.to_string(), reason.to_string()));
    }

    fn failure(&self, barrier_id: &str) -> Option<String> {
        self.failed
            .lock()
            .iter()
            .find(|(id, _)| id == barrier_id)
            .map(|(_, reason)| reason.clone())
    }
}

/// One process's handle on an [`InProcessGroup`]
#[derive(Debug, Clone)]
pub struct GroupMember {
    group: Arc<InProcessGroup>,
    process_index: usize,
}

impl GroupMember {
    /// The group this member belongs to
    pub fn group(&self) -> &InProcessGroup {
        &self.group
    }
}

#[async_trait]
impl Collective for GroupMember {
    fn process_index(&self) -> usize {
        self.process_index
    }

    fn process_count(&self) -> usize {
        self.group.process_count
    }

    async fn barrier(
        &self,
        barrier_id: &str,
        leader_payload: Option<String>,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let slot = self.group.slot(barrier_id);

        let rx = {
            let mut state = slot.lock();
            if self.is_leader() {
                state.leader_payload = leader_payload;
            }
            let release = state.arrive(self.process_index);

            debug!(
                barrier_id = %barrier_id,
                process_index = self.process_index,
                arrival_order = ?state.arrival_order(self.process_index),
                expected = state.expected,
                "Process arrived at barrier"
            );

            if let Some(reason) = state.failure.clone().or_else(|| self.group.failure(barrier_id)) {
                self.group.forget(barrier_id, &slot);
                return Err(Error::BarrierAborted {
                    barrier_id: barrier_id.to_string(),
                    reason,
                });
            }

            if release {
                // Last process to arrive - release all waiters
                let payload = state.leader_payload.clone();
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(Ok(payload.clone()));
                }
                self.group.forget(barrier_id, &slot);

                info!(
                    barrier_id = %barrier_id,
                    participants = state.arrived.len(),
                    "Barrier released"
                );
                return Ok(payload);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(reason))) => Err(Error::BarrierAborted {
                barrier_id: barrier_id.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(Error::Internal {
                message: format!("barrier channel closed: {}", barrier_id),
            }),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                self.abort(
                    barrier_id,
                    &format!(
                        "process {} timed out after {}ms",
                        self.process_index, timeout_ms
                    ),
                );
                Err(Error::BarrierTimeout {
                    barrier_id: barrier_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    fn abort(&self, barrier_id: &str, reason: &str) {
        let slot = self.group.slot(barrier_id);
        let mut state = slot.lock();

        if state.failure.is_none() {
            warn!(
                barrier_id = %barrier_id,
                process_index = self.process_index,
                reason = %reason,
                "Aborting barrier"
            );
            state.failure = Some(reason.to_string());
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(reason.to_string()));
            }
        }

        self.group.record_failure(barrier_id, reason);
        self.group.forget(barrier_id, &slot);
    }
}
