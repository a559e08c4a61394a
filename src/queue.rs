//! Job buckets and per-worker dispatch lists.
//!
//! Everything here is guarded by the scheduler's queue lock. Workers search
//! these lists and go to sleep under that same lock, so a producer that
//! pushes and then wakes can never be missed.

use crate::affinity::{MAX_WORKERS, WorkerId, WorkerMask};
use crate::fiber::FiberId;
use crate::handle::JobHandle;
use crate::job::PRIORITY_COUNT;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A fiber that gave up its worker for a bounded interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeriodicFiber {
    pub(crate) fiber: FiberId,
    pub(crate) deadline: Instant,
}

type Buckets = [Vec<JobHandle>; PRIORITY_COUNT];

pub(crate) struct JobQueues {
    /// Posted jobs by exact affinity mask, one LIFO stack per priority.
    buckets: BTreeMap<u64, Buckets>,
    /// Jobs set aside for one worker by `yield_poll`. LIFO.
    pending: Vec<Vec<JobHandle>>,
    /// Suspended fibers whose wait is over, per owning worker. LIFO, like
    /// the job buckets.
    ready: Vec<Vec<FiberId>>,
    periodic: Vec<Option<PeriodicFiber>>,
    queued: usize,
}

impl JobQueues {
    pub(crate) fn new() -> Self {
        JobQueues {
            buckets: BTreeMap::new(),
            pending: (0..MAX_WORKERS).map(|_| Vec::new()).collect(),
            ready: (0..MAX_WORKERS).map(|_| Vec::new()).collect(),
            periodic: vec![None; MAX_WORKERS],
            queued: 0,
        }
    }

    pub(crate) fn push_job(&mut self, handle: JobHandle) {
        let mask = handle.worker_mask().bits();
        let priority = handle.priority().index();
        self.buckets.entry(mask).or_default()[priority].push(handle);
        self.queued += 1;
    }

    /// Pops the most urgent job `worker` may run: lowest priority value
    /// first, most recently posted first within a bucket.
    pub(crate) fn pop_job(&mut self, worker: WorkerId) -> Option<JobHandle> {
        for priority in 0..PRIORITY_COUNT {
            for (&mask, stacks) in self.buckets.iter_mut() {
                if !WorkerMask(mask).contains(worker) {
                    continue;
                }
                if let Some(handle) = stacks[priority].pop() {
                    self.queued -= 1;
                    return Some(handle);
                }
            }
        }
        None
    }

    pub(crate) fn has_job_ready(&self, worker: WorkerId) -> bool {
        self.buckets
            .iter()
            .filter(|(mask, _)| WorkerMask(**mask).contains(worker))
            .any(|(_, stacks)| stacks.iter().any(|s| !s.is_empty()))
    }

    /// Jobs waiting in the global buckets.
    pub(crate) fn queued(&self) -> usize {
        self.queued
    }

    pub(crate) fn pop_pending(&mut self, worker: WorkerId) -> Option<JobHandle> {
        self.pending[worker.index()].pop()
    }

    /// Moves the next global job for `worker` into its pending-local list.
    pub(crate) fn push_pending_from_global(&mut self, worker: WorkerId) -> bool {
        match self.pop_job(worker) {
            Some(handle) => {
                self.pending[worker.index()].push(handle);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_ready(&mut self, worker: WorkerId, fiber: FiberId) {
        self.ready[worker.index()].push(fiber);
    }

    pub(crate) fn pop_ready(&mut self, worker: WorkerId) -> Option<FiberId> {
        self.ready[worker.index()].pop()
    }

    pub(crate) fn set_periodic(&mut self, worker: WorkerId, periodic: PeriodicFiber) {
        let slot = &mut self.periodic[worker.index()];
        assert!(
            slot.is_none(),
            "worker {} already has a periodic fiber",
            worker
        );
        *slot = Some(periodic);
    }

    /// Takes the worker's periodic fiber if its deadline has passed.
    pub(crate) fn take_due_periodic(&mut self, worker: WorkerId, now: Instant) -> Option<FiberId> {
        let slot = &mut self.periodic[worker.index()];
        match *slot {
            Some(periodic) if periodic.deadline <= now => {
                *slot = None;
                Some(periodic.fiber)
            }
            _ => None,
        }
    }

    /// Time until the worker's periodic fiber is due.
    pub(crate) fn periodic_remaining(&self, worker: WorkerId, now: Instant) -> Option<Duration> {
        self.periodic[worker.index()].map(|p| p.deadline.saturating_duration_since(now))
    }

    /// Empties every list and returns the jobs that never ran.
    pub(crate) fn clear(&mut self) -> Vec<JobHandle> {
        let mut dropped = Vec::with_capacity(self.queued);
        for (_, stacks) in std::mem::take(&mut self.buckets) {
            for stack in stacks {
                dropped.extend(stack);
            }
        }
        for pending in &mut self.pending {
            dropped.extend(pending.drain(..));
        }
        self.ready.iter_mut().for_each(Vec::clear);
        self.periodic.iter_mut().for_each(|p| *p = None);
        self.queued = 0;
        dropped
    }
}
