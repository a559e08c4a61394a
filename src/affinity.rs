//! Worker identities and affinity masks.
//!
//! Every worker owns one bit of a 64-bit mask. The first eight workers have
//! fixed roles; a job's mask selects which of them may run it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Fewest workers the scheduler will start (one per fixed role).
pub const MIN_WORKERS: usize = 8;
/// Most workers the scheduler can address (mask width).
pub const MAX_WORKERS: usize = 64;

/// Fixed roles of the first [`MIN_WORKERS`] workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerRole {
    Main = 0,
    Render,
    Compute,
    Io1,
    Io2,
    Shared1,
    Shared2,
    Shared3,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; MIN_WORKERS] = [
        WorkerRole::Main,
        WorkerRole::Render,
        WorkerRole::Compute,
        WorkerRole::Io1,
        WorkerRole::Io2,
        WorkerRole::Shared1,
        WorkerRole::Shared2,
        WorkerRole::Shared3,
    ];

    pub fn id(self) -> WorkerId {
        WorkerId(self as u32)
    }

    pub fn mask(self) -> WorkerMask {
        self.id().mask()
    }
}

/// Stable numeric identity of a worker thread, `0..64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub fn new(id: u32) -> Self {
        assert!((id as usize) < MAX_WORKERS, "worker id {} out of range", id);
        WorkerId(id)
    }

    /// The single-bit mask identifying this worker.
    pub fn mask(self) -> WorkerMask {
        WorkerMask(1u64 << self.0)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The fixed role of this worker, if it has one.
    pub fn role(self) -> Option<WorkerRole> {
        WorkerRole::ALL.get(self.index()).copied()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bitset of workers allowed to run a job.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerMask(pub u64);

impl WorkerMask {
    pub const NONE: WorkerMask = WorkerMask(0);
    pub const ON_MAIN: WorkerMask = WorkerMask(1 << WorkerRole::Main as u64);
    pub const ON_RENDER: WorkerMask = WorkerMask(1 << WorkerRole::Render as u64);
    pub const ON_COMPUTE: WorkerMask = WorkerMask(1 << WorkerRole::Compute as u64);
    pub const ON_IO_1: WorkerMask = WorkerMask(1 << WorkerRole::Io1 as u64);
    pub const ON_IO_2: WorkerMask = WorkerMask(1 << WorkerRole::Io2 as u64);
    pub const ON_SHARED_1: WorkerMask = WorkerMask(1 << WorkerRole::Shared1 as u64);
    pub const ON_SHARED_2: WorkerMask = WorkerMask(1 << WorkerRole::Shared2 as u64);
    pub const ON_SHARED_3: WorkerMask = WorkerMask(1 << WorkerRole::Shared3 as u64);

    pub const ANY: WorkerMask = WorkerMask(u64::MAX);
    pub const ANY_EXCEPT_MAIN: WorkerMask = WorkerMask(u64::MAX & !Self::ON_MAIN.0);
    pub const IO: WorkerMask = WorkerMask(Self::ON_IO_1.0 | Self::ON_IO_2.0);
    pub const SHARED: WorkerMask =
        WorkerMask(Self::ON_SHARED_1.0 | Self::ON_SHARED_2.0 | Self::ON_SHARED_3.0);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, worker: WorkerId) -> bool {
        self.intersects(worker.mask())
    }

    pub fn intersects(self, other: WorkerMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for WorkerMask {
    fn default() -> Self {
        WorkerMask::ANY_EXCEPT_MAIN
    }
}

impl fmt::Debug for WorkerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerMask({:#x})", self.0)
    }
}

impl BitOr for WorkerMask {
    type Output = WorkerMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        WorkerMask(self.0 | rhs.0)
    }
}

impl BitAnd for WorkerMask {
    type Output = WorkerMask;
    fn bitand(self, rhs: Self) -> Self::Output {
        WorkerMask(self.0 & rhs.0)
    }
}

impl Not for WorkerMask {
    type Output = WorkerMask;
    fn not(self) -> Self::Output {
        WorkerMask(!self.0)
    }
}

impl From<WorkerRole> for WorkerMask {
    fn from(role: WorkerRole) -> Self {
        role.mask()
    }
}

/// Clamps a requested worker count to the supported range.
pub fn clamp_worker_count(requested: usize) -> usize {
    requested.clamp(MIN_WORKERS, MAX_WORKERS)
}
