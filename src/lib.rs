//! # TurboFiber - Cooperative Fiber Job Scheduler
//!
//! A job scheduler built on stackful fibers. A fixed pool of role-bound
//! worker threads (main, render, compute, I/O, shared) executes many small
//! jobs that depend on each other, without blocking OS threads while a job
//! waits for its dependencies.
//!
//! ## Architecture
//!
//! - **Jobs**: units of work returning an integer code, posted with a
//!   priority and a worker affinity mask
//! - **Completion signals**: reference-counted join nodes; a signal fires
//!   once all its predecessors finished, releasing dependent jobs and
//!   cascading to downstream signals
//! - **Fibers**: pooled execution contexts; a job that waits suspends its
//!   fiber and the worker keeps going on a fresh one
//! - **Workers**: OS threads each owning one bit of a 64-bit mask, picking
//!   the most urgent job allowed to run on them
//!
//! ## Example
//!
//! ```no_run
//! use turbofiber::{Context, Scheduler, SchedulerConfig, WorkerMask};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
//!
//! let first = scheduler
//!     .post_fn(|_ctx: &Context<'_>| println!("first"), WorkerMask::ANY)
//!     .unwrap();
//! let second = first
//!     .post_successor_fn(|_ctx: &Context<'_>| println!("second"), WorkerMask::ANY)
//!     .unwrap();
//!
//! scheduler.block_on(second.signal()).unwrap();
//! ```

pub mod affinity;
pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
mod fiber_pool;
pub mod handle;
pub mod job;
pub mod metrics;
pub mod profiler;
mod queue;
pub mod scheduler;
pub mod signal;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Core for worker `index`, wrapping around when there are more workers
    /// than usable cores.
    pub fn core_for(
        self,
        index: usize,
        cores: &[core_affinity::CoreId],
    ) -> Option<core_affinity::CoreId> {
        if cores.is_empty() {
            return None;
        }
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(cores[index % cores.len()]),
            PinningStrategy::AvoidSMT => {
                let physical = cores.len().div_ceil(2);
                Some(cores[(index % physical) * 2])
            }
        }
    }
}

pub use affinity::{WorkerId, WorkerMask, WorkerRole};
pub use config::SchedulerConfig;
pub use context::Context;
pub use error::{Result, SchedulerError};
pub use fiber::FiberId;
pub use handle::JobHandle;
pub use job::{CompletorJob, FnJob, Job, JobStatus, Priority};
pub use metrics::MetricsSnapshot;
pub use scheduler::Scheduler;
pub use signal::{CompletionSignal, JobSink};
