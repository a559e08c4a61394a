//! Scheduled job instances.

use crate::affinity::{WorkerId, WorkerMask};
use crate::context::Context;
use crate::error::{Result, SchedulerError};
use crate::job::{CompletorJob, FnJob, JOB_PANICKED, Job, JobCell, JobResult, JobStatus, Priority};
use crate::scheduler::SchedulerCore;
use crate::signal::CompletionSignal;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const NO_WORKER: u32 = u32::MAX;

struct HandleInner {
    cell: JobCell,
    signal: CompletionSignal,
    worker_mask: WorkerMask,
    submitted_at: Instant,
    /// Max time the job may wait before dispatch, in ns. 0 = no deadline.
    max_hold_ns: AtomicU64,
    /// Worker that last executed the job.
    worker_id: AtomicU32,
    scheduler: Weak<SchedulerCore>,
}

/// A job bound to its completion signal, affinity mask and deadline.
///
/// Cloning is cheap; all clones refer to the same scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

impl JobHandle {
    /// Wraps `job` with a fresh signal that waits for this job alone.
    pub(crate) fn new(job: Box<dyn Job>, worker_mask: WorkerMask, scheduler: Weak<SchedulerCore>) -> Self {
        JobHandle {
            inner: Arc::new(HandleInner {
                cell: JobCell::new(job),
                signal: CompletionSignal::with_pending(1),
                worker_mask,
                submitted_at: Instant::now(),
                max_hold_ns: AtomicU64::new(0),
                worker_id: AtomicU32::new(NO_WORKER),
                scheduler,
            }),
        }
    }

    /// Signal fired when this job finishes or expires.
    pub fn signal(&self) -> &CompletionSignal {
        &self.inner.signal
    }

    pub fn status(&self) -> JobStatus {
        self.inner.cell.status()
    }

    pub fn priority(&self) -> Priority {
        self.inner.cell.priority()
    }

    pub fn worker_mask(&self) -> WorkerMask {
        self.inner.worker_mask
    }

    /// Worker that executed the job, once it has run.
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self.inner.worker_id.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(WorkerId(id)),
        }
    }

    pub fn submitted_at(&self) -> Instant {
        self.inner.submitted_at
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn ptr_eq(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sets how long the job may wait for dispatch. `Duration::ZERO` removes
    /// the deadline.
    pub fn set_max_hold(&self, hold: Duration) {
        let nanos = u64::try_from(hold.as_nanos()).unwrap_or(u64::MAX);
        self.inner.max_hold_ns.store(nanos, Ordering::Release);
    }

    pub fn max_hold(&self) -> Duration {
        Duration::from_nanos(self.inner.max_hold_ns.load(Ordering::Acquire))
    }

    /// True once the job has waited longer than its max-hold duration.
    pub fn is_timeout(&self) -> bool {
        let hold = self.max_hold();
        !hold.is_zero() && self.inner.submitted_at.elapsed() > hold
    }

    /// Marks the job aborted and runs its abort hook. Advisory only: the
    /// job stays queued and its body decides whether to honour the flag.
    pub fn abort(&self) {
        self.inner.cell.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.cell.is_aborted()
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.inner.cell.set_status(status);
    }

    pub(crate) fn set_pre_result(&self, result: i32) {
        self.inner.cell.job().set_pre_result(result);
    }

    /// Runs the job on the calling worker and records the outcome.
    ///
    /// Does not trigger the signal; the dispatch loop does that afterwards.
    pub(crate) fn execute(&self, ctx: &Context<'_>) -> i32 {
        let worker = ctx.worker_id();
        assert!(
            self.inner.worker_mask.contains(worker),
            "job with mask {:?} dispatched on worker {}",
            self.inner.worker_mask,
            worker
        );

        self.inner.worker_id.store(worker.0, Ordering::Release);
        self.set_status(JobStatus::Running);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.inner.cell.job().execute(ctx)));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                // Parked fibers are force-unwound when their worker exits.
                if ctx.is_unwinding_parked() {
                    resume_unwind(payload);
                }
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "Unknown panic"
                };
                tracing::error!(worker = %worker, panic = msg, "job panicked");
                ctx.core().metrics().record_panic();
                JOB_PANICKED
            }
        };

        self.set_status(if result == 0 {
            JobStatus::Success
        } else {
            JobStatus::Failed
        });
        result
    }

    fn scheduler(&self) -> Result<Arc<SchedulerCore>> {
        self.inner.scheduler.upgrade().ok_or(SchedulerError::ShutDown)
    }

    /// Posts `job` to run after this job finishes, whatever its result.
    pub fn post_successor<J: Job>(&self, job: J, worker_mask: WorkerMask) -> Result<JobHandle> {
        self.scheduler()?
            .post_job_after(Box::new(job), &self.inner.signal, worker_mask)
    }

    /// Closure form of [`post_successor`](Self::post_successor).
    pub fn post_successor_fn<F, R>(&self, work: F, worker_mask: WorkerMask) -> Result<JobHandle>
    where
        F: FnOnce(&Context<'_>) -> R + Send + 'static,
        R: JobResult,
    {
        self.post_successor(FnJob::new(work), worker_mask)
    }

    /// Posts `job` after this job on the calling worker; the job receives
    /// this job's result code through `Job::set_pre_result`.
    pub fn post_completor<J: Job>(&self, ctx: &Context<'_>, job: J) -> Result<JobHandle> {
        self.scheduler()?
            .post_job_after(Box::new(job), &self.inner.signal, ctx.worker_mask())
    }

    /// Closure form of [`post_completor`](Self::post_completor).
    pub fn post_completor_fn<F, R>(&self, ctx: &Context<'_>, work: F) -> Result<JobHandle>
    where
        F: FnOnce(&Context<'_>, i32) -> R + Send + 'static,
        R: JobResult,
    {
        self.post_completor(ctx, CompletorJob::new(work))
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("status", &self.status())
            .field("priority", &self.priority())
            .field("worker_mask", &self.inner.worker_mask)
            .field("worker_id", &self.worker_id())
            .field("signal", &self.inner.signal)
            .finish()
    }
}
