//! Context type for safe access to scheduler capabilities from within jobs.

use crate::affinity::{WorkerId, WorkerMask, WorkerRole};
use crate::error::Result;
use crate::fiber::{FiberId, FiberSwitch, FiberYielder, Resume, WorkerEnv};
use crate::handle::JobHandle;
use crate::job::{FnJob, Job, JobResult, JobStatus, Priority};
use crate::scheduler::SchedulerCore;
use crate::signal::{CompletionSignal, JobSink};
use std::sync::Arc;
use std::time::Duration;

/// Handed to every running job: identifies the worker and fiber it runs on
/// and lets it post work or cooperatively wait.
pub struct Context<'a> {
    env: &'a WorkerEnv,
    fiber: FiberId,
    yielder: &'a FiberYielder,
    handle: &'a JobHandle,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        env: &'a WorkerEnv,
        fiber: FiberId,
        yielder: &'a FiberYielder,
        handle: &'a JobHandle,
    ) -> Self {
        Context {
            env,
            fiber,
            yielder,
            handle,
        }
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.env.core
    }

    pub fn worker_id(&self) -> WorkerId {
        self.env.worker.id()
    }

    /// Single-bit mask of the running worker.
    pub fn worker_mask(&self) -> WorkerMask {
        self.env.worker.mask()
    }

    pub fn worker_role(&self) -> Option<WorkerRole> {
        self.worker_id().role()
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    /// Handle of the job being executed.
    pub fn handle(&self) -> &JobHandle {
        self.handle
    }

    /// True if the running job was aborted. Abort is advisory; long jobs
    /// should check this and return early.
    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    /// True once the worker has been told to stop.
    pub fn is_shutting_down(&self) -> bool {
        self.env.worker.is_stopped()
    }

    pub(crate) fn is_unwinding_parked(&self) -> bool {
        self.env.worker.is_unwinding()
    }

    pub fn post_job<J: Job>(&self, job: J, mask: WorkerMask) -> Result<JobHandle> {
        self.core().post_job(Box::new(job), mask)
    }

    pub fn post_job_after<J: Job>(
        &self,
        job: J,
        signal: &CompletionSignal,
        mask: WorkerMask,
    ) -> Result<JobHandle> {
        self.core().post_job_after(Box::new(job), signal, mask)
    }

    pub fn post_fn<F, R>(&self, work: F, mask: WorkerMask) -> Result<JobHandle>
    where
        F: FnOnce(&Context<'_>) -> R + Send + 'static,
        R: JobResult,
    {
        self.post_job(FnJob::new(work), mask)
    }

    pub fn post_fn_after<F, R>(
        &self,
        work: F,
        signal: &CompletionSignal,
        mask: WorkerMask,
    ) -> Result<JobHandle>
    where
        F: FnOnce(&Context<'_>) -> R + Send + 'static,
        R: JobResult,
    {
        self.post_job_after(FnJob::new(work), signal, mask)
    }

    /// A fresh join signal with no predecessors.
    pub fn fetch_signal(&self) -> CompletionSignal {
        CompletionSignal::new()
    }

    /// Makes `signal` additionally wait for `condition`.
    pub fn add_pre_condition(&self, signal: &CompletionSignal, condition: &CompletionSignal) -> bool {
        condition.add_trigger(signal, true)
    }

    /// Suspends the running job until `signal` fires.
    ///
    /// The worker keeps running other work on a fresh fiber meanwhile. The
    /// job resumes on this same worker.
    pub fn yield_for(&self, signal: &CompletionSignal) {
        if signal.is_fired() {
            return;
        }
        debug_assert!(
            !signal.ptr_eq(self.handle.signal()),
            "job waiting on its own completion signal"
        );

        let worker = self.worker_id();
        let fiber = self.fiber;
        let wake = FnJob::new(move |ctx: &Context<'_>| ctx.core().make_ready(worker, fiber))
            .with_priority(Priority::Top);
        let core = self.core();
        let wake = JobHandle::new(Box::new(wake), WorkerMask::ANY, Arc::downgrade(core));
        core.metrics().record_posted();
        core.enqueue_after(wake, signal);

        tracing::trace!(worker = %worker, %fiber, "fiber waiting on signal");
        self.suspend();
    }

    /// Gives up the worker for `interval_ms` milliseconds, letting it run one
    /// other job meanwhile.
    ///
    /// With `0`, returns at once unless a job is waiting for this worker.
    pub fn yield_poll(&self, interval_ms: u64) {
        let interval = Duration::from_millis(interval_ms);
        if !self
            .core()
            .prepare_poll(self.worker_id(), self.fiber, interval)
        {
            return;
        }
        self.suspend();
    }

    /// Parks this fiber in the worker's base loop until something makes it
    /// ready again.
    fn suspend(&self) {
        self.handle.set_status(JobStatus::Suspended);
        self.core().metrics().record_suspension();
        match self.yielder.suspend(FiberSwitch::Suspend) {
            Resume::Run(env) => debug_assert_eq!(env.worker.id(), self.worker_id()),
            Resume::Shutdown => debug_assert!(false, "parked fiber resumed for shutdown"),
        }
        self.handle.set_status(JobStatus::Running);
    }
}

/// Lets a job trigger signals directly: `gate.trigger(0, ctx)`.
impl JobSink for Context<'_> {
    fn schedule(&self, handle: JobHandle) {
        self.core().push_job(handle);
    }
}
