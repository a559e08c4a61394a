//! High-level scheduler interface.
//!
//! The [`Scheduler`] is the entry point for posting jobs, wiring dependencies
//! between them and waiting for results from outside the worker pool.

use crate::PinningStrategy;
use crate::affinity::{WorkerId, WorkerMask, clamp_worker_count};
use crate::config::SchedulerConfig;
use crate::context::Context;
use crate::error::{Result, SchedulerError};
use crate::fiber::{FiberId, FiberSlot, Resume};
use crate::fiber_pool::FiberPool;
use crate::handle::JobHandle;
use crate::job::{FnJob, Job, JobResult, JobStatus};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::queue::{JobQueues, PeriodicFiber};
use crate::signal::{CompletionSignal, JobSink};
use crate::worker::{self, WorkerSlot};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What a worker found to do next.
pub(crate) enum Work {
    Job(JobHandle),
    Fiber(FiberId),
}

/// State shared by the public handle, every worker and every fiber.
pub(crate) struct SchedulerCore {
    config: SchedulerConfig,
    self_ref: Weak<SchedulerCore>,
    queues: Mutex<JobQueues>,
    /// Structural lock: only the free-fiber list.
    pool: Mutex<FiberPool>,
    workers: RwLock<Vec<Arc<WorkerSlot>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Union of the running workers' bits.
    live_mask: AtomicU64,
    shut_down: AtomicBool,
    metrics: SchedulerMetrics,
}

impl SchedulerCore {
    fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| SchedulerCore {
            pool: Mutex::new(FiberPool::new(config.stack_size, worker::fiber_main)),
            config,
            self_ref: self_ref.clone(),
            queues: Mutex::new(JobQueues::new()),
            workers: RwLock::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            live_mask: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            metrics: SchedulerMetrics::new(),
        })
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn live_mask(&self) -> WorkerMask {
        WorkerMask(self.live_mask.load(Ordering::Acquire))
    }

    fn check_accepting(&self, mask: WorkerMask) -> Result<()> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        let live = self.live_mask();
        if mask.is_empty() || (!live.is_empty() && !mask.intersects(live)) {
            return Err(SchedulerError::NoMatchingWorker(mask));
        }
        Ok(())
    }

    fn new_handle(&self, job: Box<dyn Job>, mask: WorkerMask) -> JobHandle {
        let handle = JobHandle::new(job, mask, self.self_ref.clone());
        let hold = self.config.default_max_hold();
        if !hold.is_zero() {
            handle.set_max_hold(hold);
        }
        handle
    }

    pub(crate) fn post_job(&self, job: Box<dyn Job>, mask: WorkerMask) -> Result<JobHandle> {
        self.check_accepting(mask)?;
        let handle = self.new_handle(job, mask);
        self.metrics.record_posted();
        self.push_job(handle.clone());
        Ok(handle)
    }

    pub(crate) fn post_job_after(
        &self,
        job: Box<dyn Job>,
        signal: &CompletionSignal,
        mask: WorkerMask,
    ) -> Result<JobHandle> {
        self.check_accepting(mask)?;
        let handle = self.new_handle(job, mask);
        self.metrics.record_posted();
        self.enqueue_after(handle.clone(), signal);
        Ok(handle)
    }

    /// Queues `handle` once `signal` fires, or now if it already has.
    pub(crate) fn enqueue_after(&self, handle: JobHandle, signal: &CompletionSignal) {
        if let Some(handle) = signal.try_push_job(handle) {
            self.push_job(handle);
        }
    }

    /// Marks `handle` ready, files it by mask and priority, and wakes every
    /// worker allowed to run it.
    pub(crate) fn push_job(&self, handle: JobHandle) {
        let mask = handle.worker_mask();
        handle.set_status(JobStatus::Ready);
        self.queues.lock().push_job(handle);
        self.wake_matching(mask);
    }

    fn wake_matching(&self, mask: WorkerMask) {
        for worker in self.workers.read().iter() {
            if mask.contains(worker.id()) {
                worker.wake();
            }
        }
    }

    fn wake_worker(&self, id: WorkerId) {
        if let Some(worker) = self.workers.read().get(id.index()) {
            worker.wake();
        }
    }

    /// Hands a parked fiber back to the worker that parked it.
    pub(crate) fn make_ready(&self, worker: WorkerId, fiber: FiberId) {
        self.queues.lock().push_ready(worker, fiber);
        self.wake_worker(worker);
    }

    /// Registers `fiber` as `worker`'s periodic fiber and sets one job aside
    /// for the worker to run meanwhile.
    ///
    /// Returns `false` when a zero interval has nothing to yield to.
    pub(crate) fn prepare_poll(&self, worker: WorkerId, fiber: FiberId, interval: Duration) -> bool {
        let mut queues = self.queues.lock();
        if interval.is_zero() && !queues.has_job_ready(worker) {
            return false;
        }
        queues.set_periodic(
            worker,
            PeriodicFiber {
                fiber,
                deadline: Instant::now() + interval,
            },
        );
        queues.push_pending_from_global(worker);
        true
    }

    /// Next work item for `worker`, or `None` after an idle sleep.
    pub(crate) fn next_work(&self, worker: &WorkerSlot) -> Option<Work> {
        let id = worker.id();
        let mut queues = self.queues.lock();
        if worker.is_stopped() {
            return None;
        }
        if let Some(handle) = queues.pop_pending(id) {
            return Some(Work::Job(handle));
        }
        let now = Instant::now();
        if let Some(fiber) = queues.take_due_periodic(id, now) {
            return Some(Work::Fiber(fiber));
        }
        if let Some(fiber) = queues.pop_ready(id) {
            return Some(Work::Fiber(fiber));
        }
        if let Some(handle) = queues.pop_job(id) {
            return Some(Work::Job(handle));
        }

        let idle = self.config.idle_timeout();
        let timeout = queues
            .periodic_remaining(id, now)
            .map_or(idle, |remaining| remaining.min(idle));
        worker.condvar().wait_for(&mut queues, timeout);
        None
    }

    pub(crate) fn fetch_fiber(&self) -> Result<Box<FiberSlot>> {
        let (fiber, fresh) = self
            .pool
            .lock()
            .get()
            .map_err(SchedulerError::FiberCreation)?;
        if fresh {
            self.metrics.record_fiber_created();
            tracing::trace!(fiber = %fiber.id(), "fiber created");
        }
        Ok(fiber)
    }

    /// Returns a fiber that has switched away to the free pool.
    pub(crate) fn free_fiber(&self, fiber: Box<FiberSlot>) {
        self.pool.lock().return_fiber(fiber);
    }

    fn init_worker(&self, requested: usize) -> Result<usize> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        let core = self.self_ref.upgrade().ok_or(SchedulerError::ShutDown)?;
        let mut workers = self.workers.write();
        if !workers.is_empty() {
            return Err(SchedulerError::AlreadyInitialized(workers.len()));
        }

        let count = clamp_worker_count(requested);
        if count != requested {
            tracing::warn!(requested, count, "worker count clamped");
        }
        let core_ids = match self.config.pinning {
            PinningStrategy::None => None,
            _ => core_affinity::get_core_ids(),
        };

        let mut threads = self.threads.lock();
        for i in 0..count {
            let slot = Arc::new(WorkerSlot::new(
                WorkerId::new(i as u32),
                format!("{}{}", self.config.thread_name_prefix, i),
            ));
            let pin = core_ids
                .as_deref()
                .and_then(|ids| self.config.pinning.core_for(i, ids));
            let handle = worker::spawn(core.clone(), slot.clone(), pin)
                .map_err(SchedulerError::WorkerSpawn)?;
            self.live_mask.fetch_or(slot.mask().bits(), Ordering::AcqRel);
            threads.push(handle);
            workers.push(slot);
        }
        tracing::debug!(count, pinning = ?self.config.pinning, "workers started");
        Ok(count)
    }

    fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Stops and joins every worker, then tears down fibers and queues.
    fn shut_down(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let workers = std::mem::take(&mut *self.workers.write());
        self.live_mask.store(0, Ordering::Release);
        {
            // Under the queue lock so no worker can miss the stop flag
            // between its search and its sleep.
            let _queues = self.queues.lock();
            for worker in &workers {
                worker.stop();
            }
        }
        while workers.iter().any(|w| !w.has_exited()) {
            for worker in &workers {
                worker.condvar().notify_all();
            }
            thread::sleep(Duration::from_millis(1));
        }

        let mut panicked = 0;
        for handle in std::mem::take(&mut *self.threads.lock()) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        let fibers = self.pool.lock().drain();
        let fiber_count = fibers.len();
        for mut fiber in fibers {
            fiber.resume(Resume::Shutdown);
        }
        let dropped = self.queues.lock().clear();
        tracing::debug!(
            workers = workers.len(),
            fibers = fiber_count,
            dropped_jobs = dropped.len(),
            "scheduler shut down"
        );
        drop(dropped);

        if panicked > 0 {
            tracing::error!(panicked, "worker threads panicked");
            return Err(SchedulerError::WorkerPanicked(panicked));
        }
        Ok(())
    }
}

impl JobSink for SchedulerCore {
    fn schedule(&self, handle: JobHandle) {
        self.push_job(handle);
    }
}

/// The job scheduler: a fixed pool of role-bound workers running jobs on
/// pooled fibers.
///
/// Dropping the scheduler shuts it down.
///
/// # Example
///
/// ```no_run
/// use turbofiber::{Context, Scheduler, SchedulerConfig, WorkerMask};
///
/// let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
/// let handle = scheduler
///     .post_fn(|_ctx: &Context<'_>| println!("Hello from a fiber job!"), WorkerMask::ANY)
///     .unwrap();
/// scheduler.block_on(handle.signal()).unwrap();
/// ```
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Creates a scheduler with no workers. Call [`init_worker`](Self::init_worker)
    /// to start them; jobs posted before that are queued.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Scheduler {
            core: SchedulerCore::new(config),
        })
    }

    /// Creates a scheduler and starts `config.worker_count` workers.
    pub fn start(config: SchedulerConfig) -> Result<Self> {
        let count = config.worker_count;
        let scheduler = Self::new(config)?;
        scheduler.init_worker(count)?;
        Ok(scheduler)
    }

    /// Starts `count` workers, clamped to `[8, 64]`. Returns the number started.
    pub fn init_worker(&self, count: usize) -> Result<usize> {
        self.core.init_worker(count)
    }

    /// Stops all workers. Idempotent; also runs on drop.
    ///
    /// Jobs still queued are discarded and fibers parked on unfired signals
    /// are unwound.
    pub fn shut_down(&self) -> Result<()> {
        self.core.shut_down()
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.is_shut_down()
    }

    pub fn worker_count(&self) -> usize {
        self.core.worker_count()
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.core.config()
    }

    /// Posts `job` for any worker in `mask`.
    pub fn post_job<J: Job>(&self, job: J, mask: WorkerMask) -> Result<JobHandle> {
        self.core.post_job(Box::new(job), mask)
    }

    /// Posts `job` to become ready when `signal` fires.
    pub fn post_job_after<J: Job>(
        &self,
        job: J,
        signal: &CompletionSignal,
        mask: WorkerMask,
    ) -> Result<JobHandle> {
        self.core.post_job_after(Box::new(job), signal, mask)
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

    /// Makes `signal` additionally wait for `condition`. No effect if
    /// `condition` already fired.
    pub fn add_pre_condition(&self, signal: &CompletionSignal, condition: &CompletionSignal) -> bool {
        condition.add_trigger(signal, true)
    }

    /// Blocks the calling thread until `signal` fires.
    ///
    /// Must not be called from inside a job; use `Context::yield_for` there.
    /// Fails instead of hanging when no worker could ever fire the signal.
    pub fn block_on(&self, signal: &CompletionSignal) -> Result<()> {
        self.check_can_wait(signal)?;
        signal.wait_blocking(None);
        Ok(())
    }

    /// Like [`block_on`](Self::block_on) but gives up after `timeout`,
    /// returning `false`.
    pub fn block_on_timeout(&self, signal: &CompletionSignal, timeout: Duration) -> Result<bool> {
        self.check_can_wait(signal)?;
        Ok(signal.wait_blocking(Some(timeout)))
    }

    fn check_can_wait(&self, signal: &CompletionSignal) -> Result<()> {
        if signal.is_fired() {
            return Ok(());
        }
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        if self.worker_count() == 0 {
            return Err(SchedulerError::NotInitialized);
        }
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics().snapshot()
    }

    /// Idle fibers in the free pool.
    pub fn free_fibers(&self) -> usize {
        self.core.pool.lock().len()
    }

    /// Jobs queued and not yet picked by any worker.
    pub fn queued_jobs(&self) -> usize {
        self.core.queues.lock().queued()
    }

    /// Writes the Chrome trace collected from exited workers.
    pub fn export_trace(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        crate::profiler::export_to_file(path)
    }
}

/// Lets external threads trigger signals: `gate.trigger(0, &scheduler)`.
impl JobSink for Scheduler {
    fn schedule(&self, handle: JobHandle) {
        self.core.push_job(handle);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.core.shut_down() {
            tracing::error!(error = %e, "scheduler shutdown failed");
        }
    }
}
