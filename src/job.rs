//! Job definitions.
//!
//! A job is a unit of work returning an integer result code (0 = success).
//! Closures are adapted through [`FnJob`] and [`CompletorJob`]; anything else
//! can implement [`Job`] directly.

use crate::context::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

/// Result code recorded for a job whose body panicked.
pub const JOB_PANICKED: i32 = -1;

/// Job priority. Lower value = dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Top = 0,
    Render,
    #[default]
    Compute,
    Io,
    Editor,
    Low,
}

/// Number of priority levels (bucket count per affinity mask).
pub const PRIORITY_COUNT: usize = 6;

impl Priority {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle of a job. Transitions are monotonic per execution:
/// Created → Ready → Running → {Success, Failed} or Ready → Expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Invalid = 0,
    Created,
    Ready,
    Running,
    Suspended,
    Success,
    Failed,
    Expired,
}

impl JobStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => JobStatus::Created,
            2 => JobStatus::Ready,
            3 => JobStatus::Running,
            4 => JobStatus::Suspended,
            5 => JobStatus::Success,
            6 => JobStatus::Failed,
            7 => JobStatus::Expired,
            _ => JobStatus::Invalid,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Expired
        )
    }
}

/// A unit of work executed by the scheduler on a worker fiber.
///
/// Failures are reported through the returned code, never by panicking; a
/// panic is caught and recorded as [`JOB_PANICKED`].
pub trait Job: Send + Sync + 'static {
    /// Runs the job. Called at most once.
    fn execute(&self, ctx: &Context<'_>) -> i32;

    fn priority(&self) -> Priority {
        Priority::default()
    }

    /// Called when the job is aborted. Abort is advisory.
    fn on_aborted(&self) {}

    /// Called once the job reaches a terminal status.
    fn on_finished(&self, _status: JobStatus) {}

    /// Receives the result code of the predecessor that released this job.
    fn set_pre_result(&self, _result: i32) {}
}

/// Converts a closure's return value into a job result code.
pub trait JobResult {
    fn into_code(self) -> i32;
}

impl JobResult for () {
    fn into_code(self) -> i32 {
        0
    }
}

impl JobResult for i32 {
    fn into_code(self) -> i32 {
        self
    }
}

/// Job backed by a one-shot closure.
pub struct FnJob<F> {
    work: Mutex<Option<F>>,
    priority: Priority,
}

impl<F, R> FnJob<F>
where
    F: FnOnce(&Context<'_>) -> R + Send + 'static,
    R: JobResult,
{
    pub fn new(work: F) -> Self {
        FnJob {
            work: Mutex::new(Some(work)),
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl<F, R> Job for FnJob<F>
where
    F: FnOnce(&Context<'_>) -> R + Send + 'static,
    R: JobResult,
{
    fn execute(&self, ctx: &Context<'_>) -> i32 {
        let work = self.work.lock().take();
        match work {
            Some(work) => work(ctx).into_code(),
            None => {
                debug_assert!(false, "FnJob executed twice");
                0
            }
        }
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Job that receives its predecessor's result code.
///
/// Always reports success itself; branching on the predecessor's outcome is
/// up to the closure.
pub struct CompletorJob<F> {
    work: Mutex<Option<F>>,
    pre_result: AtomicI32,
    priority: Priority,
}

impl<F, R> CompletorJob<F>
where
    F: FnOnce(&Context<'_>, i32) -> R + Send + 'static,
    R: JobResult,
{
    pub fn new(work: F) -> Self {
        CompletorJob {
            work: Mutex::new(Some(work)),
            pre_result: AtomicI32::new(0),
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl<F, R> Job for CompletorJob<F>
where
    F: FnOnce(&Context<'_>, i32) -> R + Send + 'static,
    R: JobResult,
{
    fn execute(&self, ctx: &Context<'_>) -> i32 {
        if let Some(work) = self.work.lock().take() {
            let _ = work(ctx, self.pre_result.load(Ordering::Acquire));
        }
        0
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn set_pre_result(&self, result: i32) {
        self.pre_result.store(result, Ordering::Release);
    }
}

/// A job together with its status and abort flag. Owned by a `JobHandle`.
pub(crate) struct JobCell {
    job: Box<dyn Job>,
    status: AtomicU8,
    aborted: AtomicBool,
}

impl JobCell {
    pub(crate) fn new(job: Box<dyn Job>) -> Self {
        JobCell {
            job,
            status: AtomicU8::new(JobStatus::Created as u8),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn job(&self) -> &dyn Job {
        self.job.as_ref()
    }

    pub(crate) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::Release);
        if status.is_terminal() {
            self.job.on_finished(status);
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        self.job.priority()
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.job.on_aborted();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}
