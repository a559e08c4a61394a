use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Scheduler-wide counters. Updated with relaxed atomics on the hot path.
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Jobs accepted through the posting API.
    pub jobs_posted: AtomicU64,
    /// Jobs whose body ran to completion (including failures).
    pub jobs_executed: AtomicU64,
    /// Executed jobs that returned a non-zero code.
    pub jobs_failed: AtomicU64,
    /// Jobs dropped unexecuted because their max-hold elapsed.
    pub jobs_expired: AtomicU64,
    /// Jobs whose body panicked.
    pub jobs_panicked: AtomicU64,
    pub fibers_created: AtomicU64,
    /// Times a fiber gave up its worker in `yield_for` or `yield_poll`.
    pub suspensions: AtomicU64,
    /// Times a worker switched back into a parked fiber.
    pub resumptions: AtomicU64,
    pub start_time: Instant,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            jobs_posted: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_expired: AtomicU64::new(0),
            jobs_panicked: AtomicU64::new(0),
            fibers_created: AtomicU64::new(0),
            suspensions: AtomicU64::new(0),
            resumptions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_posted(&self) {
        self.jobs_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_executed(&self, result: i32) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        if result != 0 {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_expired(&self) {
        self.jobs_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.jobs_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fiber_created(&self) {
        self.fibers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resumption(&self) {
        self.resumptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_posted: self.jobs_posted.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_expired: self.jobs_expired.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            fibers_created: self.fibers_created.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            resumptions: self.resumptions.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_posted: u64,
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    pub jobs_expired: u64,
    pub jobs_panicked: u64,
    pub fibers_created: u64,
    pub suspensions: u64,
    pub resumptions: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximates jobs posted but not yet finished (includes internal wake jobs).
    pub fn backlog(&self) -> i64 {
        self.jobs_posted as i64 - (self.jobs_executed + self.jobs_expired) as i64
    }

    /// Fibers currently parked waiting on a signal or a poll interval.
    pub fn parked_fibers(&self) -> i64 {
        self.suspensions as i64 - self.resumptions as i64
    }
}
