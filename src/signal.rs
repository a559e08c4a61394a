//! Completion signals: reference-counted join nodes of the job graph.
//!
//! A signal waits for `pending` predecessors. When the last one triggers it,
//! the signal fires exactly once: every dependent job is released to a
//! [`JobSink`] and every downstream signal is triggered in turn.

use crate::handle::JobHandle;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Destination for jobs released by a firing signal (the scheduler's ready
/// queues, or a plain collection in tests).
pub trait JobSink {
    fn schedule(&self, handle: JobHandle);
}

struct SignalLists {
    next_jobs: Vec<JobHandle>,
    triggers: Vec<CompletionSignal>,
}

struct InnerSignal {
    /// Outstanding predecessors. Decremented only under `lists`; may be
    /// incremented by an upstream signal's `add_trigger` without it.
    pending: AtomicI32,
    lists: Mutex<SignalLists>,
}

/// A many-to-one-then-fan-out synchronization node.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<InnerSignal>,
}

impl CompletionSignal {
    /// Creates a join signal with no predecessors. It counts as fired until
    /// a predecessor is registered through [`add_trigger`](Self::add_trigger).
    pub fn new() -> Self {
        Self::with_pending(0)
    }

    /// Creates a signal waiting for `pending` predecessors.
    pub fn with_pending(pending: i32) -> Self {
        CompletionSignal {
            inner: Arc::new(InnerSignal {
                pending: AtomicI32::new(pending),
                lists: Mutex::new(SignalLists {
                    next_jobs: Vec::new(),
                    triggers: Vec::new(),
                }),
            }),
        }
    }

    /// Number of predecessors still outstanding.
    pub fn pending(&self) -> i32 {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// True once every predecessor has reported.
    pub fn is_fired(&self) -> bool {
        self.pending() <= 0
    }

    pub fn ptr_eq(&self, other: &CompletionSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Reports one finished predecessor.
    ///
    /// Returns `true` if this call fired the signal. Triggering a signal that
    /// already fired is ignored.
    pub fn trigger<S: JobSink + ?Sized>(&self, result: i32, sink: &S) -> bool {
        let (next_jobs, triggers) = {
            let mut lists = self.inner.lists.lock();
            if self.inner.pending.load(Ordering::Acquire) <= 0 {
                tracing::warn!(result, "trigger on a signal that already fired, ignored");
                return false;
            }
            let remaining = self.inner.pending.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining > 0 {
                return false;
            }
            (
                std::mem::take(&mut lists.next_jobs),
                std::mem::take(&mut lists.triggers),
            )
        };

        // Released outside the lock: downstream signals take their own locks.
        for job in next_jobs {
            job.set_pre_result(result);
            sink.schedule(job);
        }
        for trigger in triggers {
            trigger.trigger(result, sink);
        }
        true
    }

    /// Makes this signal's firing also count down `other`.
    ///
    /// With `increment_other`, `other` gains one pending predecessor. Ignored
    /// if this signal already fired. Registering the same `other` twice is a
    /// graph construction bug.
    pub fn add_trigger(&self, other: &CompletionSignal, increment_other: bool) -> bool {
        let mut lists = self.inner.lists.lock();
        if self.is_fired() {
            tracing::trace!("add_trigger on a fired signal, ignored");
            return false;
        }
        assert!(
            !lists.triggers.iter().any(|t| t.ptr_eq(other)),
            "signal registered twice as a trigger"
        );
        if increment_other {
            other.inner.pending.fetch_add(1, Ordering::AcqRel);
        }
        lists.triggers.push(other.clone());
        true
    }

    /// Records a job to release when this signal fires. Ignored if the
    /// signal already fired.
    pub fn push_job(&self, handle: JobHandle) -> bool {
        self.try_push_job(handle).is_none()
    }

    /// Records `handle` as a dependent, or hands it back if the signal
    /// already fired.
    pub(crate) fn try_push_job(&self, handle: JobHandle) -> Option<JobHandle> {
        let mut lists = self.inner.lists.lock();
        if self.is_fired() {
            return Some(handle);
        }
        lists.next_jobs.push(handle);
        None
    }

    /// Blocks the calling OS thread until the signal fires.
    ///
    /// Intended for threads outside the scheduler; inside a job use
    /// `Context::yield_for`. Returns `false` if `timeout` elapsed first.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut sleep_us = 1;
        const MAX_SLEEP_US: u64 = 1000;

        while !self.is_fired() {
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return false;
                }
            }
            thread::sleep(Duration::from_micros(sleep_us));
            sleep_us = (sleep_us * 2).min(MAX_SLEEP_US);
        }
        true
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::WorkerMask;
    use crate::context::Context;
    use crate::job::{CompletorJob, FnJob, Job};
    use std::sync::Weak;

    #[derive(Default)]
    struct VecSink {
        released: Mutex<Vec<JobHandle>>,
    }

    impl JobSink for VecSink {
        fn schedule(&self, handle: JobHandle) {
            self.released.lock().push(handle);
        }
    }

    impl VecSink {
        fn count(&self) -> usize {
            self.released.lock().len()
        }
    }

    fn detached(job: impl Job) -> JobHandle {
        JobHandle::new(Box::new(job), WorkerMask::ANY, Weak::new())
    }

    fn noop() -> JobHandle {
        detached(FnJob::new(|_: &Context<'_>| {}))
    }

    #[test]
    fn test_fires_only_after_all_predecessors() {
        let sink = VecSink::default();
        let signal = CompletionSignal::with_pending(3);
        assert!(signal.push_job(noop()));

        assert!(!signal.trigger(0, &sink));
        assert!(!signal.trigger(0, &sink));
        assert_eq!(sink.count(), 0);
        assert!(!signal.is_fired());

        assert!(signal.trigger(0, &sink));
        assert!(signal.is_fired());
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_fan_in_join_fires_once() {
        let sink = VecSink::default();
        let join = CompletionSignal::new();
        let predecessors: Vec<_> = (0..5).map(|_| CompletionSignal::with_pending(1)).collect();
        for p in &predecessors {
            assert!(p.add_trigger(&join, true));
        }
        assert_eq!(join.pending(), 5);
        join.push_job(noop());

        for (i, p) in predecessors.iter().enumerate() {
            assert!(p.trigger(0, &sink));
            let expect_fired = i == predecessors.len() - 1;
            assert_eq!(join.is_fired(), expect_fired);
        }
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_late_additions_are_ignored() {
        let sink = VecSink::default();
        let signal = CompletionSignal::with_pending(1);
        signal.trigger(0, &sink);

        let other = CompletionSignal::new();
        assert!(!signal.add_trigger(&other, true));
        assert_eq!(other.pending(), 0);
        assert!(!signal.push_job(noop()));
        assert!(signal.try_push_job(noop()).is_some());
    }

    #[test]
    fn test_extra_trigger_is_noop() {
        let sink = VecSink::default();
        let signal = CompletionSignal::with_pending(1);
        signal.push_job(noop());
        assert!(signal.trigger(0, &sink));
        assert!(!signal.trigger(0, &sink));
        assert!(!signal.trigger(5, &sink));
        assert_eq!(sink.count(), 1);
        assert_eq!(signal.pending(), 0);
    }

    #[test]
    fn test_cascade_passes_result_downstream() {
        let sink = VecSink::default();
        let upstream = CompletionSignal::with_pending(1);
        let downstream = CompletionSignal::with_pending(1);
        upstream.add_trigger(&downstream, false);

        let completor = detached(CompletorJob::new(|_: &Context<'_>, _pre: i32| {}));
        downstream.push_job(completor.clone());

        upstream.trigger(42, &sink);
        assert!(downstream.is_fired());
        assert_eq!(sink.count(), 1);
        assert!(sink.released.lock()[0].ptr_eq(&completor));
    }

    #[test]
    fn test_release_in_registration_order() {
        let sink = VecSink::default();
        let signal = CompletionSignal::with_pending(1);
        let jobs: Vec<_> = (0..4).map(|_| noop()).collect();
        for job in &jobs {
            signal.push_job(job.clone());
        }
        signal.trigger(0, &sink);

        let released = sink.released.lock();
        for (expected, actual) in jobs.iter().zip(released.iter()) {
            assert!(expected.ptr_eq(actual));
        }
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_trigger_registration_panics() {
        let signal = CompletionSignal::with_pending(1);
        let other = CompletionSignal::new();
        signal.add_trigger(&other, true);
        signal.add_trigger(&other, true);
    }

    #[test]
    fn test_wait_blocking_times_out_then_succeeds() {
        let signal = CompletionSignal::with_pending(1);
        assert!(!signal.wait_blocking(Some(Duration::from_millis(5))));

        let remote = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.trigger(0, &VecSink::default());
        });
        assert!(signal.wait_blocking(Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }

    #[test]
    fn test_fresh_join_counts_as_fired() {
        let join = CompletionSignal::new();
        assert!(join.is_fired());
        assert!(join.wait_blocking(None));
    }
}
