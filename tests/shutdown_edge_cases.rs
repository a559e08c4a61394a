use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use turbofiber::{CompletionSignal, Context, Scheduler, SchedulerConfig, SchedulerError, WorkerMask};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        stack_size: 128 * 1024,
        ..SchedulerConfig::default()
    }
}

/// Sets its flag when dropped, proving a captured value was released.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_shutdown_during_job_execution() {
    let scheduler = Scheduler::start(config()).unwrap();
    for _ in 0..10 {
        scheduler
            .post_fn(
                |_: &Context<'_>| std::thread::sleep(Duration::from_millis(10)),
                WorkerMask::ANY,
            )
            .unwrap();
    }
    assert!(scheduler.shut_down().is_ok());
    assert!(scheduler.is_shut_down());
}

#[test]
fn test_shutdown_drops_queued_jobs() {
    let scheduler = Scheduler::new(config()).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    for _ in 0..5 {
        let r = ran.clone();
        scheduler
            .post_fn(
                move |_: &Context<'_>| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                WorkerMask::ANY,
            )
            .unwrap();
    }
    let guard = DropFlag(dropped.clone());
    scheduler
        .post_fn(move |_: &Context<'_>| drop(guard), WorkerMask::ANY)
        .unwrap();
    assert_eq!(scheduler.queued_jobs(), 6);

    scheduler.shut_down().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.queued_jobs(), 0);
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn test_shutdown_unwinds_suspended_fibers() {
    let scheduler = Scheduler::start(config()).unwrap();
    let never = CompletionSignal::with_pending(1);
    let released = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicBool::new(false));

    let (n, rel, res) = (never.clone(), released.clone(), resumed.clone());
    scheduler
        .post_fn(
            move |ctx: &Context<'_>| {
                let _guard = DropFlag(rel);
                ctx.yield_for(&n);
                res.store(true, Ordering::SeqCst);
            },
            WorkerMask::ON_IO_2,
        )
        .unwrap();

    let start = Instant::now();
    while scheduler.metrics().suspensions == 0 && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(scheduler.metrics().suspensions, 1);

    assert!(scheduler.shut_down().is_ok());
    assert!(released.load(Ordering::SeqCst));
    assert!(!resumed.load(Ordering::SeqCst));
    assert!(!never.is_fired());
}

#[test]
fn test_shutdown_is_idempotent() {
    let scheduler = Scheduler::start(config()).unwrap();
    assert!(scheduler.shut_down().is_ok());
    assert!(scheduler.shut_down().is_ok());
    assert_eq!(scheduler.worker_count(), 0);
}

#[test]
fn test_drop_without_explicit_shutdown() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let scheduler = Scheduler::start(config()).unwrap();
        let c = counter.clone();
        let handle = scheduler
            .post_fn(
                move |_: &Context<'_>| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
                WorkerMask::ANY,
            )
            .unwrap();
        scheduler.block_on(handle.signal()).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_operations_after_shutdown() {
    let scheduler = Scheduler::start(config()).unwrap();
    let pending = CompletionSignal::with_pending(1);
    scheduler.shut_down().unwrap();

    let err = scheduler
        .post_fn(|_: &Context<'_>| {}, WorkerMask::ANY)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ShutDown));
    assert!(matches!(
        scheduler.post_fn_after(|_: &Context<'_>| {}, &pending, WorkerMask::ANY),
        Err(SchedulerError::ShutDown)
    ));
    assert!(matches!(
        scheduler.block_on(&pending),
        Err(SchedulerError::ShutDown)
    ));
    assert!(matches!(
        scheduler.init_worker(8),
        Err(SchedulerError::ShutDown)
    ));

    // A signal that already fired still reports success.
    let fired = scheduler.fetch_signal();
    assert!(scheduler.block_on(&fired).is_ok());
}

#[test]
fn test_block_on_without_workers() {
    let scheduler = Scheduler::new(config()).unwrap();
    let handle = scheduler.post_fn(|_: &Context<'_>| {}, WorkerMask::ANY).unwrap();
    assert!(matches!(
        scheduler.block_on(handle.signal()),
        Err(SchedulerError::NotInitialized)
    ));
}
