use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use turbofiber::{
    CompletorJob, Context, Job, JobHandle, JobStatus, Scheduler, SchedulerConfig, WorkerMask,
};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        stack_size: 128 * 1024,
        ..SchedulerConfig::default()
    }
}

fn wait(scheduler: &Scheduler, handle: &JobHandle) {
    assert!(
        scheduler
            .block_on_timeout(handle.signal(), Duration::from_secs(10))
            .unwrap()
    );
}

#[test]
fn test_status_transitions() {
    let scheduler = Scheduler::new(config()).unwrap();
    let observed = Arc::new(AtomicBool::new(false));
    let o = observed.clone();
    let handle = scheduler
        .post_fn(
            move |ctx: &Context<'_>| {
                o.store(ctx.handle().status() == JobStatus::Running, Ordering::SeqCst);
            },
            WorkerMask::ANY,
        )
        .unwrap();
    assert_eq!(handle.status(), JobStatus::Ready);
    assert!(!handle.is_finished());

    scheduler.init_worker(8).unwrap();
    wait(&scheduler, &handle);
    assert!(observed.load(Ordering::SeqCst));
    assert_eq!(handle.status(), JobStatus::Success);
    assert!(handle.is_finished());
}

#[test]
fn test_nonzero_result_marks_failed_and_still_releases() {
    let scheduler = Scheduler::start(config()).unwrap();
    let failing = scheduler
        .post_fn(|_: &Context<'_>| 3, WorkerMask::ANY)
        .unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let next = failing
        .post_successor_fn(move |_: &Context<'_>| r.store(true, Ordering::SeqCst), WorkerMask::ANY)
        .unwrap();

    wait(&scheduler, &next);
    assert_eq!(failing.status(), JobStatus::Failed);
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(scheduler.metrics().jobs_failed, 1);
}

#[test]
fn test_expired_job_is_skipped_and_signal_fires() {
    let scheduler = Scheduler::new(config()).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let stale = scheduler
        .post_fn(move |_: &Context<'_>| r.store(true, Ordering::SeqCst), WorkerMask::ANY)
        .unwrap();
    stale.set_max_hold(Duration::from_millis(5));

    let pre = Arc::new(AtomicI32::new(i32::MIN));
    let p = pre.clone();
    let follower = scheduler
        .post_job_after(
            CompletorJob::new(move |_: &Context<'_>, result: i32| p.store(result, Ordering::SeqCst)),
            stale.signal(),
            WorkerMask::ANY,
        )
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert!(stale.is_timeout());
    scheduler.init_worker(8).unwrap();

    wait(&scheduler, &follower);
    assert_eq!(stale.status(), JobStatus::Expired);
    assert!(stale.signal().is_fired());
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(pre.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.metrics().jobs_expired, 1);
}

#[test]
fn test_sub_millisecond_hold_expires() {
    let scheduler = Scheduler::new(config()).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let stale = scheduler
        .post_fn(move |_: &Context<'_>| r.store(true, Ordering::SeqCst), WorkerMask::ANY)
        .unwrap();
    stale.set_max_hold(Duration::from_micros(500));

    thread::sleep(Duration::from_millis(20));
    scheduler.init_worker(8).unwrap();

    wait(&scheduler, &stale);
    assert_eq!(stale.status(), JobStatus::Expired);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_unexpired_job_runs() {
    let scheduler = Scheduler::start(config()).unwrap();
    let handle = scheduler.post_fn(|_: &Context<'_>| {}, WorkerMask::ANY).unwrap();
    handle.set_max_hold(Duration::from_secs(60));
    wait(&scheduler, &handle);
    assert_eq!(handle.status(), JobStatus::Success);
}

#[test]
fn test_abort_is_advisory() {
    struct Cancellable {
        aborted_hook: Arc<AtomicUsize>,
    }

    impl Job for Cancellable {
        fn execute(&self, ctx: &Context<'_>) -> i32 {
            if ctx.is_aborted() { 2 } else { 0 }
        }

        fn on_aborted(&self) {
            self.aborted_hook.fetch_add(1, Ordering::SeqCst);
        }
    }

    let scheduler = Scheduler::new(config()).unwrap();
    let hook = Arc::new(AtomicUsize::new(0));
    let handle = scheduler
        .post_job(
            Cancellable {
                aborted_hook: hook.clone(),
            },
            WorkerMask::ANY,
        )
        .unwrap();
    handle.abort();
    assert!(handle.is_aborted());
    assert_eq!(handle.status(), JobStatus::Ready);
    assert_eq!(hook.load(Ordering::SeqCst), 1);

    scheduler.init_worker(8).unwrap();
    wait(&scheduler, &handle);
    assert_eq!(handle.status(), JobStatus::Failed);
}

#[test]
fn test_completor_receives_predecessor_result_on_same_worker() {
    let scheduler = Scheduler::start(config()).unwrap();
    let pre = Arc::new(AtomicI32::new(i32::MIN));
    let same_worker = Arc::new(AtomicBool::new(false));

    let (p, s) = (pre.clone(), same_worker.clone());
    let driver = scheduler
        .post_fn(
            move |ctx: &Context<'_>| {
                let first = ctx.post_fn(|_: &Context<'_>| 7, WorkerMask::ANY_EXCEPT_MAIN).unwrap();
                let me = ctx.worker_id();
                let completor = first
                    .post_completor_fn(ctx, move |ctx: &Context<'_>, result: i32| {
                        p.store(result, Ordering::SeqCst);
                        s.store(ctx.worker_id() == me, Ordering::SeqCst);
                    })
                    .unwrap();
                assert_eq!(completor.worker_mask(), ctx.worker_mask());
                ctx.yield_for(completor.signal());
            },
            WorkerMask::ON_COMPUTE,
        )
        .unwrap();

    wait(&scheduler, &driver);
    assert_eq!(driver.status(), JobStatus::Success);
    assert_eq!(pre.load(Ordering::SeqCst), 7);
    assert!(same_worker.load(Ordering::SeqCst));
}

#[test]
fn test_successor_of_finished_job_runs_immediately() {
    let scheduler = Scheduler::start(config()).unwrap();
    let first = scheduler.post_fn(|_: &Context<'_>| {}, WorkerMask::ANY).unwrap();
    wait(&scheduler, &first);

    let second = first.post_successor_fn(|_: &Context<'_>| {}, WorkerMask::ANY).unwrap();
    wait(&scheduler, &second);
    assert_eq!(second.status(), JobStatus::Success);
}

#[test]
fn test_pre_condition_holds_back_signal() {
    let scheduler = Scheduler::start(config()).unwrap();
    let condition = turbofiber::CompletionSignal::with_pending(1);
    let gate = turbofiber::CompletionSignal::with_pending(1);
    let handle = scheduler
        .post_fn_after(|_: &Context<'_>| {}, &gate, WorkerMask::ANY)
        .unwrap();
    assert!(scheduler.add_pre_condition(handle.signal(), &condition));

    gate.trigger(0, &scheduler);
    let start = Instant::now();
    while !handle.is_finished() && start.elapsed() < Duration::from_secs(10) {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handle.status(), JobStatus::Success);
    assert!(!handle.signal().is_fired());

    condition.trigger(0, &scheduler);
    assert!(handle.signal().is_fired());
}
