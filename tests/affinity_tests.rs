use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use turbofiber::{
    Context, PinningStrategy, Scheduler, SchedulerConfig, SchedulerError, WorkerId, WorkerMask,
    WorkerRole,
};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        stack_size: 128 * 1024,
        ..SchedulerConfig::default()
    }
}

fn wait(scheduler: &Scheduler, handle: &turbofiber::JobHandle) {
    assert!(
        scheduler
            .block_on_timeout(handle.signal(), Duration::from_secs(10))
            .unwrap()
    );
}

/// Posts `count` jobs with `mask` and returns the set of workers that ran them.
fn workers_used(scheduler: &Scheduler, mask: WorkerMask, count: usize) -> HashSet<u32> {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let handles: Vec<_> = (0..count)
        .map(|_| {
            let seen = seen.clone();
            scheduler
                .post_fn(
                    move |ctx: &Context<'_>| {
                        assert!(ctx.worker_mask().intersects(WorkerMask::ANY));
                        seen.lock().unwrap().insert(ctx.worker_id().0);
                    },
                    mask,
                )
                .unwrap()
        })
        .collect();
    for handle in &handles {
        wait(scheduler, handle);
        assert!(mask.contains(handle.worker_id().unwrap()));
    }
    let seen = seen.lock().unwrap().clone();
    seen
}

#[test]
fn test_single_worker_mask() {
    let scheduler = Scheduler::start(config()).unwrap();
    let used = workers_used(&scheduler, WorkerMask::ON_RENDER, 50);
    assert_eq!(used, HashSet::from([WorkerRole::Render as u32]));
}

#[test]
fn test_io_mask_stays_on_io_workers() {
    let scheduler = Scheduler::start(config()).unwrap();
    let used = workers_used(&scheduler, WorkerMask::IO, 200);
    assert!(!used.is_empty());
    assert!(used.is_subset(&HashSet::from([3, 4])));
}

#[test]
fn test_any_except_main_never_uses_main() {
    let scheduler = Scheduler::start(config()).unwrap();
    let used = workers_used(&scheduler, WorkerMask::ANY_EXCEPT_MAIN, 500);
    assert!(!used.contains(&0));
}

#[test]
fn test_worker_roles_reported() {
    let scheduler = Scheduler::start(config()).unwrap();
    let role = Arc::new(Mutex::new(None));
    let role_clone = role.clone();
    let handle = scheduler
        .post_fn(
            move |ctx: &Context<'_>| {
                *role_clone.lock().unwrap() = ctx.worker_role();
            },
            WorkerMask::ON_SHARED_2,
        )
        .unwrap();
    wait(&scheduler, &handle);
    assert_eq!(*role.lock().unwrap(), Some(WorkerRole::Shared2));
    assert_eq!(handle.worker_id(), Some(WorkerId(6)));
}

#[test]
fn test_extra_workers_beyond_roles() {
    let scheduler = Scheduler::start(SchedulerConfig {
        worker_count: 12,
        ..config()
    })
    .unwrap();
    assert_eq!(scheduler.worker_count(), 12);
    let used = workers_used(&scheduler, WorkerId(11).mask(), 10);
    assert_eq!(used, HashSet::from([11]));

    let err = scheduler
        .post_fn(|_: &Context<'_>| {}, WorkerId(20).mask())
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoMatchingWorker(_)));
}

#[test]
fn test_pinning_strategies_start() {
    for pinning in [
        PinningStrategy::None,
        PinningStrategy::Linear,
        PinningStrategy::AvoidSMT,
    ] {
        let scheduler = Scheduler::start(SchedulerConfig { pinning, ..config() }).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let executed = executed.clone();
                scheduler
                    .post_fn(
                        move |_: &Context<'_>| {
                            executed.fetch_add(1, Ordering::SeqCst);
                        },
                        WorkerMask::ANY,
                    )
                    .unwrap()
            })
            .collect();
        for handle in &handles {
            wait(&scheduler, handle);
        }
        assert_eq!(executed.load(Ordering::SeqCst), 100);
        scheduler.shut_down().unwrap();
    }
}
