//! Worker threads and the fiber dispatch loop.
//!
//! Each worker thread runs a base loop on its own stack. The base loop owns
//! the fiber currently running on the worker plus every fiber parked there,
//! and performs the switches fibers ask for. Inside each fiber runs the
//! dispatch loop, which picks the next piece of work in this order:
//! pending-local job, due periodic fiber, ready fiber, global job.

use crate::affinity::{WorkerId, WorkerMask};
use crate::context::Context;
use crate::fiber::{FiberId, FiberSlot, FiberState, FiberSwitch, FiberYielder, Resume, WorkerEnv};
use crate::handle::JobHandle;
use crate::job::JobStatus;
use crate::profiler::{CollectorGuard, TraceGuard};
use crate::scheduler::{SchedulerCore, Work};
use parking_lot::Condvar;
use std::collections::HashMap;
use std::io;
use std::panic::resume_unwind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Shared state of one worker thread.
pub(crate) struct WorkerSlot {
    id: WorkerId,
    name: String,
    stopped: AtomicBool,
    exited: AtomicBool,
    /// Set while the base loop drops its parked fibers.
    unwinding: AtomicBool,
    /// Paired with the scheduler's queue lock.
    wake: Condvar,
}

impl WorkerSlot {
    pub(crate) fn new(id: WorkerId, name: String) -> Self {
        WorkerSlot {
            id,
            name,
            stopped: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            unwinding: AtomicBool::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn mask(&self) -> WorkerMask {
        self.id.mask()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// True while parked fibers are being force-unwound. Panics seen by
    /// jobs in that window belong to the unwind and must not be caught.
    pub(crate) fn is_unwinding(&self) -> bool {
        self.unwinding.load(Ordering::Acquire)
    }

    fn begin_unwinding(&self) {
        self.unwinding.store(true, Ordering::Release);
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn condvar(&self) -> &Condvar {
        &self.wake
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Marks the worker exited however its thread leaves, panics included.
struct ExitGuard(Arc<WorkerSlot>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited.store(true, Ordering::Release);
    }
}

/// Starts the OS thread for `worker`, optionally pinned to `core`.
pub(crate) fn spawn(
    core: Arc<SchedulerCore>,
    worker: Arc<WorkerSlot>,
    pin: Option<core_affinity::CoreId>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(worker.name().to_string())
        .spawn(move || {
            if let Some(core_id) = pin {
                if !core_affinity::set_for_current(core_id) {
                    tracing::warn!(worker = %worker.id(), core = core_id.id, "failed to pin worker");
                }
            }
            let _exit = ExitGuard(worker.clone());
            let _collector = CollectorGuard;
            tracing::debug!(worker = %worker.id(), name = worker.name(), "worker started");
            run(core, worker);
        })
}

/// Base loop: resumes fibers and carries out their switch requests.
fn run(core: Arc<SchedulerCore>, worker: Arc<WorkerSlot>) {
    let id = worker.id();
    let mut parked: HashMap<FiberId, Box<FiberSlot>> = HashMap::new();
    let mut current = match core.fetch_fiber() {
        Ok(fiber) => fiber,
        Err(e) => {
            tracing::error!(worker = %id, error = %e, "no fiber for worker, exiting");
            return;
        }
    };

    loop {
        let env = WorkerEnv {
            core: core.clone(),
            worker: worker.clone(),
        };
        match current.resume(Resume::Run(env)) {
            FiberState::Switched(FiberSwitch::SwitchTo(target)) => {
                let Some(next) = parked.remove(&target) else {
                    panic!("worker {} asked to resume unknown {}", id, target);
                };
                core.metrics().record_resumption();
                let previous = std::mem::replace(&mut current, next);
                core.free_fiber(previous);
            }
            FiberState::Switched(FiberSwitch::Suspend) => {
                let fresh = match core.fetch_fiber() {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        tracing::error!(worker = %id, error = %e, "fiber allocation failed, worker exiting");
                        worker.stop();
                        parked.insert(current.id(), current);
                        break;
                    }
                };
                let suspended = std::mem::replace(&mut current, fresh);
                tracing::trace!(worker = %id, fiber = %suspended.id(), "fiber parked");
                parked.insert(suspended.id(), suspended);
            }
            FiberState::Switched(FiberSwitch::Exit) => {
                core.free_fiber(current);
                break;
            }
            FiberState::Complete => {
                tracing::error!(worker = %id, fiber = %current.id(), "dispatch loop returned unexpectedly");
                break;
            }
            FiberState::Panic(payload) => {
                tracing::error!(worker = %id, fiber = %current.id(), "panic escaped the dispatch loop");
                worker.stop();
                worker.begin_unwinding();
                drop(std::mem::take(&mut parked));
                resume_unwind(payload);
            }
        }
    }

    if !parked.is_empty() {
        tracing::debug!(worker = %id, parked = parked.len(), "unwinding parked fibers");
    }
    // Dropping a suspended coroutine unwinds its stack.
    worker.begin_unwinding();
    drop(parked);
    tracing::debug!(worker = %id, "worker exited");
}

/// Body of every fiber. Returns only when resumed with `Resume::Shutdown`.
pub(crate) fn fiber_main(fiber: FiberId, yielder: &FiberYielder, mut input: Resume) {
    loop {
        let env = match input {
            Resume::Run(env) => env,
            Resume::Shutdown => return,
        };
        let switch = dispatch(fiber, yielder, &env);
        // Pooled fibers must not keep the scheduler alive.
        drop(env);
        input = yielder.suspend(switch);
    }
}

/// Runs jobs inline until the worker must switch to another fiber or stop.
fn dispatch(fiber: FiberId, yielder: &FiberYielder, env: &WorkerEnv) -> FiberSwitch {
    loop {
        if env.worker.is_stopped() {
            return FiberSwitch::Exit;
        }
        match env.core.next_work(&env.worker) {
            Some(Work::Job(handle)) => run_job(fiber, yielder, env, handle),
            Some(Work::Fiber(target)) => {
                tracing::trace!(worker = %env.worker.id(), from = %fiber, to = %target, "switching fiber");
                return FiberSwitch::SwitchTo(target);
            }
            None => {}
        }
    }
}

fn run_job(fiber: FiberId, yielder: &FiberYielder, env: &WorkerEnv, handle: JobHandle) {
    let core = &env.core;
    let worker = env.worker.id();

    if handle.is_timeout() {
        tracing::debug!(worker = %worker, hold = ?handle.max_hold(), "job expired before dispatch");
        handle.set_status(JobStatus::Expired);
        core.metrics().record_expired();
        handle.signal().trigger(0, &**core);
        return;
    }

    let ctx = Context::new(env, fiber, yielder, &handle);
    let result = {
        let _span = core
            .config()
            .trace_jobs
            .then(|| TraceGuard::new("job", worker.index()));
        handle.execute(&ctx)
    };
    tracing::trace!(worker = %worker, %fiber, result, "job finished");
    core.metrics().record_executed(result);
    handle.signal().trigger(result, &**core);
}
