//! Fiber slots: pooled stackful execution contexts.
//!
//! Each slot wraps a `corosensei` coroutine running the worker dispatch loop.
//! Fibers never switch to each other directly. A fiber yields a
//! [`FiberSwitch`] request to its worker's base loop (the thread's own stack),
//! which performs the switch and recycles the fiber that was left.

use crate::scheduler::SchedulerCore;
use crate::worker::WorkerSlot;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

/// Stable identity of a fiber, unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// What a worker hands a fiber each time it resumes it.
pub(crate) struct WorkerEnv {
    pub(crate) core: Arc<SchedulerCore>,
    pub(crate) worker: Arc<WorkerSlot>,
}

pub(crate) enum Resume {
    Run(WorkerEnv),
    /// The fiber is being torn down and must return.
    Shutdown,
}

/// Request a fiber yields to its worker's base loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberSwitch {
    /// Recycle the yielding fiber and resume a parked one.
    SwitchTo(FiberId),
    /// Park the yielding fiber and continue on a fresh one.
    Suspend,
    /// Recycle the yielding fiber and leave the worker loop.
    Exit,
}

pub(crate) type FiberYielder = Yielder<Resume, FiberSwitch>;

/// Body every fiber runs. Receives the fiber's own id.
pub(crate) type FiberEntry = fn(FiberId, &FiberYielder, Resume);

pub(crate) enum FiberState {
    Switched(FiberSwitch),
    Complete,
    Panic(Box<dyn Any + Send>),
}

/// A pooled execution context.
pub struct FiberSlot {
    id: FiberId,
    coroutine: Coroutine<Resume, FiberSwitch, (), DefaultStack>,
    created_at: Instant,
    resume_count: u64,
}

impl FiberSlot {
    pub(crate) fn new(id: FiberId, stack_size: usize, entry: FiberEntry) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, input: Resume| {
            entry(id, yielder, input)
        });
        Ok(FiberSlot {
            id,
            coroutine,
            created_at: Instant::now(),
            resume_count: 0,
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of times a worker has switched into this fiber.
    pub fn resume_count(&self) -> u64 {
        self.resume_count
    }

    pub fn is_done(&self) -> bool {
        self.coroutine.done()
    }

    /// Switches into the fiber until it yields a switch request or returns.
    pub(crate) fn resume(&mut self, input: Resume) -> FiberState {
        if self.coroutine.done() {
            return FiberState::Complete;
        }
        self.resume_count += 1;

        let result = catch_unwind(AssertUnwindSafe(|| self.coroutine.resume(input)));
        match result {
            Ok(CoroutineResult::Yield(switch)) => FiberState::Switched(switch),
            Ok(CoroutineResult::Return(())) => FiberState::Complete,
            Err(payload) => FiberState::Panic(payload),
        }
    }
}

impl fmt::Debug for FiberSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberSlot")
            .field("id", &self.id)
            .field("resume_count", &self.resume_count)
            .field("done", &self.coroutine.done())
            .finish()
    }
}

// The coroutine only captures Send state (Arcs and job handles), and a slot
// is resumed by one thread at a time.
unsafe impl Send for FiberSlot {}
