use crate::fiber::{FiberEntry, FiberId, FiberSlot};
use std::io;

/// Free list of idle fibers shared by all workers.
///
/// Grows on demand and never shrinks until [`drain`](Self::drain) at shutdown.
/// Only fibers that have switched away are returned here, so a fiber handed
/// out by [`get`](Self::get) is never running on another worker.
pub(crate) struct FiberPool {
    pool: Vec<Box<FiberSlot>>,
    stack_size: usize,
    entry: FiberEntry,
    next_id: u64,
}

impl FiberPool {
    pub(crate) fn new(stack_size: usize, entry: FiberEntry) -> Self {
        FiberPool {
            pool: Vec::new(),
            stack_size,
            entry,
            next_id: 0,
        }
    }

    /// Takes an idle fiber, creating one if the pool is empty.
    ///
    /// The flag is `true` when the fiber was freshly allocated.
    pub(crate) fn get(&mut self) -> io::Result<(Box<FiberSlot>, bool)> {
        if let Some(fiber) = self.pool.pop() {
            return Ok((fiber, false));
        }
        let id = FiberId(self.next_id);
        let fiber = FiberSlot::new(id, self.stack_size, self.entry)?;
        self.next_id += 1;
        Ok((Box::new(fiber), true))
    }

    /// Returns a fiber to the pool for reuse.
    pub(crate) fn return_fiber(&mut self, fiber: Box<FiberSlot>) {
        debug_assert!(!fiber.is_done(), "finished fiber returned to the pool");
        self.pool.push(fiber);
    }

    /// Number of idle fibers.
    pub(crate) fn len(&self) -> usize {
        self.pool.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Total fibers ever created by this pool.
    #[cfg(test)]
    fn created(&self) -> u64 {
        self.next_id
    }

    pub(crate) fn drain(&mut self) -> Vec<Box<FiberSlot>> {
        std::mem::take(&mut self.pool)
    }
}
