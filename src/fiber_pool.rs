use crate::error::Result;
use crate::fiber::{Fiber, FiberId, FiberState};
use std::collections::VecDeque;

/// The fixed arena of fibers owned by a job manager.
///
/// Fibers are created once, addressed by [`FiberId`] and never move, so the
/// id-to-fiber mapping is stable and total for the lifetime of the pool.
pub struct FiberPool {
    fibers: Box<[Fiber]>,
}

impl FiberPool {
    /// Creates `count` fibers, each with a dedicated stack of `stack_size` bytes.
    pub(crate) fn new(count: usize, stack_size: usize, owner: usize) -> Result<Self> {
        let fibers: Box<[Fiber]> = (0..count)
            .map(|index| Fiber::new(FiberId(index), owner))
            .collect();

        for fiber in fibers.iter() {
            // SAFETY: the boxed slice is in its final location and no fiber
            // has been dispatched yet.
            unsafe { fiber.install(stack_size)? };
        }

        Ok(FiberPool { fibers })
    }

    /// Every fiber id, in creation order. Used to seed the free list.
    pub(crate) fn initial_free_list(&self) -> VecDeque<FiberId> {
        self.fibers.iter().map(Fiber::id).collect()
    }

    pub(crate) fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(id.0)
    }

    /// Number of fibers in the pool.
    pub(crate) fn len(&self) -> usize {
        self.fibers.len()
    }

    /// Number of fibers currently in `state`.
    pub(crate) fn count_in(&self, state: FiberState) -> usize {
        self.fibers.iter().filter(|f| f.state() == state).count()
    }

    /// Releases every fiber stack that can safely be released.
    ///
    /// # Safety
    ///
    /// No thread may be running or resuming any fiber of this pool.
    pub(crate) unsafe fn release_stacks(&self) -> usize {
        let mut leaked = 0;
        for fiber in self.fibers.iter() {
            if fiber.state() != FiberState::Free {
                leaked += 1;
            }
            fiber.release_stack();
        }
        leaked
    }
}
