//! Guest thread stacks and pending pthread calls.

use crate::error::Result;
use crate::memory::GuestMemory;
use crate::pages::{GUARD_REGION_SIZE, THREAD_STACK_SIZE};
use std::collections::HashMap;

// Space between a stack top and the end of its stack.
const STACK_TOP_OFFSET: u32 = 16;

/// A `pthread_create` the guest made that has not been dispatched yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthreadCall {
    /// Function-table index of the thread's entry point.
    pub entry_func: u32,
    /// Guest pointer to the entry point's argument.
    pub args_ptr: u32,
    /// Guest pointer to the `pthread_t`, used as the join handle.
    pub pthread_ptr: u32,
}

/// The stacks guest threads run on.
///
/// Every slot is laid out as `[guard][stack][guard]` and slots follow each
/// other directly, so all stacks form a single band of guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStacks {
    tops: Vec<u32>,
}

impl ThreadStacks {
    /// Grows `memory` by `pool_size` slots and guards each stack.
    pub fn provision(memory: &dyn GuestMemory, pool_size: usize) -> Result<Self> {
        let slot = THREAD_STACK_SIZE + 2 * GUARD_REGION_SIZE;
        let mut tops = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let base = memory.grow(slot)?;
            let top = base + (GUARD_REGION_SIZE + THREAD_STACK_SIZE) as u32 - STACK_TOP_OFFSET;
            memory.create_guard_region(base)?;
            memory.create_guard_region(top + STACK_TOP_OFFSET)?;
            tops.push(top);
        }
        log::debug!("created {pool_size} thread stacks");
        Ok(Self { tops })
    }

    /// Stack tops in slot order.
    pub fn tops(&self) -> &[u32] {
        &self.tops
    }

    /// Stack top of slot `idx`.
    pub fn top(&self, idx: usize) -> Option<u32> {
        self.tops.get(idx).copied()
    }

    /// Number of stacks.
    pub fn len(&self) -> usize {
        self.tops.len()
    }

    /// Whether there are no stacks.
    pub fn is_empty(&self) -> bool {
        self.tops.is_empty()
    }

    /// Start and length of the band holding every slot, guards included.
    pub fn band(&self) -> Option<(u32, usize)> {
        let first = *self.tops.first()?;
        let start = first + STACK_TOP_OFFSET - (THREAD_STACK_SIZE + GUARD_REGION_SIZE) as u32;
        let len = self.tops.len() * (THREAD_STACK_SIZE + 2 * GUARD_REGION_SIZE);
        Some((start, len))
    }

    /// Protects the guard regions again, for those lying below `limit`.
    pub(crate) fn reinstall_guards(&self, memory: &dyn GuestMemory, limit: usize) -> Result<()> {
        for top in &self.tops {
            let lower = top + STACK_TOP_OFFSET - (THREAD_STACK_SIZE + GUARD_REGION_SIZE) as u32;
            let upper = top + STACK_TOP_OFFSET;
            for guard in [lower, upper] {
                if guard as usize + GUARD_REGION_SIZE <= limit {
                    memory.create_guard_region(guard)?;
                }
            }
        }
        Ok(())
    }
}

/// Pthread calls queued by the guest's main thread and the scheduler calls
/// of those already dispatched.
#[derive(Debug, Default)]
pub(crate) struct PthreadState {
    pub(crate) queue: Vec<PthreadCall>,
    // pthread_ptr -> call id
    pub(crate) call_ids: HashMap<u32, u32>,
}
