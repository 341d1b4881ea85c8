//! OpenMP nesting levels.
//!
//! Each parallel section runs its workers at a [`Level`]. The dispatcher
//! makes the level carried by a batch current on the worker thread while the
//! OpenMP task runs, so nested `omp_*` calls made by the guest see the right
//! team size and depth.

use serde_derive::{Deserialize, Serialize};
use std::cell::RefCell;

/// Default cap on nested active parallel sections.
pub const DEFAULT_MAX_ACTIVE_LEVEL: u32 = 1;

/// One level of OpenMP parallel nesting.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Level {
    /// Number of nested parallel sections including this one.
    pub depth: u32,
    /// Number of those sections that actually run in parallel.
    pub effective_depth: u32,
    /// Deepest level allowed to run in parallel.
    pub max_active_level: u32,
    /// Threads in this level's team.
    pub num_threads: u32,
}

impl Default for Level {
    fn default() -> Self {
        Self {
            depth: 0,
            effective_depth: 0,
            max_active_level: DEFAULT_MAX_ACTIVE_LEVEL,
            num_threads: 1,
        }
    }
}

impl Level {
    /// The outermost, sequential level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Level for a parallel section opened from this one with
    /// `num_threads` requested.
    ///
    /// Past `max_active_level` the section runs with a single thread.
    pub fn next_level(&self, num_threads: u32) -> Level {
        let active = num_threads > 1 && self.effective_depth < self.max_active_level;
        Level {
            depth: self.depth + 1,
            effective_depth: self.effective_depth + u32::from(active),
            max_active_level: self.max_active_level,
            num_threads: if active { num_threads } else { 1 },
        }
    }
}

thread_local!(static CURRENT: RefCell<Option<Level>> = const { RefCell::new(None) });

/// Runs `f` with `level` as the calling thread's level. The previous level
/// comes back once `f` returns or unwinds.
pub fn with_level<R>(level: Level, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Level>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            CURRENT.with(|c| *c.borrow_mut() = prev);
        }
    }

    log::trace!("openmp level depth {} threads {}", level.depth, level.num_threads);
    let _restore = Restore(CURRENT.with(|c| c.replace(Some(level))));
    f()
}

/// Level of the calling thread, if one is in effect.
pub fn current_level() -> Option<Level> {
    CURRENT.with(|c| c.borrow().clone())
}
