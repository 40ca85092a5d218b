//! # Lock Ordering Discipline for Deadlock Prevention
//!
//! All collector locks are acquired in increasing level:
//!
//! | Level | Lock            | Holder                                        |
//! |-------|-----------------|-----------------------------------------------|
//! | 1     | `Transition`    | phase transitions, detector passes, registry  |
//! | 2     | `WorkerSlot`    | a worker's own GC-atomic region; every slot during stop-the-world |
//! | 3     | `SpanTable`     | span creation, bitmap slice hand-out, sweeping |
//! | 4     | `Arenas`        | swapping the marking and live arenas          |
//!
//! Several `WorkerSlot` locks may be held together (stop-the-world, detector
//! visits); nothing below level 2 may be taken while one is held. In
//! particular a worker holding its own slot must never request a transition.
//!
//! ## Validation
//!
//! In debug builds each tracked acquisition pushes its level on a
//! thread-local stack and panics if a lower level is taken while a higher one
//! is held. Release builds compile this away.
//!
//! ```
//! use ragged_gc::gc::sync::{LockGuard, LockOrder};
//!
//! let _transition = LockGuard::new(LockOrder::Transition);
//! let _slot = LockGuard::new(LockOrder::WorkerSlot);
//! let _table = LockGuard::new(LockOrder::SpanTable);
//! ```

#[cfg(debug_assertions)]
use std::cell::RefCell;

#[cfg(debug_assertions)]
const MAX_LOCK_DEPTH: usize = 16;

#[cfg(debug_assertions)]
thread_local!(static HELD_LEVELS: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// The transition lock (level 1).
    Transition = 1,
    /// A worker slot (level 2).
    WorkerSlot = 2,
    /// The span table write lock (level 3).
    SpanTable = 3,
    /// The arena pair (level 4).
    Arenas = 4,
}

impl LockOrder {
    /// Level of this lock in the hierarchy.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// RAII marker that records a tracked acquisition for validation.
///
/// Create it immediately before taking the lock it describes and keep it
/// alive for as long as the lock is held.
#[must_use = "LockGuard must be held for the duration of the critical section"]
#[derive(Debug)]
pub struct LockGuard {
    tag: LockOrder,
}

impl LockGuard {
    /// Validate and record acquisition of `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held by
    /// this thread.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let _ = HELD_LEVELS.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(&highest) = held.iter().max() {
                    assert!(
                        tag.level() >= highest,
                        "Lock ordering violation: {tag:?} (level {}) acquired while holding level {highest}",
                        tag.level()
                    );
                }
                held.push(tag.level());
            });
        }
        Self { tag }
    }

    /// The tracked lock.
    #[must_use]
    pub const fn tag(&self) -> LockOrder {
        self.tag
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let level = self.tag.level();
        let _ = HELD_LEVELS.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&l| l == level) {
                held.remove(pos);
            }
        });
    }
}

/// Highest level currently held by this thread, if any.
#[cfg(debug_assertions)]
#[must_use]
pub fn highest_held_level() -> Option<u8> {
    HELD_LEVELS
        .try_with(|held| held.borrow().iter().copied().max())
        .ok()
        .flatten()
}
