//! Ragged-barrier termination detection.
//!
//! Marking is complete when no grey reference exists anywhere: not in the
//! global queue, not in any local queue, not in any write-barrier buffer.
//! Workers cannot be inspected while they run, so a pass visits them one at
//! a time at their safe-points and flushes each one's local work to the
//! global queue. A worker's flushed flag records whether it published work
//! since the detector last looked. If the global queue was empty when the
//! pass began and no visited worker had flushed, every grey reference that
//! existed at the start of the pass has been drained, and none could have
//! been created without a flush.
//!
//! One path escapes the flags: a worker already visited in this pass can
//! grey an object it reached through an unvisited worker's unscanned grey
//! object, for instance via a deletion barrier on a field it just read. That
//! grey object sits in the visited worker's own queue and never sets a flag
//! the pass will read. Such a worker taints the pass before setting the mark
//! bit, and a tainted pass does not certify termination.

#[cfg(loom)]
use loom::sync::atomic::AtomicU64;
#[cfg(not(loom))]
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::phase::Phase;
use super::worker::{WorkerLocal, WorkerSlot};
use super::worklist::GlobalQueue;
use crate::error::{InvariantViolation, WorkerSnapshot};

/// What a detector pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorOutcome {
    /// The global queue held work when the pass began; no worker was visited.
    GlobalWorkPending,
    /// This many visited workers had published work since the last pass.
    FlushedWork {
        /// Workers whose flag was set.
        workers: usize,
    },
    /// A visited worker greyed an object while the pass was still open.
    Tainted,
    /// No grey reference exists.
    Terminated,
}

impl DetectorOutcome {
    /// Whether marking is complete.
    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// The pass word and pass numbering.
///
/// The pass word holds `pass << 1 | tainted` while a pass is open and 0
/// otherwise. Built with `--cfg loom`, the word is a loom atomic so the
/// open, taint and close protocol can be model-checked directly.
#[derive(Debug)]
pub struct TerminationDetector {
    pass: AtomicU64,
    next_pass: AtomicU64,
}

impl Default for TerminationDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationDetector {
    /// A detector with no pass open.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new() -> Self {
        Self {
            pass: AtomicU64::new(0),
            next_pass: AtomicU64::new(1),
        }
    }

    /// Open the next pass and return its number.
    pub fn open_pass(&self) -> u64 {
        let id = self.next_pass.fetch_add(1, Ordering::Relaxed);
        self.pass.store(id << 1, Ordering::SeqCst);
        id
    }

    /// Close pass `id`. Returns `true` if nobody tainted it.
    pub fn close_pass(&self, id: u64) -> bool {
        match self
            .pass
            .compare_exchange(id << 1, 0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(_) => {
                self.pass.store(0, Ordering::SeqCst);
                false
            }
        }
    }

    /// Called by a worker that is about to grey an object. If the worker was
    /// visited by the pass that is still open, that pass is tainted.
    ///
    /// Returns `true` if this call set the taint bit.
    #[inline]
    pub fn note_production(&self, visited_pass: u64) -> bool {
        if visited_pass == 0 {
            return false;
        }
        let open = visited_pass << 1;
        self.pass
            .compare_exchange(open, open | 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Run one pass over `slots`.
    ///
    /// `visit` is applied to each worker while its slot is locked; it must
    /// move all of the worker's grey work to `global`. The caller holds the
    /// transition lock, so the set of slots cannot change during the pass.
    pub(crate) fn run_pass<'a>(
        &self,
        global: &GlobalQueue,
        slots: impl IntoIterator<Item = &'a WorkerSlot>,
        mut visit: impl FnMut(&mut WorkerLocal),
    ) -> DetectorOutcome {
        if !global.is_empty() {
            return DetectorOutcome::GlobalWorkPending;
        }

        let pass = self.open_pass();
        let mut flushed = 0;
        for slot in slots {
            let mut local = slot.lock();
            visit(&mut local);
            if local.take_flushed() {
                flushed += 1;
            }
            local.visited_pass = pass;
        }
        let untainted = self.close_pass(pass);

        if flushed > 0 {
            DetectorOutcome::FlushedWork { workers: flushed }
        } else if untainted {
            DetectorOutcome::Terminated
        } else {
            DetectorOutcome::Tainted
        }
    }
}

/// Check, with every worker stopped, that marking left no grey reference
/// and no unmarked allocation behind.
///
/// # Errors
///
/// Returns the full worker state when any worker is dirty or the global
/// queue is not empty.
pub fn check_quiescent(
    phase: Phase,
    cycle: u64,
    global: &GlobalQueue,
    workers: Vec<WorkerSnapshot>,
) -> Result<(), InvariantViolation> {
    if global.is_empty() && !workers.iter().any(WorkerSnapshot::is_dirty) {
        return Ok(());
    }
    Err(InvariantViolation {
        phase,
        cycle,
        global_batches: global.batch_count(),
        global_items: global.item_count(),
        workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::worker::{WorkerId, WorkerKind};
    use crate::gc::worklist::GreyRef;
    use crate::heap::ObjectRef;

    fn slot(id: u64) -> WorkerSlot {
        WorkerSlot::new(WorkerId(id), WorkerKind::Mutator, 8)
    }

    fn grey(addr: usize) -> GreyRef {
        GreyRef::Object(ObjectRef::from_addr(addr).unwrap())
    }

    fn flush_all(global: &GlobalQueue) -> impl FnMut(&mut WorkerLocal) + '_ {
        move |local| {
            local.drain_barrier();
            local.flush_to_global(global, 16);
        }
    }

    #[test]
    fn test_pending_global_work_skips_visits() {
        let detector = TerminationDetector::new();
        let global = GlobalQueue::new();
        global.push_all(vec![grey(16)], 4);
        let workers = [slot(1)];

        let outcome = detector.run_pass(&global, workers.iter(), flush_all(&global));
        assert_eq!(outcome, DetectorOutcome::GlobalWorkPending);
        assert_eq!(workers[0].lock().visited_pass, 0);
    }

    #[test]
    fn test_held_grey_blocks_then_drained_terminates() {
        let detector = TerminationDetector::new();
        let global = GlobalQueue::new();
        let workers = [slot(1), slot(2)];
        workers[1].lock().queue.push(grey(16));

        let outcome = detector.run_pass(&global, workers.iter(), flush_all(&global));
        assert_eq!(outcome, DetectorOutcome::FlushedWork { workers: 1 });

        // Worker 2 takes its work back and drains it.
        assert_eq!(global.pop().map(|b| b.len()), Some(1));

        let outcome = detector.run_pass(&global, workers.iter(), flush_all(&global));
        assert_eq!(outcome, DetectorOutcome::Terminated);
    }

    #[test]
    fn test_production_after_visit_taints_open_pass() {
        let detector = TerminationDetector::new();
        let global = GlobalQueue::new();
        let workers = [slot(1), slot(2)];

        let mut visited = 0;
        let outcome = detector.run_pass(&global, workers.iter(), |local| {
            visited += 1;
            if visited == 2 {
                // Worker 1 was already visited by this pass and greys
                // something before the pass closes.
                let first = workers[0].local_for_test_pass();
                assert!(detector.note_production(first));
            }
            local.flush_to_global(&global, 16);
        });
        assert_eq!(outcome, DetectorOutcome::Tainted);
    }

    #[test]
    fn test_production_after_close_does_not_taint_next_pass() {
        let detector = TerminationDetector::new();
        let global = GlobalQueue::new();
        let workers = [slot(1)];

        assert!(detector
            .run_pass(&global, workers.iter(), flush_all(&global))
            .is_terminated());
        let stale = workers[0].local_for_test_pass();
        assert!(!detector.note_production(stale));
        assert!(detector
            .run_pass(&global, workers.iter(), flush_all(&global))
            .is_terminated());
    }

    #[test]
    fn test_quiescence_check_reports_dirty_workers() {
        let global = GlobalQueue::new();
        let clean = WorkerLocal::new(8).snapshot(WorkerId(1), WorkerKind::Background, 0);
        assert!(check_quiescent(Phase::ConcurrentMark, 1, &global, vec![clean.clone()]).is_ok());

        let mut local = WorkerLocal::new(8);
        local.queue.push(grey(32));
        let dirty = local.snapshot(WorkerId(2), WorkerKind::Mutator, 0);
        let err = check_quiescent(Phase::ConcurrentMark, 1, &global, vec![clean.clone(), dirty]).unwrap_err();
        assert_eq!(err.workers.len(), 2);
        assert_eq!(err.global_items, 0);

        global.push_all(vec![grey(48)], 4);
        let err = check_quiescent(Phase::ConcurrentMark, 1, &global, vec![clean]).unwrap_err();
        assert_eq!(err.global_items, 1);
    }

    impl WorkerSlot {
        /// Pass recorded by the detector. Only safe to call while the slot
        /// is not locked by the caller.
        fn local_for_test_pass(&self) -> u64 {
            self.lock().visited_pass
        }
    }
}
