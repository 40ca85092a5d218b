//! Collector metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics from the most recently completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleMetrics {
    /// Cycle number.
    pub cycle: u64,
    /// Time from the start of concurrent marking to mark termination.
    pub mark_duration: Duration,
    /// Time the world was stopped at mark termination.
    pub termination_pause: Duration,
    /// Detector passes run during the cycle.
    pub detector_passes: u64,
    /// Marked slots in surviving spans.
    pub live_objects: usize,
    /// Bytes of marked slots in surviving spans.
    pub live_bytes: usize,
    /// Spans returned to the system allocator.
    pub spans_freed: usize,
    /// Spans kept for the next epoch.
    pub spans_retained: usize,
    /// Whether the cycle was finished by the last-resort stop-the-world
    /// collection.
    pub stop_the_world: bool,
}

/// Times the two halves of a cycle.
///
/// ```
/// use ragged_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... concurrent marking ...
/// timer.end_mark();
/// timer.start();
/// // ... mark termination ...
/// timer.end_termination();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated concurrent-mark time.
    pub mark: Duration,
    /// Accumulated termination pause time.
    pub termination: Duration,
    started: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with nothing recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            termination: Duration::ZERO,
            started: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stop timing and attribute the time to marking.
    pub fn end_mark(&mut self) {
        let elapsed = self.elapsed();
        self.mark += elapsed;
    }

    /// Stop timing and attribute the time to the termination pause.
    pub fn end_termination(&mut self) {
        let elapsed = self.elapsed();
        self.termination += elapsed;
    }

    /// Mark plus termination time.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.termination
    }

    fn elapsed(&mut self) -> Duration {
        self.started.take().map_or(Duration::ZERO, |t| t.elapsed())
    }
}

/// Cumulative counters for one collector.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    cycles_completed: AtomicU64,
    stop_the_world_collections: AtomicU64,
    arenas_created: AtomicU64,
    arenas_recycled: AtomicU64,
    detector_passes: AtomicU64,
    detector_global_pending: AtomicU64,
    detector_flushed: AtomicU64,
    detector_tainted: AtomicU64,
    objects_scanned: AtomicU64,
    assist_units: AtomicU64,
    spans_freed: AtomicUsize,
    finalizers_queued: AtomicU64,
    termination_pause_ns: AtomicU64,
    last_cycle: Mutex<CycleMetrics>,
}

impl CollectorMetrics {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cycles whose mark termination has finished.
    #[inline]
    #[must_use]
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Cycles finished by the last-resort stop-the-world collection.
    #[inline]
    #[must_use]
    pub fn stop_the_world_collections(&self) -> u64 {
        self.stop_the_world_collections.load(Ordering::Relaxed)
    }

    /// Arenas obtained for new cycles, fresh or recycled.
    #[inline]
    #[must_use]
    pub fn arena_acquisitions(&self) -> u64 {
        self.arenas_created() + self.arenas_recycled()
    }

    /// Mark arenas allocated fresh.
    #[inline]
    #[must_use]
    pub fn arenas_created(&self) -> u64 {
        self.arenas_created.load(Ordering::Relaxed)
    }

    /// Mark arenas reused from an earlier cycle.
    #[inline]
    #[must_use]
    pub fn arenas_recycled(&self) -> u64 {
        self.arenas_recycled.load(Ordering::Relaxed)
    }

    /// Detector passes run, whatever their outcome.
    #[inline]
    #[must_use]
    pub fn detector_passes(&self) -> u64 {
        self.detector_passes.load(Ordering::Relaxed)
    }

    /// Passes abandoned because the global queue was not empty.
    #[inline]
    #[must_use]
    pub fn detector_global_pending(&self) -> u64 {
        self.detector_global_pending.load(Ordering::Relaxed)
    }

    /// Passes that found a flushed flag set.
    #[inline]
    #[must_use]
    pub fn detector_flushed(&self) -> u64 {
        self.detector_flushed.load(Ordering::Relaxed)
    }

    /// Passes tainted by post-visit grey production.
    #[inline]
    #[must_use]
    pub fn detector_tainted(&self) -> u64 {
        self.detector_tainted.load(Ordering::Relaxed)
    }

    /// Grey references processed by any worker.
    #[inline]
    #[must_use]
    pub fn objects_scanned(&self) -> u64 {
        self.objects_scanned.load(Ordering::Relaxed)
    }

    /// Units of mark work done by allocating mutators.
    #[inline]
    #[must_use]
    pub fn assist_units(&self) -> u64 {
        self.assist_units.load(Ordering::Relaxed)
    }

    /// Spans freed across all cycles.
    #[inline]
    #[must_use]
    pub fn spans_freed(&self) -> usize {
        self.spans_freed.load(Ordering::Relaxed)
    }

    /// Objects sent to the finalizer queue.
    #[inline]
    #[must_use]
    pub fn finalizers_queued(&self) -> u64 {
        self.finalizers_queued.load(Ordering::Relaxed)
    }

    /// Sum of all mark-termination pauses.
    #[inline]
    #[must_use]
    pub fn total_termination_pause(&self) -> Duration {
        Duration::from_nanos(self.termination_pause_ns.load(Ordering::Relaxed))
    }

    /// Statistics of the last completed cycle.
    #[must_use]
    pub fn last_cycle(&self) -> CycleMetrics {
        *self.last_cycle.lock()
    }

    pub(crate) fn record_arena(&self, recycled: bool) {
        if recycled {
            self.arenas_recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.arenas_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_pass(&self, outcome: crate::gc::DetectorOutcome) {
        use crate::gc::DetectorOutcome;

        self.detector_passes.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DetectorOutcome::GlobalWorkPending => &self.detector_global_pending,
            DetectorOutcome::FlushedWork { .. } => &self.detector_flushed,
            DetectorOutcome::Tainted => &self.detector_tainted,
            DetectorOutcome::Terminated => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scanned(&self, objects: usize) {
        if objects > 0 {
            self.objects_scanned
                .fetch_add(objects as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_assist(&self, units: usize) {
        self.assist_units.fetch_add(units as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_finalizers(&self, queued: usize) {
        self.finalizers_queued
            .fetch_add(queued as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle(&self, cycle: CycleMetrics) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        if cycle.stop_the_world {
            self.stop_the_world_collections
                .fetch_add(1, Ordering::Relaxed);
        }
        self.spans_freed
            .fetch_add(cycle.spans_freed, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        self.termination_pause_ns
            .fetch_add(cycle.termination_pause.as_nanos() as u64, Ordering::Relaxed);
        *self.last_cycle.lock() = cycle;
    }
}
