//! Phase coordination.
//!
//! Every transition runs under the transition lock, re-checks the phase it
//! was asked to leave, and does the whole of its work before releasing the
//! lock:
//!
//! - `Off -> ConcurrentMark`: give the new cycle a mark arena, hand every
//!   span a slice of it, turn the barrier on, wait until each worker has
//!   passed a safe-point, then seed the global queue with root jobs.
//! - `ConcurrentMark -> MarkTermination`: only when a detector pass
//!   terminates. Every worker is stopped, the heap is checked for
//!   quiescence, termination roots are scanned, unmarked spans are freed and
//!   the marking arena becomes the live arena.
//! - `MarkTermination -> Off`: reset the trigger and schedule finalizer
//!   checks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::mark::MarkArena;
use super::marker::{self, WorkerPark};
use super::phase::{Phase, PhaseCell, PhaseState, Transition};
use super::sync::{LockGuard, LockOrder};
use super::termination::{check_quiescent, DetectorOutcome, TerminationDetector};
use super::tracing::{log_detector_pass, log_finalizers, log_sweep, log_transition};
use super::worker::{SlotGuard, WorkerId, WorkerKind, WorkerLocal, WorkerSlot};
use super::worklist::{GlobalQueue, GreyRef};
use crate::config::GcConfig;
use crate::finalizer::Finalizers;
use crate::graph::{ObjectGraph, RootClass};
use crate::heap::{ObjectRef, SpanTable, SweepOutcome};
use crate::metrics::{CollectorMetrics, CycleMetrics, PhaseTimer};

/// Mark arenas by role.
#[derive(Debug, Default)]
pub(crate) struct ArenaPair {
    /// Arena of the cycle in progress; `None` outside concurrent marking.
    pub(crate) marking: Option<Arc<MarkArena>>,
    /// Arena of the last completed cycle. Its clear bits are free slots.
    pub(crate) live: Option<Arc<MarkArena>>,
}

/// Bookkeeping for the cycle in progress.
struct CycleRecord {
    cycle: u64,
    timer: PhaseTimer,
    passes_at_start: u64,
    sweep: SweepOutcome,
    stop_the_world: bool,
    #[cfg(feature = "tracing")]
    gc_id: crate::tracing::GcId,
}

/// State only touched under the transition lock.
pub(crate) struct TransitionState {
    workers: Vec<Arc<WorkerSlot>>,
    /// Marking state for the coordinator's own draining.
    scratch: WorkerLocal,
    /// Arena of the previous live epoch, zeroed and reused for the next
    /// cycle once nobody reads it.
    spare_arena: Option<MarkArena>,
    cycle: Option<CycleRecord>,
}

struct TransitionGuard<'a> {
    state: MutexGuard<'a, TransitionState>,
    _order: LockGuard,
}

/// Shared collector state.
pub(crate) struct CollectorInner {
    pub(crate) config: GcConfig,
    pub(crate) graph: Arc<dyn ObjectGraph>,
    pub(crate) phase: PhaseCell,
    pub(crate) barrier_active: AtomicBool,
    pub(crate) spans: SpanTable,
    pub(crate) arenas: RwLock<ArenaPair>,
    pub(crate) global: GlobalQueue,
    pub(crate) detector: TerminationDetector,
    pub(crate) finalizers: Finalizers,
    pub(crate) metrics: CollectorMetrics,
    pub(crate) park: WorkerPark,
    transition: Mutex<TransitionState>,
    cycle_requested: AtomicBool,
    allocated_since_cycle: AtomicUsize,
    trigger_bytes: AtomicUsize,
    completed_cycle: AtomicU64,
    next_worker_id: AtomicU64,
    shutdown: AtomicBool,
}

impl CollectorInner {
    pub(crate) fn new(config: GcConfig, graph: Arc<dyn ObjectGraph>) -> Self {
        let trigger = config.next_trigger(0).unwrap_or(usize::MAX);
        Self {
            spans: SpanTable::new(config.max_heap_bytes),
            transition: Mutex::new(TransitionState {
                workers: Vec::new(),
                scratch: WorkerLocal::new(config.barrier_buffer_capacity),
                spare_arena: None,
                cycle: None,
            }),
            config,
            graph,
            phase: PhaseCell::new(),
            barrier_active: AtomicBool::new(false),
            arenas: RwLock::new(ArenaPair::default()),
            global: GlobalQueue::new(),
            detector: TerminationDetector::new(),
            finalizers: Finalizers::new(),
            metrics: CollectorMetrics::new(),
            park: WorkerPark::default(),
            cycle_requested: AtomicBool::new(false),
            allocated_since_cycle: AtomicUsize::new(0),
            trigger_bytes: AtomicUsize::new(trigger),
            completed_cycle: AtomicU64::new(0),
            next_worker_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock_transition(&self) -> TransitionGuard<'_> {
        let order = LockGuard::new(LockOrder::Transition);
        TransitionGuard {
            state: self.transition.lock(),
            _order: order,
        }
    }

    pub(crate) fn phase(&self) -> PhaseState {
        self.phase.load()
    }

    /// Last cycle whose mark termination has finished.
    pub(crate) fn completed_cycle(&self) -> u64 {
        self.completed_cycle.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.park.unpark_all();
    }

    pub(crate) fn register(&self, kind: WorkerKind) -> Arc<WorkerSlot> {
        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(WorkerSlot::new(id, kind, self.config.barrier_buffer_capacity));
        self.lock_transition().state.workers.push(Arc::clone(&slot));
        slot
    }

    /// Remove a worker. Its grey work goes to the global queue and its
    /// claimed spans back to their pools.
    pub(crate) fn unregister(&self, slot: &Arc<WorkerSlot>) {
        let mut guard = self.lock_transition();
        guard.state.workers.retain(|other| !Arc::ptr_eq(other, slot));
        let mut local = slot.lock();
        local.drain_barrier();
        local.flush_to_global(&self.global, self.config.batch_capacity);
        local.unpublished.clear();
        local.marking = None;
        local.alloc.reset(Some(&self.spans));
    }

    /// Advance from `from` if the phase is still `from` and its exit
    /// condition holds.
    pub(crate) fn request_transition(&self, from: Phase) -> Transition {
        let mut guard = self.lock_transition();
        let current = self.phase.load();
        if current.phase != from {
            return Transition::Declined { current };
        }
        let state = &mut *guard.state;
        match from {
            Phase::Off => {
                if !self.cycle_wanted() {
                    return Transition::Declined { current };
                }
                self.start_cycle(state)
            }
            Phase::ConcurrentMark => {
                let slots = state.workers.clone();
                let (outcome, mut guards) = self.certify(&slots, None);
                if !outcome.is_terminated() {
                    return Transition::Declined { current };
                }
                self.terminate_locked(state, &slots, &mut guards)
            }
            Phase::MarkTermination => self.finish_cycle(state),
        }
    }

    /// Ask for a cycle and start it if the phase is `Off`. A request made
    /// while a cycle runs starts the next one.
    pub(crate) fn request_cycle(&self) -> Transition {
        self.cycle_requested.store(true, Ordering::Release);
        self.request_transition(Phase::Off)
    }

    /// Record `bytes` of heap growth and start a cycle if the trigger is
    /// crossed. Must not be called while holding a worker slot.
    pub(crate) fn notify_heap_growth(&self, bytes: usize) {
        let total = self
            .allocated_since_cycle
            .fetch_add(bytes, Ordering::AcqRel)
            .saturating_add(bytes);
        if total >= self.trigger_bytes.load(Ordering::Acquire) && self.phase.load().phase == Phase::Off {
            let _ = self.request_transition(Phase::Off);
        }
    }

    /// Run a detector pass and, if it terminates, finish the cycle. The
    /// initiating worker is visited first. Returns `None` outside
    /// concurrent marking.
    ///
    /// The caller must not hold any worker slot.
    pub(crate) fn try_complete_mark(&self, initiator: Option<&Arc<WorkerSlot>>) -> Option<DetectorOutcome> {
        let mut guard = self.lock_transition();
        if !self.phase.load().is_marking() {
            return None;
        }
        let state = &mut *guard.state;
        let slots = state.workers.clone();
        let (outcome, mut guards) = self.certify(&slots, initiator);
        if outcome.is_terminated() {
            self.terminate_locked(state, &slots, &mut guards);
            drop(guards);
            self.finish_cycle(state);
        }
        Some(outcome)
    }

    /// Last resort when the heap limit is hit: run the remainder of a cycle,
    /// or a whole one, with every worker stopped.
    ///
    /// The caller must not hold any worker slot.
    pub(crate) fn collect_stop_the_world(&self) {
        let mut guard = self.lock_transition();
        let state = &mut *guard.state;
        if self.phase.load().phase == Phase::MarkTermination {
            self.finish_cycle(state);
        }
        if self.phase.load().phase == Phase::Off {
            self.cycle_requested.store(false, Ordering::Release);
            self.start_cycle(state);
        }

        let slots = state.workers.clone();
        let mut guards: Vec<SlotGuard<'_>> = slots.iter().map(|slot| slot.lock()).collect();
        state.scratch.marking = self.arenas.read().marking.clone();
        for local in &mut guards {
            let unpublished = std::mem::take(&mut local.unpublished);
            for &object in &unpublished {
                marker::shade_into_queue(self, &mut state.scratch, object);
            }
            local.unpublished = unpublished;
            local.drain_barrier();
            local.flush_to_global(&self.global, self.config.batch_capacity);
            local.take_flushed();
        }
        marker::drain(self, &mut state.scratch, usize::MAX);

        if let Some(record) = state.cycle.as_mut() {
            record.stop_the_world = true;
        }
        self.terminate_locked(state, &slots, &mut guards);
        drop(guards);
        self.finish_cycle(state);
    }

    /// Check pending finalizer spans against the live arena.
    pub(crate) fn run_pending_finalizer_checks(&self) -> usize {
        if !self.finalizers.has_pending() {
            return 0;
        }
        let live = self.arenas.read().live.clone();
        let queued = self.finalizers.run_pending(live.as_deref());
        self.metrics.record_finalizers(queued);
        if queued > 0 {
            log_finalizers(live.as_ref().map_or(0, |arena| arena.cycle()), queued);
        }
        queued
    }

    /// [`run_pending_finalizer_checks`](Self::run_pending_finalizer_checks)
    /// with transitions excluded, for callers that hold no slot.
    pub(crate) fn run_finalizer_checks(&self) -> usize {
        let _guard = self.lock_transition();
        self.run_pending_finalizer_checks()
    }

    /// Whether `object` was reached by the last completed cycle.
    pub(crate) fn is_marked_live(&self, object: ObjectRef) -> bool {
        // The arena guard is released before the span table is read; span
        // creation takes them in the other order.
        let live = {
            let _order = LockGuard::new(LockOrder::Arenas);
            self.arenas.read().live.clone()
        };
        live.is_some_and(|arena| self.is_marked_in(&arena, object))
    }

    fn cycle_wanted(&self) -> bool {
        let requested = self.cycle_requested.swap(false, Ordering::AcqRel);
        let grown = self.allocated_since_cycle.load(Ordering::Acquire) >= self.trigger_bytes.load(Ordering::Acquire);
        requested || grown
    }

    /// Run a detector pass over `slots` and, if it terminates, stop every
    /// worker and confirm that none produced grey work since its visit.
    ///
    /// Visited workers resume while the pass goes on, so a store made
    /// between a worker's visit and the stop can still grey an object that
    /// only a termination root reaches. The confirmation visit catches that;
    /// the outcome is downgraded and marking continues. On `Terminated` the
    /// returned guards hold every slot in `slots`, in order.
    fn certify<'s>(
        &self,
        slots: &'s [Arc<WorkerSlot>],
        initiator: Option<&Arc<WorkerSlot>>,
    ) -> (DetectorOutcome, Vec<SlotGuard<'s>>) {
        let outcome = self.detector_pass(slots, initiator);
        if !outcome.is_terminated() {
            return (outcome, Vec::new());
        }

        let mut guards: Vec<SlotGuard<'s>> = slots.iter().map(|slot| slot.lock()).collect();
        let mut flushed = 0;
        for local in &mut guards {
            self.visit_worker(local);
            if local.take_flushed() {
                flushed += 1;
            }
        }
        let confirmed = if flushed > 0 {
            DetectorOutcome::FlushedWork { workers: flushed }
        } else if !self.global.is_empty() {
            DetectorOutcome::GlobalWorkPending
        } else {
            return (outcome, guards);
        };
        drop(guards);
        self.metrics.record_pass(confirmed);
        log_detector_pass(self.phase.load().cycle, confirmed);
        (confirmed, Vec::new())
    }

    fn detector_pass(&self, slots: &[Arc<WorkerSlot>], initiator: Option<&Arc<WorkerSlot>>) -> DetectorOutcome {
        let first = initiator.filter(|slot| slots.iter().any(|other| Arc::ptr_eq(other, slot)));
        let rest = slots
            .iter()
            .filter(|slot| first.map_or(true, |first| !Arc::ptr_eq(first, slot)));
        let order = first.into_iter().chain(rest).map(|slot| &**slot);

        let outcome = self
            .detector
            .run_pass(&self.global, order, |local| self.visit_worker(local));
        self.metrics.record_pass(outcome);
        log_detector_pass(self.phase.load().cycle, outcome);
        outcome
    }

    /// The detector's visit: move all of a stopped worker's grey work to
    /// the global queue, shading its unpublished allocations first.
    fn visit_worker(&self, local: &mut WorkerLocal) {
        if marker::ensure_marking_view(self, local) {
            let unpublished = std::mem::take(&mut local.unpublished);
            for &object in &unpublished {
                marker::shade_into_queue(self, local, object);
            }
            local.unpublished = unpublished;
        }
        local.drain_barrier();
        local.flush_to_global(&self.global, self.config.batch_capacity);
    }

    fn start_cycle(&self, state: &mut TransitionState) -> Transition {
        let cycle = self.phase.load().cycle + 1;
        #[cfg(feature = "tracing")]
        let gc_id = crate::tracing::internal::next_gc_id();
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_cycle("concurrent", cycle, gc_id);

        let arena = match state.spare_arena.take() {
            Some(mut arena) => {
                arena.reset(cycle);
                self.metrics.record_arena(true);
                arena
            }
            None => {
                self.metrics.record_arena(false);
                MarkArena::for_heap(cycle, self.config.max_heap_bytes)
            }
        };
        let arena = Arc::new(arena);
        {
            let _order = LockGuard::new(LockOrder::Arenas);
            self.arenas.write().marking = Some(Arc::clone(&arena));
        }
        // Spans created from here on see the arena themselves.
        self.spans.for_each_span_exclusive(|span| {
            if span.bitmap_offset(cycle).is_none() {
                if let Some(offset) = arena.allocate_slice(span.size_class()) {
                    span.assign_bitmap(cycle, offset);
                }
            }
        });

        self.allocated_since_cycle.store(0, Ordering::Release);
        self.phase.store(PhaseState {
            phase: Phase::ConcurrentMark,
            cycle,
        });
        self.barrier_active.store(true, Ordering::Release);
        // Every worker passes a safe-point, so none is still inside a
        // barrier that read the barrier as off.
        for slot in &state.workers {
            drop(slot.lock());
        }

        let mut seeds: Vec<GreyRef> = self
            .graph
            .root_jobs()
            .into_iter()
            .filter(|job| job.class == RootClass::Concurrent)
            .map(GreyRef::Root)
            .collect();
        seeds.extend(
            self.spans
                .spans_with_finalizers()
                .iter()
                .map(|span| GreyRef::FinalizerReferents(span.base())),
        );
        self.global.push_all(seeds, self.config.batch_capacity);

        let mut timer = PhaseTimer::new();
        timer.start();
        state.cycle = Some(CycleRecord {
            cycle,
            timer,
            passes_at_start: self.metrics.detector_passes(),
            sweep: SweepOutcome::default(),
            stop_the_world: false,
            #[cfg(feature = "tracing")]
            gc_id,
        });
        log_transition(Phase::Off, Phase::ConcurrentMark, cycle);
        self.park.unpark_all();
        Transition::Advanced {
            from: Phase::Off,
            to: Phase::ConcurrentMark,
            cycle,
        }
    }

    /// Mark termination proper. `guards` lock every slot in `slots`.
    fn terminate_locked(
        &self,
        state: &mut TransitionState,
        slots: &[Arc<WorkerSlot>],
        guards: &mut [SlotGuard<'_>],
    ) -> Transition {
        let cycle = self.phase.load().cycle;
        #[cfg(feature = "tracing")]
        let _span = state
            .cycle
            .as_ref()
            .map(|record| crate::tracing::internal::trace_cycle("termination", cycle, record.gc_id));
        if let Some(record) = state.cycle.as_mut() {
            record.timer.end_mark();
            record.timer.start();
        }
        let Some(marking) = self.arenas.read().marking.clone() else {
            // Unreachable while the phase is ConcurrentMark.
            return Transition::Declined {
                current: self.phase.load(),
            };
        };

        let snapshots = slots
            .iter()
            .zip(guards.iter())
            .map(|(slot, local)| {
                let unmarked = local
                    .unpublished
                    .iter()
                    .filter(|&&object| !self.is_marked_in(&marking, object))
                    .count();
                local.snapshot(slot.id(), slot.kind(), unmarked)
            })
            .collect();
        if let Err(violation) = check_quiescent(Phase::ConcurrentMark, cycle, &self.global, snapshots) {
            violation.abort();
        }

        // Termination roots are scanned with the world stopped.
        state.scratch.marking = Some(Arc::clone(&marking));
        for job in self.graph.root_jobs() {
            if job.class == RootClass::Termination {
                marker::process(self, &mut state.scratch, GreyRef::Root(job));
            }
        }
        marker::drain(self, &mut state.scratch, usize::MAX);
        state.scratch.marking = None;

        for local in guards.iter_mut() {
            local.alloc.reset(None);
            local.marking = None;
            local.assist_debt = 0;
            local.take_flushed();
        }

        self.barrier_active.store(false, Ordering::Release);
        let previous = {
            let _order = LockGuard::new(LockOrder::Arenas);
            let mut arenas = self.arenas.write();
            let marking = arenas.marking.take();
            std::mem::replace(&mut arenas.live, marking)
        };
        let sweep = self.spans.sweep_unmarked(&marking);
        drop(marking);
        if let Some(previous) = previous {
            state.spare_arena = Arc::try_unwrap(previous).ok();
        }
        log_sweep(cycle, &sweep);

        self.phase.store(PhaseState {
            phase: Phase::MarkTermination,
            cycle,
        });
        if let Some(record) = state.cycle.as_mut() {
            record.timer.end_termination();
            record.sweep = sweep;
        }
        self.completed_cycle.store(cycle, Ordering::Release);
        log_transition(Phase::ConcurrentMark, Phase::MarkTermination, cycle);
        Transition::Advanced {
            from: Phase::ConcurrentMark,
            to: Phase::MarkTermination,
            cycle,
        }
    }

    fn finish_cycle(&self, state: &mut TransitionState) -> Transition {
        let cycle = self.phase.load().cycle;
        let record = state.cycle.take();
        let live_bytes = record.as_ref().map_or(0, |record| record.sweep.live_bytes);
        self.trigger_bytes.store(
            self.config.next_trigger(live_bytes).unwrap_or(usize::MAX),
            Ordering::Release,
        );
        self.finalizers.schedule(self.spans.spans_with_finalizers());
        self.phase.store(PhaseState {
            phase: Phase::Off,
            cycle,
        });

        if let Some(record) = record {
            self.metrics.record_cycle(CycleMetrics {
                cycle: record.cycle,
                mark_duration: record.timer.mark,
                termination_pause: record.timer.termination,
                detector_passes: self.metrics.detector_passes() - record.passes_at_start,
                live_objects: record.sweep.live_objects,
                live_bytes: record.sweep.live_bytes,
                spans_freed: record.sweep.spans_freed,
                spans_retained: record.sweep.spans_retained,
                stop_the_world: record.stop_the_world,
            });
        }
        log_transition(Phase::MarkTermination, Phase::Off, cycle);
        self.park.unpark_all();
        Transition::Advanced {
            from: Phase::MarkTermination,
            to: Phase::Off,
            cycle,
        }
    }

    fn is_marked_in(&self, arena: &MarkArena, object: ObjectRef) -> bool {
        self.spans
            .with_span(object.addr(), |span| {
                let slot = span.slot_of(object.addr())?;
                let bits = arena.bits(span.bitmap_offset(arena.cycle())?, span.size_class())?;
                Some(bits.is_marked(slot))
            })
            .flatten()
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for CollectorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorInner")
            .field("phase", &self.phase.load())
            .field("completed_cycle", &self.completed_cycle())
            .field("spans", &self.spans.span_count())
            .field("global_items", &self.global.item_count())
            .finish_non_exhaustive()
    }
}
