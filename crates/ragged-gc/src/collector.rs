//! The embedder-facing collector and mutator handles.

use std::alloc::{handle_alloc_error, Layout};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::Backoff;

use crate::alloc::{self, BitmapState};
use crate::config::GcConfig;
use crate::error::ConfigError;
use crate::finalizer::FinalizerQueue;
use crate::gc::coordinator::CollectorInner;
use crate::gc::marker;
use crate::gc::tracing::log_fallback;
use crate::gc::worker::WorkerSlot;
use crate::gc::{DetectorOutcome, Phase, PhaseState, Transition, WorkerId, WorkerKind};
use crate::graph::ObjectGraph;
use crate::heap::{ObjectRef, SizeClass, SPAN_BYTES};
use crate::metrics::CollectorMetrics;

/// Errors from starting a collector.
#[derive(Debug)]
pub enum StartError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// A background marker thread could not be spawned.
    Spawn(std::io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid collector configuration: {err}"),
            Self::Spawn(err) => write!(f, "failed to spawn marker thread: {err}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Spawn(err) => Some(err),
        }
    }
}

impl From<ConfigError> for StartError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

/// A concurrent mark-sweep collector over an embedder-described object
/// graph.
///
/// Dropping the collector stops its background marker threads. Mutators
/// keep the shared state alive but no cycle can complete without someone
/// driving it, so drop them first.
///
/// ```
/// use std::sync::Arc;
/// use ragged_gc::{Collector, ExplicitGraph, GcConfig, SizeClass};
///
/// let graph = Arc::new(ExplicitGraph::new());
/// let collector = Collector::new(GcConfig::new(1), graph.clone()).unwrap();
/// let mutator = collector.register_mutator();
///
/// let class = SizeClass::for_size(32).unwrap();
/// let kept = mutator.allocate(class);
/// let dropped = mutator.allocate(class);
/// mutator.write_barrier(None, None, Some(kept), || graph.add_root(kept));
/// mutator.safepoint();
///
/// mutator.collect();
/// assert!(collector.is_marked(kept));
/// assert!(!collector.is_marked(dropped));
/// ```
pub struct Collector {
    inner: Arc<CollectorInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Collector {
    /// Start a collector with `config.background_workers` marker threads.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Config`] if `config` fails validation and
    /// [`StartError::Spawn`] if a marker thread cannot be started.
    pub fn new(config: GcConfig, graph: Arc<dyn ObjectGraph>) -> Result<Self, StartError> {
        config.validate()?;
        let workers = config.background_workers;
        let inner = Arc::new(CollectorInner::new(config, graph));

        let mut collector = Self {
            inner,
            workers: Vec::with_capacity(workers),
        };
        for index in 0..workers {
            let inner = Arc::clone(&collector.inner);
            let slot = inner.register(WorkerKind::Background);
            let handle = thread::Builder::new()
                .name(format!("ragged-gc-marker-{index}"))
                .spawn(move || {
                    marker::background_worker(&inner, &slot);
                    inner.unregister(&slot);
                })
                .map_err(StartError::Spawn)?;
            collector.workers.push(handle);
        }
        Ok(collector)
    }

    /// Register the calling thread, or any thread it hands the handle to, as
    /// a mutator.
    #[must_use]
    pub fn register_mutator(&self) -> Mutator {
        Mutator {
            slot: self.inner.register(WorkerKind::Mutator),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current phase and cycle.
    #[must_use]
    pub fn phase(&self) -> PhaseState {
        self.inner.phase()
    }

    /// Advance from `from` if that is still the phase and its exit condition
    /// holds: for `Off` a requested cycle or a crossed trigger, for
    /// `ConcurrentMark` a terminating detector pass, for `MarkTermination`
    /// nothing.
    ///
    /// Exactly one of several concurrent callers with the same `from` gets
    /// [`Transition::Advanced`]. Must not be called from a thread that is
    /// inside one of its own mutator's barrier closures.
    pub fn request_transition(&self, from: Phase) -> Transition {
        self.inner.request_transition(from)
    }

    /// Ask for a cycle. Starts it now if the phase is `Off`; otherwise the
    /// next cycle starts as soon as the current one ends.
    pub fn request_cycle(&self) -> Transition {
        self.inner.request_cycle()
    }

    /// Report heap growth that happened outside [`Mutator::allocate`].
    pub fn notify_heap_growth(&self, bytes: usize) {
        self.inner.notify_heap_growth(bytes);
    }

    /// Handle to the queue of objects found unreachable with a finalizer.
    #[must_use]
    pub fn finalizer_queue(&self) -> FinalizerQueue {
        self.inner.finalizers.queue()
    }

    /// Check the spans of the last completed cycle for finalizable objects
    /// now rather than waiting for a marker thread. Returns the number of
    /// objects queued.
    pub fn run_finalizer_checks(&self) -> usize {
        self.inner.run_finalizer_checks()
    }

    /// Counters and the last cycle's summary.
    #[must_use]
    pub fn metrics(&self) -> &CollectorMetrics {
        &self.inner.metrics
    }

    /// Whether the last completed cycle reached `object`.
    ///
    /// Objects allocated since then are not marked in that cycle's arena.
    #[must_use]
    pub fn is_marked(&self, object: ObjectRef) -> bool {
        self.inner.is_marked_live(object)
    }

    /// Whether `object` lies in a span the collector still owns.
    #[must_use]
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.inner.spans.lookup(object.addr()).is_some()
    }

    /// Spans currently owned by the collector.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.inner.spans.span_count()
    }

    /// Bytes held in spans.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.inner.spans.heap_bytes()
    }

    /// Number of the last cycle whose mark termination finished.
    #[must_use]
    pub fn completed_cycle(&self) -> u64 {
        self.inner.completed_cycle()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.inner.shut_down();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("inner", &self.inner)
            .field("background_workers", &self.workers.len())
            .finish()
    }
}

/// A registered mutator thread.
///
/// Every allocation is recorded as *unpublished* until the next
/// [`safepoint`](Self::safepoint): the collector assumes such objects may be
/// held only in the mutator's locals and keeps them alive. Call `safepoint`
/// once every object allocated so far is either reachable from the graph or
/// garbage.
pub struct Mutator {
    inner: Arc<CollectorInner>,
    slot: Arc<WorkerSlot>,
}

impl Mutator {
    /// This mutator's worker identity.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.slot.id()
    }

    /// Allocate one object of `class`.
    ///
    /// While a cycle is marking the object is allocated black. When the
    /// heap limit is reached this falls back to a stop-the-world collection
    /// and retries once; if that does not free a span the allocation error
    /// handler is called.
    #[must_use]
    pub fn allocate(&self, class: SizeClass) -> ObjectRef {
        let mut collected = false;
        loop {
            let allocated = {
                let mut local = self.slot.lock();
                alloc::allocate(&self.inner, &mut local, class)
            };
            match allocated {
                Some(allocated) => {
                    if allocated.grew_heap {
                        self.inner.notify_heap_growth(SPAN_BYTES);
                    }
                    return allocated.object;
                }
                None if !collected => {
                    log_fallback("heap limit reached");
                    self.inner.collect_stop_the_world();
                    collected = true;
                }
                None => handle_alloc_error(Self::layout(class)),
            }
        }
    }

    /// Allocate an object of at least `size` bytes. Returns `None` if `size`
    /// exceeds the largest size class.
    #[must_use]
    pub fn allocate_bytes(&self, size: usize) -> Option<ObjectRef> {
        SizeClass::for_size(size).map(|class| self.allocate(class))
    }

    /// Perform a pointer store with the write barrier.
    ///
    /// `_dst` is the object whose field is written, or `None` for a root.
    /// While marking, `old` (the value overwritten) and `new` (the value
    /// stored) are shaded; then `store` runs. Both happen inside one
    /// GC-atomic region, so the store cannot straddle the start of a cycle.
    ///
    /// Only values are shaded, never the container, so `_dst` is not read:
    /// an already scanned `_dst` needs no rescan once both ends of the store
    /// are grey.
    pub fn write_barrier<R>(
        &self,
        _dst: Option<ObjectRef>,
        old: Option<ObjectRef>,
        new: Option<ObjectRef>,
        store: impl FnOnce() -> R,
    ) -> R {
        let mut local = self.slot.lock();
        if self.inner.barrier_active.load(std::sync::atomic::Ordering::Acquire)
            && marker::ensure_marking_view(&self.inner, &mut local)
        {
            for object in [old, new].into_iter().flatten() {
                marker::shade_into_barrier(&self.inner, &mut local, object);
            }
        }
        store()
    }

    /// Insertion barrier for a store of `src` into `dst` that the embedder
    /// has performed or will perform itself.
    pub fn record_pointer_write(&self, dst: ObjectRef, src: ObjectRef) {
        self.write_barrier(Some(dst), None, Some(src), || ());
    }

    /// Deletion barrier for overwriting `old` in `dst`.
    pub fn record_pointer_overwrite(&self, dst: ObjectRef, old: ObjectRef) {
        self.write_barrier(Some(dst), Some(old), None, || ());
    }

    /// Shade `object` if a cycle is marking.
    pub fn shade(&self, object: ObjectRef) {
        self.write_barrier(None, None, Some(object), || ());
    }

    /// Register `object` for finalization. Returns `false` if it is not a
    /// heap object or is already registered.
    ///
    /// Registered objects keep their referents alive; once a completed
    /// cycle finds the object itself unreachable it is sent to the
    /// [`FinalizerQueue`] instead of being freed. A registration made while
    /// no cycle is marking applies from the next cycle on.
    pub fn set_finalizer(&self, object: ObjectRef) -> bool {
        let Some(span) = self.inner.spans.lookup(object.addr()) else {
            return false;
        };
        let Some(slot) = span.slot_of(object.addr()) else {
            return false;
        };
        let mut local = self.slot.lock();
        let state = self.inner.phase();
        let eligible = if state.phase == Phase::Off {
            state.cycle + 1
        } else {
            state.cycle
        };
        if !span.register_finalizer(slot, eligible) {
            return false;
        }
        if marker::ensure_marking_view(&self.inner, &mut local) {
            marker::shade_referents(&self.inner, &mut local, object);
        }
        true
    }

    /// Declare every object allocated so far published or garbage, and let
    /// a waiting detector or pause take this mutator's state.
    pub fn safepoint(&self) {
        let mut local = self.slot.lock();
        local.unpublished.clear();
        if marker::ensure_marking_view(&self.inner, &mut local) {
            local.drain_barrier();
            local.balance(
                &self.inner.global,
                self.inner.config.balance_threshold,
                self.inner.config.batch_capacity,
            );
        }
    }

    /// Move buffered barrier records to this mutator's local queue.
    pub fn flush_write_barrier(&self) -> usize {
        self.slot.lock().drain_barrier()
    }

    /// Do up to `budget` units of mark work on this thread. Returns the
    /// units done; 0 means there was nothing to do or no cycle is marking.
    pub fn drain_mark_work(&self, budget: usize) -> usize {
        let interval = self.inner.config.safepoint_interval;
        let mut local = self.slot.lock();
        let mut done = 0;
        while done < budget && marker::ensure_marking_view(&self.inner, &mut local) {
            let chunk = interval.min(budget - done);
            let drained = marker::drain(&self.inner, &mut local, chunk);
            done += drained;
            if drained < chunk {
                break;
            }
            local.safepoint();
        }
        done
    }

    /// Run a termination detector pass, finishing the cycle if it
    /// terminates. Returns `None` if no cycle is marking.
    pub fn try_complete_mark(&self) -> Option<DetectorOutcome> {
        self.inner.try_complete_mark(Some(&self.slot))
    }

    /// Run a full cycle, helping with marking, and return once a cycle that
    /// started after this call has completed.
    pub fn collect(&self) {
        let target = self.inner.phase().cycle + 1;
        let backoff = Backoff::new();
        while self.inner.completed_cycle() < target {
            match self.inner.phase().phase {
                Phase::Off => {
                    let _ = self.inner.request_cycle();
                }
                Phase::ConcurrentMark => {
                    if self.drain_mark_work(usize::MAX) > 0 {
                        backoff.reset();
                        continue;
                    }
                    if !matches!(
                        self.try_complete_mark(),
                        None | Some(DetectorOutcome::Terminated)
                    ) {
                        backoff.snooze();
                    }
                }
                Phase::MarkTermination => {
                    let _ = self.inner.request_transition(Phase::MarkTermination);
                }
            }
        }
    }

    /// Grey references in this mutator's local queue.
    #[must_use]
    pub fn local_queue_len(&self) -> usize {
        self.slot.lock().queue.len()
    }

    /// State of this mutator's allocation cursor for `class`, if it holds a
    /// span of that class.
    #[must_use]
    pub fn allocation_state(&self, class: SizeClass) -> Option<BitmapState> {
        self.slot.lock().alloc.state(class)
    }

    fn layout(class: SizeClass) -> Layout {
        Layout::from_size_align(class.size(), class.size()).unwrap_or_else(|_| Layout::new::<usize>())
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.inner.unregister(&self.slot);
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator").field("id", &self.slot.id()).finish()
    }
}
