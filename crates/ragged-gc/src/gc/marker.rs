//! Concurrent marking: shading, the drain loop and background workers.
//!
//! Objects are marked when discovered, so a grey object is one whose bit is
//! set in the marking arena and whose reference still sits in some queue or
//! barrier buffer. Scanning pops the reference and shades everything it
//! points to; after that the object is black.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::coordinator::CollectorInner;
use super::mark::MarkArena;
use super::phase::Phase;
use super::termination::DetectorOutcome;
use super::worker::{WorkerLocal, WorkerSlot};
use super::worklist::GreyRef;
use crate::graph::Visitor;
use crate::heap::ObjectRef;

/// Longest a background worker sleeps while no cycle is running.
const OFF_PARK: Duration = Duration::from_millis(50);

/// Safe-point chunks a background worker drains before re-checking phase
/// and shutdown.
const CHUNKS_PER_SLICE: usize = 64;

/// Set `object`'s bit in `arena`. Returns the slot-aligned reference if the
/// object was white.
///
/// A worker already visited by the open detector pass taints it first.
/// References outside the heap, and objects in spans with no slice in
/// `arena`, are ignored.
pub(crate) fn grey(
    inner: &CollectorInner,
    arena: &MarkArena,
    visited_pass: u64,
    object: ObjectRef,
) -> Option<ObjectRef> {
    inner
        .spans
        .with_span(object.addr(), |span| {
            let slot = span.slot_of(object.addr())?;
            let bits = arena.bits(span.bitmap_offset(arena.cycle())?, span.size_class())?;
            if bits.is_marked(slot) {
                return None;
            }
            inner.detector.note_production(visited_pass);
            if bits.mark(slot) {
                span.object_at(slot)
            } else {
                None
            }
        })
        .flatten()
}

/// Shade `object` and queue it for scanning.
pub(crate) fn shade_into_queue(inner: &CollectorInner, local: &mut WorkerLocal, object: ObjectRef) -> bool {
    let WorkerLocal {
        marking,
        queue,
        visited_pass,
        ..
    } = local;
    let Some(arena) = marking.as_deref() else {
        return false;
    };
    grey(inner, arena, *visited_pass, object).is_some_and(|object| {
        queue.push(GreyRef::Object(object));
        true
    })
}

/// Shade `object` on behalf of the write barrier.
pub(crate) fn shade_into_barrier(inner: &CollectorInner, local: &mut WorkerLocal, object: ObjectRef) -> bool {
    let Some(arena) = local.marking.as_deref() else {
        return false;
    };
    let Some(object) = grey(inner, arena, local.visited_pass, object) else {
        return false;
    };
    if local.barrier.record(object) {
        local.drain_barrier();
    }
    true
}

/// Make sure `local` marks into the current cycle's arena. Returns `false`
/// if no cycle is marking.
pub(crate) fn ensure_marking_view(inner: &CollectorInner, local: &mut WorkerLocal) -> bool {
    let state = inner.phase.load();
    if !state.is_marking() {
        return false;
    }
    if local
        .marking
        .as_ref()
        .is_some_and(|arena| arena.cycle() == state.cycle)
    {
        return true;
    }
    local.marking = inner.arenas.read().marking.clone();
    local
        .marking
        .as_ref()
        .is_some_and(|arena| arena.cycle() == state.cycle)
}

struct ShadeVisitor<'a> {
    inner: &'a CollectorInner,
    local: &'a mut WorkerLocal,
}

impl Visitor for ShadeVisitor<'_> {
    fn visit(&mut self, object: ObjectRef) {
        shade_into_queue(self.inner, self.local, object);
    }
}

/// Shade every reference `object` holds.
pub(crate) fn shade_referents(inner: &CollectorInner, local: &mut WorkerLocal, object: ObjectRef) {
    inner.graph.trace(object, &mut ShadeVisitor { inner, local });
}

/// Blacken one unit of grey work.
pub(crate) fn process(inner: &CollectorInner, local: &mut WorkerLocal, item: GreyRef) {
    match item {
        GreyRef::Object(object) => shade_referents(inner, local, object),
        GreyRef::Root(job) => {
            inner.graph.scan_root(job, &mut ShadeVisitor { inner, local });
        }
        GreyRef::FinalizerReferents(base) => {
            let objects: Vec<ObjectRef> = inner
                .spans
                .with_span(base, |span| {
                    span.finalizable_slots()
                        .into_iter()
                        .filter_map(|slot| span.object_at(slot))
                        .collect()
                })
                .unwrap_or_default();
            for object in objects {
                shade_referents(inner, local, object);
            }
        }
    }
}

/// Process up to `budget` units of grey work: the local queue first, then
/// the barrier buffer, then batches from the global queue.
///
/// The caller holds the worker's slot and has an up-to-date marking view.
/// Returns the number of units processed.
pub(crate) fn drain(inner: &CollectorInner, local: &mut WorkerLocal, budget: usize) -> usize {
    let mut done = 0;
    while done < budget {
        if let Some(item) = local.queue.pop() {
            process(inner, local, item);
            done += 1;
        } else if local.drain_barrier() > 0 {
            continue;
        } else if let Some(batch) = inner.global.pop() {
            local.queue.refill(batch);
        } else {
            break;
        }
    }
    inner.metrics.record_scanned(done);
    done
}

/// One background marking slice: drain in safe-point sized chunks,
/// balancing between chunks. Returns the units processed.
fn mark_slice(inner: &CollectorInner, slot: &WorkerSlot) -> usize {
    let mut local = slot.lock();
    if !ensure_marking_view(inner, &mut local) {
        return 0;
    }
    let interval = inner.config.safepoint_interval;
    let mut total = 0;
    for _ in 0..CHUNKS_PER_SLICE {
        let done = drain(inner, &mut local, interval);
        total += done;
        local.balance(
            &inner.global,
            inner.config.balance_threshold,
            inner.config.batch_capacity,
        );
        if done < interval {
            break;
        }
        local.safepoint();
        if !ensure_marking_view(inner, &mut local) {
            break;
        }
    }
    total
}

/// Body of a dedicated marker thread.
pub(crate) fn background_worker(inner: &Arc<CollectorInner>, slot: &Arc<WorkerSlot>) {
    while !inner.is_shutting_down() {
        match inner.phase.load().phase {
            Phase::ConcurrentMark => {
                if mark_slice(inner, slot) > 0 {
                    continue;
                }
                match inner.try_complete_mark(Some(slot)) {
                    Some(DetectorOutcome::Tainted) => inner.park.park(inner.config.idle_park),
                    // Work is in the global queue, or the cycle has moved on.
                    None
                    | Some(
                        DetectorOutcome::Terminated
                        | DetectorOutcome::FlushedWork { .. }
                        | DetectorOutcome::GlobalWorkPending,
                    ) => {}
                }
            }
            Phase::MarkTermination => {
                let _ = inner.request_transition(Phase::MarkTermination);
            }
            Phase::Off => {
                {
                    let _local = slot.lock();
                    inner.run_pending_finalizer_checks();
                }
                if inner.phase.load().phase == Phase::Off {
                    inner.park.park(OFF_PARK);
                }
            }
        }
    }
}

/// Where idle background workers wait for a cycle to start.
#[derive(Debug, Default)]
pub(crate) struct WorkerPark {
    generation: Mutex<u64>,
    wake: Condvar,
}

impl WorkerPark {
    /// Sleep until woken or `timeout` passes.
    pub(crate) fn park(&self, timeout: Duration) {
        let mut generation = self.generation.lock();
        let seen = *generation;
        let _ = self
            .wake
            .wait_while_for(&mut generation, |g| *g == seen, timeout);
    }

    /// Wake every parked worker.
    pub(crate) fn unpark_all(&self) {
        *self.generation.lock() += 1;
        self.wake.notify_all();
    }
}
