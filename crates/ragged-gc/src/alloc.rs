//! Sweep-free allocation.
//!
//! Nothing walks the heap to build free lists. A slot is free when its bit
//! is clear in the *live* arena, the arena of the last completed cycle, so
//! an allocator cursor finds the next free slot with a bit scan over the
//! span's live bitmap. A span created after that cycle has no live bitmap
//! (the nil bitmap) and is simply bump-allocated.
//!
//! Slots handed out in the current epoch are not marked in the live arena;
//! the cursor only ever moves forward, and the position is saved in the
//! span when the claim is released, so a slot is never handed out twice.

use std::sync::Arc;

use crate::gc::coordinator::CollectorInner;
use crate::gc::mark::MarkArena;
use crate::gc::marker;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::gc::tracing::log_assist;
use crate::gc::worker::WorkerLocal;
use crate::heap::{ObjectRef, SizeClass, Span, SpanTable, NUM_SIZE_CLASSES};

/// Where an allocator cursor takes its free-slot information from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapState {
    /// The span has no live bitmap: every slot from the cursor on is free.
    Nil,
    /// Free slots are the clear bits of the live bitmap at `word_offset`.
    Active {
        /// Offset of the span's slice in the live arena.
        word_offset: usize,
    },
    /// No free slot is left in the span for this epoch.
    Exhausted,
}

/// A claimed span and the allocation cursor over it.
#[derive(Debug)]
pub(crate) struct SpanCursor {
    span: Arc<Span>,
    state: BitmapState,
    next: usize,
}

impl SpanCursor {
    /// Start allocating from `span`, which the caller has claimed.
    fn open(span: Arc<Span>, live: Option<&MarkArena>, epoch: u64) -> Self {
        let state = match (live, span.bitmap_offset(epoch)) {
            (Some(_), Some(word_offset)) => BitmapState::Active { word_offset },
            _ => BitmapState::Nil,
        };
        let next = span.saved_cursor(epoch);
        Self { span, state, next }
    }

    fn next_slot(&mut self, live: Option<&MarkArena>) -> Option<usize> {
        let found = match self.state {
            BitmapState::Nil => (self.next < self.span.object_count()).then_some(self.next),
            BitmapState::Active { word_offset } => live
                .and_then(|arena| arena.bits(word_offset, self.span.size_class()))
                .and_then(|bits| bits.first_unmarked_from(self.next)),
            BitmapState::Exhausted => None,
        };
        match found {
            Some(slot) => self.next = slot + 1,
            None => self.state = BitmapState::Exhausted,
        }
        found
    }

    /// Save the cursor and give up the claim. Spans that still have room go
    /// back to their pool when `pool` is given.
    fn close(self, epoch: u64, pool: Option<&SpanTable>) {
        self.span.save_cursor(epoch, self.next);
        match pool {
            Some(table) if self.state != BitmapState::Exhausted => table.release_to_pool(self.span),
            _ => self.span.release_claim(),
        }
    }
}

/// Per-worker allocation state: one cursor per size class and the live
/// arena they scan.
#[derive(Debug)]
pub(crate) struct AllocCache {
    live: Option<Arc<MarkArena>>,
    /// Cycle of `live`, or 0 before the first cycle completes.
    epoch: u64,
    valid: bool,
    cursors: [Option<SpanCursor>; NUM_SIZE_CLASSES],
}

impl AllocCache {
    pub(crate) fn new() -> Self {
        Self {
            live: None,
            epoch: 0,
            valid: false,
            cursors: std::array::from_fn(|_| None),
        }
    }

    /// Drop every cursor and the live view. Called at mark termination,
    /// when the live arena changes, and when the worker unregisters.
    pub(crate) fn reset(&mut self, pool: Option<&SpanTable>) {
        for cursor in &mut self.cursors {
            if let Some(cursor) = cursor.take() {
                cursor.close(self.epoch, pool);
            }
        }
        self.live = None;
        self.epoch = 0;
        self.valid = false;
    }

    pub(crate) fn state(&self, class: SizeClass) -> Option<BitmapState> {
        self.cursors[class.index()].as_ref().map(|cursor| cursor.state)
    }

    fn refresh(&mut self, inner: &CollectorInner) {
        let live = inner.arenas.read().live.clone();
        self.epoch = live.as_ref().map_or(0, |arena| arena.cycle());
        self.live = live;
        self.valid = true;
    }
}

/// Result of one allocation attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Allocated {
    pub(crate) object: ObjectRef,
    /// A span had to be created; the caller reports the growth once it has
    /// released its slot.
    pub(crate) grew_heap: bool,
}

/// Allocate one object of `class` on behalf of the worker owning `local`.
///
/// Returns `None` when the heap limit stops span creation.
pub(crate) fn allocate(inner: &CollectorInner, local: &mut WorkerLocal, class: SizeClass) -> Option<Allocated> {
    if !local.alloc.valid {
        local.alloc.refresh(inner);
    }
    let marking = marker::ensure_marking_view(inner, local);
    let mut grew_heap = false;

    let slot_index = class.index();
    let object = loop {
        let AllocCache {
            live,
            epoch,
            cursors,
            ..
        } = &mut local.alloc;
        if let Some(cursor) = cursors[slot_index].as_mut() {
            if let Some(slot) = cursor.next_slot(live.as_deref()) {
                if let Some(object) = cursor.span.object_at(slot) {
                    if marking {
                        allocate_black(local.marking.as_deref(), &cursor.span, slot);
                    }
                    break object;
                }
            }
            if let Some(cursor) = cursors[slot_index].take() {
                cursor.close(*epoch, None);
            }
        }

        let live = live.as_deref();
        let span = match inner.spans.acquire(class, |span| has_free_slot(span, live, *epoch)) {
            Some(span) => span,
            None => {
                let span = inner.spans.create_span(class, |span| {
                    let _order = LockGuard::new(LockOrder::Arenas);
                    if let Some(arena) = inner.arenas.read().marking.as_ref() {
                        if let Some(offset) = arena.allocate_slice(span.size_class()) {
                            span.assign_bitmap(arena.cycle(), offset);
                        }
                    }
                })?;
                grew_heap = true;
                span
            }
        };
        if span.has_finalizers() {
            if let Some(live) = live {
                let queued = inner.finalizers.check_claimed(&span, live);
                inner.metrics.record_finalizers(queued);
            }
        }
        cursors[slot_index] = Some(SpanCursor::open(span, live, *epoch));
    };

    local.unpublished.push(object);
    if marking {
        assist(inner, local, class.size());
    }
    Some(Allocated { object, grew_heap })
}

/// Mark a fresh slot in the marking arena so the cycle in progress treats
/// it as reached.
fn allocate_black(marking: Option<&MarkArena>, span: &Span, slot: usize) {
    if let Some(bits) = marking.and_then(|arena| {
        span.bitmap_offset(arena.cycle())
            .and_then(|offset| arena.bits(offset, span.size_class()))
    }) {
        bits.mark(slot);
    }
}

fn has_free_slot(span: &Span, live: Option<&MarkArena>, epoch: u64) -> bool {
    let next = span.saved_cursor(epoch);
    match live.zip(span.bitmap_offset(epoch)) {
        Some((arena, offset)) => arena
            .bits(offset, span.size_class())
            .is_some_and(|bits| bits.first_unmarked_from(next).is_some()),
        None => next < span.object_count(),
    }
}

/// Pay for allocation during marking with mark work.
fn assist(inner: &CollectorInner, local: &mut WorkerLocal, bytes: usize) {
    let per_unit = inner.config.assist_bytes_per_unit;
    local.assist_debt += bytes;
    if local.assist_debt < per_unit {
        return;
    }
    let units = (local.assist_debt / per_unit).min(inner.config.max_assist_units);
    let done = marker::drain(inner, local, units);
    inner.metrics.record_assist(done);
    log_assist(units, done);
    local.assist_debt = if done < units {
        // Nothing left to do; forgive the rest.
        0
    } else {
        local.assist_debt - units * per_unit
    };
}
