//! The span table: address lookup, per-class allocation pools and span
//! lifetime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Span, SpanId, SizeClass, NUM_SIZE_CLASSES, SPAN_BYTES, SPAN_SHIFT};
use crate::gc::mark::MarkArena;
use crate::gc::sync::{LockGuard, LockOrder};

/// What freeing unmarked spans after a cycle found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Spans returned to the system allocator.
    pub spans_freed: usize,
    /// Spans that survived.
    pub spans_retained: usize,
    /// Marked slots across surviving spans.
    pub live_objects: usize,
    /// Bytes of marked slots across surviving spans.
    pub live_bytes: usize,
}

/// Registry of every span in the heap.
#[derive(Debug)]
pub struct SpanTable {
    spans: RwLock<HashMap<usize, Arc<Span>>>,
    pools: [Mutex<VecDeque<Arc<Span>>>; NUM_SIZE_CLASSES],
    next_id: AtomicU64,
    heap_bytes: AtomicUsize,
    max_heap_bytes: usize,
}

impl SpanTable {
    /// Empty table that refuses to grow past `max_heap_bytes`.
    #[must_use]
    pub fn new(max_heap_bytes: usize) -> Self {
        Self {
            spans: RwLock::new(HashMap::new()),
            pools: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            next_id: AtomicU64::new(1),
            heap_bytes: AtomicUsize::new(0),
            max_heap_bytes,
        }
    }

    /// Bytes currently held in spans.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes.load(Ordering::Acquire)
    }

    /// Heap limit.
    #[must_use]
    pub const fn max_heap_bytes(&self) -> usize {
        self.max_heap_bytes
    }

    /// Number of live spans.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.spans.read().len()
    }

    /// Span containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<Arc<Span>> {
        self.spans.read().get(&(addr >> SPAN_SHIFT)).cloned()
    }

    /// Run `f` on the span containing `addr` without cloning the `Arc`.
    ///
    /// `f` must not call back into the table.
    pub fn with_span<R>(&self, addr: usize, f: impl FnOnce(&Span) -> R) -> Option<R> {
        self.spans.read().get(&(addr >> SPAN_SHIFT)).map(|span| f(span))
    }

    /// Create a span of `class`, already claimed by the caller.
    ///
    /// `assign` runs under the table's write lock, so it is serialised with
    /// [`SpanTable::for_each_span_exclusive`]: a span either exists when a
    /// cycle hands out bitmap slices or sees that cycle's arena here.
    /// Returns `None` when the heap limit would be exceeded.
    pub fn create_span(&self, class: SizeClass, assign: impl FnOnce(&Span)) -> Option<Arc<Span>> {
        self.heap_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bytes| {
                let grown = bytes.checked_add(SPAN_BYTES)?;
                (grown <= self.max_heap_bytes).then_some(grown)
            })
            .ok()?;

        let span = Arc::new(Span::new(
            SpanId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            class,
        ));
        let claimed = span.try_claim();
        debug_assert!(claimed, "fresh span is unclaimed");

        let _order = LockGuard::new(LockOrder::SpanTable);
        let mut spans = self.spans.write();
        assign(&span);
        spans.insert(span.base() >> SPAN_SHIFT, Arc::clone(&span));
        Some(span)
    }

    /// Visit every span with span creation excluded.
    pub fn for_each_span_exclusive(&self, mut f: impl FnMut(&Span)) {
        let _order = LockGuard::new(LockOrder::SpanTable);
        let spans = self.spans.write();
        for span in spans.values() {
            f(span);
        }
    }

    /// Spans that carry finalizer registrations.
    #[must_use]
    pub fn spans_with_finalizers(&self) -> Vec<Arc<Span>> {
        let mut found: Vec<_> = self
            .spans
            .read()
            .values()
            .filter(|span| span.has_finalizers())
            .cloned()
            .collect();
        found.sort_by_key(|span| span.base());
        found
    }

    /// Claim a pooled span of `class` for which `usable` holds.
    ///
    /// Spans that fail `usable` are full for the current epoch; they are
    /// dropped from the pool here and come back at the next refill.
    pub fn acquire(&self, class: SizeClass, mut usable: impl FnMut(&Span) -> bool) -> Option<Arc<Span>> {
        let mut pool = self.pools[class.index()].lock();
        while let Some(span) = pool.pop_front() {
            if span.is_freed() || !span.try_claim() {
                continue;
            }
            if usable(&span) {
                return Some(span);
            }
            span.release_claim();
        }
        None
    }

    /// Release a claimed span with free slots back into its pool.
    pub fn release_to_pool(&self, span: Arc<Span>) {
        span.release_claim();
        if !span.is_freed() {
            self.pools[span.size_class().index()].lock().push_back(span);
        }
    }

    /// Free every span that `arena` shows to have no marked slot, then
    /// rebuild the pools from the survivors.
    ///
    /// Claimed spans and spans with finalizer registrations always survive.
    pub fn sweep_unmarked(&self, arena: &MarkArena) -> SweepOutcome {
        let _order = LockGuard::new(LockOrder::SpanTable);
        let mut spans = self.spans.write();
        let mut outcome = SweepOutcome::default();

        spans.retain(|_, span| {
            let marked = span
                .bitmap_offset(arena.cycle())
                .and_then(|offset| arena.bits(offset, span.size_class()))
                .map(|bits| bits.count_marked());
            let keep = span.is_claimed() || span.has_finalizers() || marked != Some(0);
            if keep {
                let marked = marked.unwrap_or(0);
                outcome.spans_retained += 1;
                outcome.live_objects += marked;
                outcome.live_bytes += marked * span.size_class().size();
            } else {
                span.mark_freed();
                outcome.spans_freed += 1;
            }
            keep
        });
        self.heap_bytes
            .fetch_sub(outcome.spans_freed * SPAN_BYTES, Ordering::AcqRel);

        let mut survivors: Vec<&Arc<Span>> = spans.values().filter(|span| !span.is_claimed()).collect();
        survivors.sort_by_key(|span| span.base());
        for pool in &self.pools {
            pool.lock().clear();
        }
        for span in survivors {
            self.pools[span.size_class().index()]
                .lock()
                .push_back(Arc::clone(span));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(size: usize) -> SizeClass {
        SizeClass::for_size(size).unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let table = SpanTable::new(SPAN_BYTES * 4);
        let span = table.create_span(class(64), |_| {}).unwrap();
        assert!(span.is_claimed());
        assert_eq!(table.heap_bytes(), SPAN_BYTES);

        let found = table.lookup(span.base() + 100).unwrap();
        assert_eq!(found.id(), span.id());
        assert!(table.lookup(span.base() + SPAN_BYTES).map_or(true, |other| other.id() != span.id()));
    }

    #[test]
    fn test_heap_limit() {
        let table = SpanTable::new(SPAN_BYTES * 2);
        assert!(table.create_span(class(16), |_| {}).is_some());
        assert!(table.create_span(class(16), |_| {}).is_some());
        assert!(table.create_span(class(16), |_| {}).is_none());
        assert_eq!(table.span_count(), 2);
    }

    #[test]
    fn test_sweep_frees_only_unmarked() {
        let table = SpanTable::new(SPAN_BYTES * 8);
        let arena = MarkArena::new(1, 64);
        let assign = |span: &Span| {
            let offset = arena.allocate_slice(span.size_class()).unwrap();
            span.assign_bitmap(1, offset);
        };
        let live = table.create_span(class(32), assign).unwrap();
        let dead = table.create_span(class(32), assign).unwrap();
        let offset = live.bitmap_offset(1).unwrap();
        arena.bits(offset, class(32)).unwrap().mark(5);
        live.release_claim();
        dead.release_claim();

        let outcome = table.sweep_unmarked(&arena);
        assert_eq!(outcome.spans_freed, 1);
        assert_eq!(outcome.spans_retained, 1);
        assert_eq!(outcome.live_objects, 1);
        assert_eq!(outcome.live_bytes, 32);
        assert!(dead.is_freed());
        assert!(table.lookup(dead.base()).is_none());
        assert_eq!(table.heap_bytes(), SPAN_BYTES);

        let pooled = table.acquire(class(32), |_| true).unwrap();
        assert_eq!(pooled.id(), live.id());
    }

    #[test]
    fn test_acquire_filters_unusable() {
        let table = SpanTable::new(SPAN_BYTES * 4);
        let span = table.create_span(class(128), |_| {}).unwrap();
        table.release_to_pool(Arc::clone(&span));

        assert!(table.acquire(class(128), |_| false).is_none());
        // Dropped from the pool until the next refill.
        assert!(table.acquire(class(128), |_| true).is_none());
        assert!(!span.is_claimed());
    }
}
