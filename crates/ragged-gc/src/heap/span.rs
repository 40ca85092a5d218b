//! Spans: fixed-size, aligned runs of same-class object slots.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{ObjectRef, SizeClass, SPAN_BYTES};

const SPAN_LAYOUT: Layout = match Layout::from_size_align(SPAN_BYTES, SPAN_BYTES) {
    Ok(layout) => layout,
    Err(_) => panic!("span layout must be valid"),
};

/// Stable identifier of a span, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(pub u64);

/// A span of object slots.
///
/// The span owns its memory but never reads or writes it; the embedder lays
/// objects out inside the slots. Everything the collector needs lives out of
/// line in this struct.
///
/// Bitmap records are double-buffered by cycle parity. Each record packs
/// `(cycle as u32) << 32 | word_offset`; a record whose cycle does not match
/// the one asked for is the nil bitmap.
pub struct Span {
    id: SpanId,
    base: NonNull<u8>,
    class: SizeClass,
    bitmaps: [AtomicU64; 2],
    claimed: AtomicBool,
    freed: AtomicBool,
    cursor_epoch: AtomicU64,
    cursor_next: AtomicUsize,
    finalizers: Mutex<BTreeMap<u32, u64>>,
    has_finalizers: AtomicBool,
    finalizers_checked: AtomicU64,
}

// SAFETY: `base` is only used as an address; the span never dereferences it.
unsafe impl Send for Span {}
// SAFETY: see above; all mutable state is atomic or behind a mutex.
unsafe impl Sync for Span {}

impl Span {
    /// Allocate a fresh span of `class`.
    pub(crate) fn new(id: SpanId, class: SizeClass) -> Self {
        // SAFETY: SPAN_LAYOUT has non-zero size.
        let ptr = unsafe { alloc(SPAN_LAYOUT) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(SPAN_LAYOUT);
        };
        Self {
            id,
            base,
            class,
            bitmaps: [AtomicU64::new(0), AtomicU64::new(0)],
            claimed: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            cursor_epoch: AtomicU64::new(0),
            cursor_next: AtomicUsize::new(0),
            finalizers: Mutex::new(BTreeMap::new()),
            has_finalizers: AtomicBool::new(false),
            finalizers_checked: AtomicU64::new(0),
        }
    }

    /// Creation-order identity.
    #[must_use]
    pub const fn id(&self) -> SpanId {
        self.id
    }

    /// Address of slot 0.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size class of every slot.
    #[must_use]
    pub const fn size_class(&self) -> SizeClass {
        self.class
    }

    /// Number of slots.
    #[must_use]
    pub const fn object_count(&self) -> usize {
        self.class.objects_per_span()
    }

    /// Slot containing `addr`, if it lies inside this span's slot area.
    #[must_use]
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base())?;
        let slot = offset / self.class.size();
        (slot < self.object_count()).then_some(slot)
    }

    /// Reference to the object in `slot`.
    #[must_use]
    pub fn object_at(&self, slot: usize) -> Option<ObjectRef> {
        if slot >= self.object_count() {
            return None;
        }
        ObjectRef::from_addr(self.base() + slot * self.class.size())
    }

    /// Record this span's slice of the arena for `cycle`.
    pub(crate) fn assign_bitmap(&self, cycle: u64, offset: usize) {
        let packed = ((cycle & u64::from(u32::MAX)) << 32) | offset as u64;
        self.bitmaps[parity(cycle)].store(packed, Ordering::Release);
    }

    /// Word offset of this span's slice in the arena for `cycle`, or `None`
    /// for the nil bitmap.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bitmap_offset(&self, cycle: u64) -> Option<usize> {
        if cycle == 0 {
            return None;
        }
        let packed = self.bitmaps[parity(cycle)].load(Ordering::Acquire);
        ((packed >> 32) == (cycle & u64::from(u32::MAX))).then_some((packed & u64::from(u32::MAX)) as usize)
    }

    /// Claim the span for exclusive allocation.
    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Whether some allocator or checker currently owns the span.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    /// Whether the span was removed from the table.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Allocation cursor saved for `epoch`; zero if the span was last used in
    /// an older epoch.
    pub(crate) fn saved_cursor(&self, epoch: u64) -> usize {
        if self.cursor_epoch.load(Ordering::Acquire) == epoch {
            self.cursor_next.load(Ordering::Acquire)
        } else {
            0
        }
    }

    pub(crate) fn save_cursor(&self, epoch: u64, next: usize) {
        self.cursor_next.store(next, Ordering::Release);
        self.cursor_epoch.store(epoch, Ordering::Release);
    }

    /// Register `slot` for finalization from cycle `eligible` on.
    pub(crate) fn register_finalizer(&self, slot: usize, eligible: u64) -> bool {
        let Ok(slot) = u32::try_from(slot) else {
            return false;
        };
        let mut finalizers = self.finalizers.lock();
        let inserted = finalizers.insert(slot, eligible).is_none();
        self.has_finalizers.store(true, Ordering::Release);
        inserted
    }

    /// Whether any slot has a finalizer registered.
    #[must_use]
    pub fn has_finalizers(&self) -> bool {
        self.has_finalizers.load(Ordering::Acquire)
    }

    /// Slots currently registered for finalization.
    #[must_use]
    pub fn finalizable_slots(&self) -> Vec<usize> {
        self.finalizers.lock().keys().map(|&slot| slot as usize).collect()
    }

    /// Keep only the registrations for which `keep(slot, eligible)` is true.
    pub(crate) fn retain_finalizers(&self, mut keep: impl FnMut(usize, u64) -> bool) {
        let mut finalizers = self.finalizers.lock();
        finalizers.retain(|&slot, &mut eligible| keep(slot as usize, eligible));
        self.has_finalizers
            .store(!finalizers.is_empty(), Ordering::Release);
    }

    /// Move the finalizer-check watermark to `cycle`. Returns `false` if the
    /// check for `cycle` already happened.
    pub(crate) fn begin_finalizer_check(&self, cycle: u64) -> bool {
        self.finalizers_checked.swap(cycle, Ordering::AcqRel) != cycle
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.class.size())
            .field("claimed", &self.is_claimed())
            .field("freed", &self.is_freed())
            .finish_non_exhaustive()
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        // SAFETY: `base` came from `alloc(SPAN_LAYOUT)` in `Span::new`.
        unsafe { dealloc(self.base.as_ptr(), SPAN_LAYOUT) };
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn parity(cycle: u64) -> usize {
    (cycle & 1) as usize
}
