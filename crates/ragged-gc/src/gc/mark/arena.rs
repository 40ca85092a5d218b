//! Per-cycle mark bitmap arena.
//!
//! An arena is a chunked bump allocator of `AtomicU64` words. Each span gets
//! one slice per cycle; a slice never straddles two chunks, so it can be
//! handed out as a plain `&[AtomicU64]`. Chunks are materialised on first use
//! and kept when the arena is recycled, which makes reuse a bulk zero rather
//! than a fresh allocation.
//!
//! Two arenas are alive at any time: the one the current cycle marks into,
//! and the one the previous cycle completed, which the allocator reads as its
//! free map.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use super::MarkBits;
use crate::heap::{SizeClass, NUM_SIZE_CLASSES, SIZE_CLASSES, SPAN_BYTES};

/// Words per chunk (32 KiB).
pub const CHUNK_WORDS: usize = 4096;

/// Largest slice one span can ask for.
pub const MAX_SPAN_WORDS: usize = (SPAN_BYTES / SIZE_CLASSES[0]).div_ceil(64);

const _: () = assert!(CHUNK_WORDS % MAX_SPAN_WORDS == 0);
const _: () = assert!(NUM_SIZE_CLASSES == SIZE_CLASSES.len());

/// Bitmap storage for one marking cycle.
#[derive(Debug)]
pub struct MarkArena {
    cycle: u64,
    chunks: Box<[OnceLock<Box<[AtomicU64]>>]>,
    next: AtomicUsize,
}

impl MarkArena {
    /// Create an arena for `cycle` able to hold `capacity_words` words.
    #[must_use]
    pub fn new(cycle: u64, capacity_words: usize) -> Self {
        let chunks = capacity_words.div_ceil(CHUNK_WORDS).max(1);
        Self {
            cycle,
            chunks: (0..chunks).map(|_| OnceLock::new()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Arena sized for a heap of at most `max_heap_bytes`.
    #[must_use]
    pub fn for_heap(cycle: u64, max_heap_bytes: usize) -> Self {
        let spans = max_heap_bytes.div_ceil(SPAN_BYTES);
        Self::new(cycle, spans.saturating_mul(MAX_SPAN_WORDS))
    }

    /// Cycle this arena belongs to.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Words handed out so far.
    #[must_use]
    pub fn words_used(&self) -> usize {
        self.next.load(Ordering::Acquire).min(self.capacity_words())
    }

    /// Total words this arena can hand out.
    #[must_use]
    pub fn capacity_words(&self) -> usize {
        self.chunks.len() * CHUNK_WORDS
    }

    /// Bump-allocate a zeroed slice for a span of `class`.
    ///
    /// Returns the word offset, or `None` once the arena is full.
    pub fn allocate_slice(&self, class: SizeClass) -> Option<usize> {
        let len = class.bitmap_words();
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let mut start = current;
            // Skip to the next chunk rather than straddle a boundary.
            if start / CHUNK_WORDS != (start + len - 1) / CHUNK_WORDS {
                start = (start / CHUNK_WORDS + 1) * CHUNK_WORDS;
            }
            if start + len > self.capacity_words() {
                return None;
            }
            match self.next.compare_exchange_weak(
                current,
                start + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.chunks[start / CHUNK_WORDS].get_or_init(new_chunk);
                    return Some(start);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Words of the slice at `offset`, if that chunk has been materialised.
    #[must_use]
    pub fn words(&self, offset: usize, len: usize) -> Option<&[AtomicU64]> {
        let chunk = self.chunks.get(offset / CHUNK_WORDS)?.get()?;
        let start = offset % CHUNK_WORDS;
        chunk.get(start..start + len)
    }

    /// Mark bits of the slice at `offset` for a span of `class`.
    #[must_use]
    pub fn bits(&self, offset: usize, class: SizeClass) -> Option<MarkBits<'_>> {
        self.words(offset, class.bitmap_words())
            .map(|words| MarkBits::new(words, class.objects_per_span()))
    }

    /// Recycle for `cycle`: zero every materialised chunk and rewind.
    ///
    /// Takes `&mut self`, so no span can still be reading the old contents.
    pub fn reset(&mut self, cycle: u64) {
        for chunk in self.chunks.iter_mut().filter_map(OnceLock::get_mut) {
            for word in chunk.iter_mut() {
                *word.get_mut() = 0;
            }
        }
        *self.next.get_mut() = 0;
        self.cycle = cycle;
    }
}

fn new_chunk() -> Box<[AtomicU64]> {
    (0..CHUNK_WORDS).map(|_| AtomicU64::new(0)).collect()
}
