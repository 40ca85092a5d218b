//! Per-span view over a slice of a mark arena.
//!
//! One bit per object slot. The same words serve two roles: while a cycle
//! marks, a set bit means "reached"; once the cycle completes, the allocator
//! reads the inverted word as the span's free map.

use std::sync::atomic::{AtomicU64, Ordering};

/// Borrowed mark bits for one span.
///
/// # Example
///
/// ```
/// use std::sync::atomic::AtomicU64;
/// use ragged_gc::gc::mark::MarkBits;
///
/// let words = [AtomicU64::new(0), AtomicU64::new(0)];
/// let bits = MarkBits::new(&words, 100);
/// assert!(bits.mark(3));
/// assert!(!bits.mark(3));
/// assert_eq!(bits.first_unmarked_from(3), Some(4));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct MarkBits<'a> {
    words: &'a [AtomicU64],
    len: usize,
}

impl<'a> MarkBits<'a> {
    /// Wrap `words`, of which only the first `len` bits name real slots.
    ///
    /// # Panics
    ///
    /// Panics if `words` is too short to hold `len` bits.
    #[must_use]
    pub fn new(words: &'a [AtomicU64], len: usize) -> Self {
        assert!(
            words.len() * 64 >= len,
            "MarkBits needs {} words for {len} slots, got {}",
            len.div_ceil(64),
            words.len()
        );
        Self { words, len }
    }

    /// Number of slots covered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the view covers no slots.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the bit for `slot`. Returns `true` if this call flipped it.
    #[inline]
    pub fn mark(&self, slot: usize) -> bool {
        debug_assert!(slot < self.len, "slot {slot} out of range {}", self.len);
        let mask = 1u64 << (slot % 64);
        let prev = self.words[slot / 64].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Whether `slot` is marked.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, slot: usize) -> bool {
        debug_assert!(slot < self.len, "slot {slot} out of range {}", self.len);
        (self.words[slot / 64].load(Ordering::Acquire) >> (slot % 64)) & 1 != 0
    }

    /// Count set bits.
    #[must_use]
    pub fn count_marked(&self) -> usize {
        self.words
            .iter()
            .enumerate()
            .map(|(i, word)| (word.load(Ordering::Acquire) & self.valid_mask(i)).count_ones() as usize)
            .sum()
    }

    /// First clear bit at or after `start`.
    ///
    /// Scans whole words: each word is inverted, the bits below `start` are
    /// masked off and `trailing_zeros` picks the lowest free slot.
    #[must_use]
    pub fn first_unmarked_from(&self, start: usize) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let mut index = start / 64;
        let mut free = !self.words[index].load(Ordering::Acquire)
            & (u64::MAX << (start % 64))
            & self.valid_mask(index);
        loop {
            if free != 0 {
                return Some(index * 64 + free.trailing_zeros() as usize);
            }
            index += 1;
            if index * 64 >= self.len {
                return None;
            }
            free = !self.words[index].load(Ordering::Acquire) & self.valid_mask(index);
        }
    }

    /// Bits of word `index` that name real slots.
    const fn valid_mask(&self, index: usize) -> u64 {
        let end = self.len.saturating_sub(index * 64);
        if end >= 64 {
            u64::MAX
        } else {
            (1u64 << end) - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MarkBits;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    fn words(n: usize) -> Vec<AtomicU64> {
        (0..n).map(|_| AtomicU64::new(0)).collect()
    }

    #[test]
    fn test_first_free_skips_live_slot() {
        // Slot 0 live: the inverted word is ...1111_1110, so slot 1 is next.
        let storage = words(1);
        let bits = MarkBits::new(&storage, 64);
        bits.mark(0);
        assert_eq!(bits.first_unmarked_from(0), Some(1));
    }

    #[test]
    fn test_first_free_crosses_words() {
        let storage = words(2);
        let bits = MarkBits::new(&storage, 100);
        for slot in 0..70 {
            bits.mark(slot);
        }
        assert_eq!(bits.first_unmarked_from(0), Some(70));
        assert_eq!(bits.first_unmarked_from(71), Some(71));
    }

    #[test]
    fn test_tail_bits_are_not_slots() {
        let storage = words(1);
        let bits = MarkBits::new(&storage, 4);
        for slot in 0..4 {
            bits.mark(slot);
        }
        assert_eq!(bits.first_unmarked_from(0), None);
        assert_eq!(bits.count_marked(), 4);
    }

    #[test]
    fn test_property_first_free_is_never_marked() {
        use proptest::prelude::*;

        proptest!(|(
            raw in proptest::collection::vec(any::<u64>(), 1..4),
            len_seed in any::<usize>(),
            start_seed in any::<usize>(),
        )| {
            let storage: Vec<AtomicU64> = raw.iter().map(|&w| AtomicU64::new(w)).collect();
            let len = 1 + len_seed % (raw.len() * 64);
            let start = start_seed % (len + 1);
            let bits = MarkBits::new(&storage, len);

            let expected = (start..len).find(|&slot| (raw[slot / 64] >> (slot % 64)) & 1 == 0);
            prop_assert_eq!(bits.first_unmarked_from(start), expected);
            if let Some(slot) = expected {
                prop_assert!(!bits.is_marked(slot));
            }
        });
    }

    #[test]
    fn test_concurrent_mark_counts_once() {
        let storage: Arc<Vec<AtomicU64>> = Arc::new(words(8));
        let mut handles = Vec::new();
        let newly = Arc::new(AtomicU64::new(0));

        for _ in 0..4 {
            let storage = Arc::clone(&storage);
            let newly = Arc::clone(&newly);
            handles.push(thread::spawn(move || {
                let bits = MarkBits::new(&storage, 512);
                for slot in 0..512 {
                    if bits.mark(slot) {
                        newly.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(newly.load(std::sync::atomic::Ordering::Relaxed), 512);
        assert_eq!(MarkBits::new(&storage, 512).count_marked(), 512);
    }
}
