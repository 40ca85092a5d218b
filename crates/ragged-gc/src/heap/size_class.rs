//! Fixed size-class table.
//!
//! Every span is carved into slots of exactly one class. Requests are routed
//! to the smallest class that fits them.

use super::SPAN_BYTES;

/// Slot sizes, smallest first.
pub const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Number of entries in [`SIZE_CLASSES`].
pub const NUM_SIZE_CLASSES: usize = 8;

/// Largest request served by a size class.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

/// One of the fixed slot sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Route a request of `size` bytes to its class, or `None` if it is larger
    /// than [`MAX_SMALL_OBJECT_SIZE`].
    #[must_use]
    pub const fn for_size(size: usize) -> Option<Self> {
        let index = if size <= 16 {
            0
        } else if size <= 32 {
            1
        } else if size <= 64 {
            2
        } else if size <= 128 {
            3
        } else if size <= 256 {
            4
        } else if size <= 512 {
            5
        } else if size <= 1024 {
            6
        } else if size <= MAX_SMALL_OBJECT_SIZE {
            7
        } else {
            return None;
        };
        Some(Self(index))
    }

    /// Class at `index` into [`SIZE_CLASSES`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < NUM_SIZE_CLASSES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    /// Iterate all classes, smallest first.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..NUM_SIZE_CLASSES).filter_map(Self::from_index)
    }

    /// Position in [`SIZE_CLASSES`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Slot size in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        SIZE_CLASSES[self.0 as usize]
    }

    /// Slots per span.
    #[must_use]
    pub const fn objects_per_span(self) -> usize {
        SPAN_BYTES / self.size()
    }

    /// Mark-bitmap words needed for one span of this class.
    #[must_use]
    pub const fn bitmap_words(self) -> usize {
        self.objects_per_span().div_ceil(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_to_smallest_fitting_class() {
        assert_eq!(SizeClass::for_size(1).map(SizeClass::size), Some(16));
        assert_eq!(SizeClass::for_size(16).map(SizeClass::size), Some(16));
        assert_eq!(SizeClass::for_size(17).map(SizeClass::size), Some(32));
        assert_eq!(SizeClass::for_size(1000).map(SizeClass::size), Some(1024));
        assert_eq!(SizeClass::for_size(2048).map(SizeClass::size), Some(2048));
        assert_eq!(SizeClass::for_size(2049), None);
    }

    #[test]
    fn test_span_geometry() {
        let smallest = SizeClass::from_index(0).unwrap();
        assert_eq!(smallest.objects_per_span(), 512);
        assert_eq!(smallest.bitmap_words(), 8);

        let largest = SizeClass::from_index(NUM_SIZE_CLASSES - 1).unwrap();
        assert_eq!(largest.objects_per_span(), 4);
        assert_eq!(largest.bitmap_words(), 1);
        assert_eq!(SizeClass::all().count(), NUM_SIZE_CLASSES);
    }
}
