//! Heap layout: spans of fixed-size slots, grouped by size class.
//!
//! An object is identified only by its address. The span containing it is
//! found by masking the address down to the span boundary; the slot is the
//! offset divided by the span's slot size.

mod size_class;
mod span;
mod span_table;

use std::num::NonZeroUsize;

pub use size_class::{SizeClass, MAX_SMALL_OBJECT_SIZE, NUM_SIZE_CLASSES, SIZE_CLASSES};
pub use span::{Span, SpanId};
pub use span_table::{SpanTable, SweepOutcome};

/// log2 of [`SPAN_BYTES`].
pub const SPAN_SHIFT: u32 = 13;

/// Size and alignment of every span (8 KiB).
pub const SPAN_BYTES: usize = 1 << SPAN_SHIFT;

/// Address of an object slot.
///
/// The collector never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wrap a raw address; `None` for the null address.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// The object's address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Address as a raw pointer, for embedders that lay objects out in slots.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.get() as *mut u8
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
