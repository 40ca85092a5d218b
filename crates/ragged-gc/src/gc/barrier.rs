//! Per-worker write-barrier buffer.
//!
//! The barrier greys the objects it is told about (the stored value and,
//! for overwrites, the value being replaced) and parks them here instead of
//! touching the local queue on every pointer store. The buffer drains into
//! the local queue when it fills, when the worker drains mark work, and when
//! the termination detector visits the worker.

use super::worklist::{GreyRef, LocalQueue};
use crate::heap::ObjectRef;

/// Default number of records held before the buffer spills.
pub const DEFAULT_BARRIER_BUFFER_CAPACITY: usize = 256;

/// Greyed objects recorded by the write barrier, not yet queued.
#[derive(Debug)]
pub struct WriteBarrierBuffer {
    records: Vec<ObjectRef>,
    capacity: usize,
}

impl WriteBarrierBuffer {
    /// Buffer that reports itself full at `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a newly greyed object. Returns `true` once the buffer is full.
    pub fn record(&mut self, object: ObjectRef) -> bool {
        self.records.push(object);
        self.records.len() >= self.capacity
    }

    /// Buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move every record into `queue`. Returns the number moved.
    pub fn drain_into(&mut self, queue: &mut LocalQueue) -> usize {
        let moved = self.records.len();
        for object in self.records.drain(..) {
            queue.push(GreyRef::Object(object));
        }
        moved
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BARRIER_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_full_and_drains() {
        let mut buffer = WriteBarrierBuffer::new(2);
        let a = ObjectRef::from_addr(16).unwrap();
        let b = ObjectRef::from_addr(32).unwrap();
        assert!(!buffer.record(a));
        assert!(buffer.record(b));

        let mut queue = LocalQueue::new();
        assert_eq!(buffer.drain_into(&mut queue), 2);
        assert!(buffer.is_empty());
        assert_eq!(queue.pop(), Some(GreyRef::Object(b)));
        assert_eq!(queue.pop(), Some(GreyRef::Object(a)));
    }
}
