//! Grey work: per-worker local queues and the shared global queue.
//!
//! Local queues are plain vectors owned by one worker slot and touched only
//! under that slot's mutex. The global queue is a lock-free `SegQueue` of
//! bounded batches. Moving grey references from a local queue to the global
//! queue is the only way another worker can see them, so it is also the only
//! thing that sets the worker's flushed flag (see [`super::worker`]).

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::graph::RootJob;
use crate::heap::ObjectRef;

/// A unit of grey work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreyRef {
    /// A marked object whose fields have not been scanned.
    Object(ObjectRef),
    /// A root-marking job.
    Root(RootJob),
    /// Scan the referents of every finalizable object in the span based at
    /// this address, without marking the objects themselves.
    FinalizerReferents(usize),
}

/// A bounded run of grey references moved as one unit.
#[derive(Debug, Default)]
pub struct WorkBatch {
    items: Vec<GreyRef>,
}

impl WorkBatch {
    /// Batch holding `items`.
    #[must_use]
    pub const fn new(items: Vec<GreyRef>) -> Self {
        Self { items }
    }

    /// References in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take the references out of the batch.
    #[must_use]
    pub fn into_items(self) -> Vec<GreyRef> {
        self.items
    }
}

/// The shared queue of grey batches.
#[derive(Debug, Default)]
pub struct GlobalQueue {
    batches: SegQueue<WorkBatch>,
    items: AtomicUsize,
}

impl GlobalQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a non-empty batch.
    pub fn push(&self, batch: WorkBatch) {
        if batch.is_empty() {
            return;
        }
        self.items.fetch_add(batch.len(), Ordering::AcqRel);
        self.batches.push(batch);
    }

    /// Take the oldest batch.
    pub fn pop(&self) -> Option<WorkBatch> {
        let batch = self.batches.pop()?;
        self.items.fetch_sub(batch.len(), Ordering::AcqRel);
        Some(batch)
    }

    /// Whether no batch is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batches currently queued.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Grey references currently queued, approximately.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.load(Ordering::Acquire)
    }

    /// Queue one batch per `chunk` references of `items`.
    pub fn push_all(&self, items: Vec<GreyRef>, chunk: usize) {
        let mut items = items;
        while items.len() > chunk {
            let rest = items.split_off(chunk);
            self.push(WorkBatch::new(items));
            items = rest;
        }
        self.push(WorkBatch::new(items));
    }
}

/// A worker's private stack of grey references.
#[derive(Debug, Default)]
pub struct LocalQueue {
    items: Vec<GreyRef>,
}

impl LocalQueue {
    /// Empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Push one grey reference.
    pub fn push(&mut self, item: GreyRef) {
        self.items.push(item);
    }

    /// Pop the most recently pushed reference.
    pub fn pop(&mut self) -> Option<GreyRef> {
        self.items.pop()
    }

    /// References queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take over the references of a batch pulled from the global queue.
    pub fn refill(&mut self, batch: WorkBatch) {
        self.items.extend(batch.into_items());
    }

    /// Move everything to `global` in batches of at most `batch_capacity`.
    /// Returns the number of references moved.
    pub fn flush_to(&mut self, global: &GlobalQueue, batch_capacity: usize) -> usize {
        let moved = self.items.len();
        if moved > 0 {
            global.push_all(std::mem::take(&mut self.items), batch_capacity.max(1));
        }
        moved
    }

    /// If this queue is longer than `threshold` while `global` is empty, move
    /// the older half to `global`. Returns the number of references moved.
    pub fn balance(&mut self, global: &GlobalQueue, threshold: usize, batch_capacity: usize) -> usize {
        if self.items.len() <= threshold || !global.is_empty() {
            return 0;
        }
        let half = self.items.len() / 2;
        let older: Vec<GreyRef> = self.items.drain(..half).collect();
        global.push_all(older, batch_capacity.max(1));
        half
    }
}
