//! Worker slots and the per-worker GC state they guard.
//!
//! Every thread that takes part in collection, mutator or background marker,
//! owns one slot. The slot's mutex delimits the worker's GC-atomic regions:
//! while the owner holds it, it may push, pop, flush and shade; whenever it
//! does not, it is at a safe-point and the termination detector or a
//! stop-the-world pause may lock the slot and act on the worker's behalf.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::barrier::WriteBarrierBuffer;
use super::mark::MarkArena;
use super::sync::{LockGuard, LockOrder};
use super::worklist::{GlobalQueue, LocalQueue};
use crate::alloc::AllocCache;
use crate::error::WorkerSnapshot;
use crate::heap::ObjectRef;

/// Identity of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

/// What kind of thread owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// An embedder thread that allocates and runs the write barrier.
    Mutator,
    /// A dedicated marker thread.
    Background,
}

/// State owned by one worker.
#[derive(Debug)]
pub(crate) struct WorkerLocal {
    pub(crate) queue: LocalQueue,
    pub(crate) barrier: WriteBarrierBuffer,
    flushed: bool,
    /// Last detector pass that visited this worker.
    pub(crate) visited_pass: u64,
    /// Arena of the cycle this worker last marked for.
    pub(crate) marking: Option<Arc<MarkArena>>,
    pub(crate) alloc: AllocCache,
    /// Objects allocated since the last safe-point declaration; they may be
    /// held only in the embedder's locals.
    pub(crate) unpublished: Vec<ObjectRef>,
    pub(crate) assist_debt: usize,
}

impl WorkerLocal {
    pub(crate) fn new(barrier_capacity: usize) -> Self {
        Self {
            queue: LocalQueue::new(),
            barrier: WriteBarrierBuffer::new(barrier_capacity),
            flushed: false,
            visited_pass: 0,
            marking: None,
            alloc: AllocCache::new(),
            unpublished: Vec::new(),
            assist_debt: 0,
        }
    }

    /// Move the whole local queue to `global`. Sets the flushed flag only if
    /// something moved, so flushing an empty queue twice is a no-op.
    pub(crate) fn flush_to_global(&mut self, global: &GlobalQueue, batch_capacity: usize) -> usize {
        let moved = self.queue.flush_to(global, batch_capacity);
        self.flushed |= moved > 0;
        moved
    }

    /// Hand half of a long local queue to `global` when it is empty.
    pub(crate) fn balance(&mut self, global: &GlobalQueue, threshold: usize, batch_capacity: usize) -> usize {
        let moved = self.queue.balance(global, threshold, batch_capacity);
        self.flushed |= moved > 0;
        moved
    }

    /// Drain the barrier buffer into the local queue.
    pub(crate) fn drain_barrier(&mut self) -> usize {
        self.barrier.drain_into(&mut self.queue)
    }

    /// Read and clear the flushed flag. Only the termination detector and
    /// the stop-the-world drain call this.
    pub(crate) fn take_flushed(&mut self) -> bool {
        std::mem::take(&mut self.flushed)
    }

    pub(crate) fn snapshot(&self, id: WorkerId, kind: WorkerKind, unmarked_unpublished: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            id,
            kind,
            local_queue: self.queue.len(),
            barrier_buffer: self.barrier.len(),
            flushed: self.flushed,
            unmarked_unpublished,
        }
    }
}

/// A registered worker.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    id: WorkerId,
    kind: WorkerKind,
    local: Mutex<WorkerLocal>,
}

impl WorkerSlot {
    pub(crate) fn new(id: WorkerId, kind: WorkerKind, barrier_capacity: usize) -> Self {
        Self {
            id,
            kind,
            local: Mutex::new(WorkerLocal::new(barrier_capacity)),
        }
    }

    pub(crate) const fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) const fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Enter a GC-atomic region for this worker (or stop it, when called by
    /// the detector or a stop-the-world pause).
    pub(crate) fn lock(&self) -> SlotGuard<'_> {
        let order = LockGuard::new(LockOrder::WorkerSlot);
        SlotGuard {
            guard: self.local.lock(),
            _order: order,
        }
    }
}

/// Exclusive access to a worker's state.
pub(crate) struct SlotGuard<'a> {
    guard: MutexGuard<'a, WorkerLocal>,
    _order: LockGuard,
}

impl SlotGuard<'_> {
    /// Safe-point: hand the slot to a waiting detector or pause, if any,
    /// and take it back.
    pub(crate) fn safepoint(&mut self) {
        MutexGuard::bump(&mut self.guard);
    }
}

impl Deref for SlotGuard<'_> {
    type Target = WorkerLocal;

    fn deref(&self) -> &WorkerLocal {
        &self.guard
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut WorkerLocal {
        &mut self.guard
    }
}
