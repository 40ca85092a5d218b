//! Finalizer registration checks and the finalization queue.
//!
//! A span records, per registered slot, the first cycle whose result may
//! finalize it. After each cycle the spans with registrations are checked
//! once against the live arena: every eligible object left unmarked is
//! deregistered, marked again so its slot stays allocated, and sent to the
//! queue. The embedder owns the object from then on and must root it if it
//! wants it to survive the next cycle.
//!
//! A check runs under the span's claim, so it never races the allocator
//! cursor that would otherwise hand the slot out again.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::gc::mark::MarkArena;
use crate::heap::{ObjectRef, Span};

/// Receiving end of the finalization queue.
///
/// Cloning yields another handle to the same queue; each object is
/// delivered to exactly one receiver.
#[derive(Debug, Clone)]
pub struct FinalizerQueue {
    rx: Receiver<ObjectRef>,
}

impl FinalizerQueue {
    /// Next object awaiting finalization, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<ObjectRef> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for an object.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ObjectRef> {
        match self.rx.recv_timeout(timeout) {
            Ok(object) => Some(object),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued right now.
    #[must_use]
    pub fn drain(&self) -> Vec<ObjectRef> {
        self.rx.try_iter().collect()
    }

    /// Objects waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Collector-side finalizer state.
#[derive(Debug)]
pub(crate) struct Finalizers {
    tx: Sender<ObjectRef>,
    rx: Receiver<ObjectRef>,
    /// Spans still to be checked against the current live arena.
    pending: Mutex<Vec<Arc<Span>>>,
}

impl Finalizers {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn queue(&self) -> FinalizerQueue {
        FinalizerQueue { rx: self.rx.clone() }
    }

    /// Replace the pending list with the spans of a freshly completed cycle.
    pub(crate) fn schedule(&self, spans: Vec<Arc<Span>>) {
        *self.pending.lock() = spans;
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Check every pending span that is not claimed by an allocator.
    /// Claimed spans are dropped from the list; their allocator checks them
    /// when it claims them. Returns the number of objects queued.
    pub(crate) fn run_pending(&self, live: Option<&MarkArena>) -> usize {
        let spans = std::mem::take(&mut *self.pending.lock());
        let Some(live) = live else {
            return 0;
        };
        let mut queued = 0;
        for span in spans {
            if span.is_freed() || !span.try_claim() {
                continue;
            }
            queued += self.check_claimed(&span, live);
            span.release_claim();
        }
        queued
    }

    /// Check one span the caller has claimed. Each span is checked at most
    /// once per live arena.
    pub(crate) fn check_claimed(&self, span: &Span, live: &MarkArena) -> usize {
        let cycle = live.cycle();
        if !span.has_finalizers() || !span.begin_finalizer_check(cycle) {
            return 0;
        }
        let Some(bits) = span
            .bitmap_offset(cycle)
            .and_then(|offset| live.bits(offset, span.size_class()))
        else {
            return 0;
        };

        let mut unreachable = Vec::new();
        span.retain_finalizers(|slot, eligible| {
            let finalize = eligible <= cycle && !bits.is_marked(slot);
            if finalize {
                unreachable.push(slot);
            }
            !finalize
        });
        for &slot in &unreachable {
            bits.mark(slot);
            if let Some(object) = span.object_at(slot) {
                // The receiver lives as long as `self`.
                let _ = self.tx.send(object);
            }
        }
        unreachable.len()
    }
}
