//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, each cycle runs inside a
//! `gc_cycle` span and the coordinator emits structured events for phase
//! transitions; see [`crate::gc::tracing`] for the event helpers.

/// Tracing helpers backed by the `tracing` crate.
#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tracing::{span, Level};

    /// Stable identifier for a collection cycle across all collectors in the
    /// process.
    ///
    /// Cycle numbers restart at 1 for every collector; `GcId` does not, so it
    /// correlates events when several collectors log to one subscriber.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one cycle's coordinator work.
    pub fn trace_cycle(kind: &str, cycle: u64, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", kind = kind, cycle, gc_id = gc_id.0).entered()
    }
}

/// No-op stand-ins used when the `tracing` feature is off.
#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
