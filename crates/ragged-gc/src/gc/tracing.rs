//! Coordinator-level tracing events.
//!
//! With the `tracing` feature off these compile to nothing, so call sites
//! need no `cfg`.

use super::phase::Phase;
use super::termination::DetectorOutcome;
use crate::heap::SweepOutcome;

/// Log a phase transition.
#[inline]
pub fn log_transition(from: Phase, to: Phase, cycle: u64) {
    #[cfg(feature = "tracing")]
    tracing::debug!(from = ?from, to = ?to, cycle, "phase_transition");
    #[cfg(not(feature = "tracing"))]
    let _ = (from, to, cycle);
}

/// Log the result of a detector pass.
#[inline]
pub fn log_detector_pass(cycle: u64, outcome: DetectorOutcome) {
    #[cfg(feature = "tracing")]
    tracing::trace!(cycle, outcome = ?outcome, "detector_pass");
    #[cfg(not(feature = "tracing"))]
    let _ = (cycle, outcome);
}

/// Log what mark termination freed.
#[inline]
pub fn log_sweep(cycle: u64, outcome: &SweepOutcome) {
    #[cfg(feature = "tracing")]
    tracing::debug!(
        cycle,
        spans_freed = outcome.spans_freed,
        spans_retained = outcome.spans_retained,
        live_bytes = outcome.live_bytes,
        "spans_swept"
    );
    #[cfg(not(feature = "tracing"))]
    let _ = (cycle, outcome);
}

/// Log a mutator assist.
#[inline]
pub fn log_assist(units: usize, done: usize) {
    #[cfg(feature = "tracing")]
    tracing::trace!(units, done, "mark_assist");
    #[cfg(not(feature = "tracing"))]
    let _ = (units, done);
}

/// Log a fallback to a full stop-the-world collection.
#[inline]
pub fn log_fallback(reason: &str) {
    #[cfg(feature = "tracing")]
    tracing::warn!(reason = reason, "stop_the_world_fallback");
    #[cfg(not(feature = "tracing"))]
    let _ = reason;
}

/// Log objects queued for finalization.
#[inline]
pub fn log_finalizers(cycle: u64, queued: usize) {
    #[cfg(feature = "tracing")]
    tracing::debug!(cycle, queued, "finalizers_queued");
    #[cfg(not(feature = "tracing"))]
    let _ = (cycle, queued);
}
