//! Error types.
//!
//! The collector has two kinds of failure. Bad configuration is reported to
//! the caller. A broken marking invariant at mark termination cannot be
//! recovered from: continuing would free reachable objects, so the process
//! prints a diagnostic and aborts.

use std::fmt;

use crate::gc::phase::Phase;
use crate::gc::worker::{WorkerId, WorkerKind};

/// A configuration value the collector cannot run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The named field must be non-zero.
    Zero(&'static str),
    /// The heap limit does not fit a single span.
    HeapTooSmall {
        /// Configured limit.
        max_heap_bytes: usize,
        /// Size of one span.
        span_bytes: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero(field) => write!(f, "`{field}` must be greater than zero"),
            Self::HeapTooSmall {
                max_heap_bytes,
                span_bytes,
            } => write!(
                f,
                "max_heap_bytes ({max_heap_bytes}) is smaller than one span ({span_bytes})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Per-worker state captured when a termination check fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker identity.
    pub id: WorkerId,
    /// Mutator or background marker.
    pub kind: WorkerKind,
    /// Grey references in its local queue.
    pub local_queue: usize,
    /// Records in its write-barrier buffer.
    pub barrier_buffer: usize,
    /// Its flushed flag.
    pub flushed: bool,
    /// Unpublished allocations that are not marked.
    pub unmarked_unpublished: usize,
}

impl WorkerSnapshot {
    /// Whether this worker breaks the termination invariant.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.local_queue > 0 || self.barrier_buffer > 0 || self.flushed || self.unmarked_unpublished > 0
    }
}

/// Mark termination found grey work after the detector certified there was
/// none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Phase at the time of the check.
    pub phase: Phase,
    /// Cycle being terminated.
    pub cycle: u64,
    /// Batches left in the global queue.
    pub global_batches: usize,
    /// Grey references left in the global queue.
    pub global_items: usize,
    /// Every registered worker, dirty or not.
    pub workers: Vec<WorkerSnapshot>,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mark termination invariant violated in {:?} of cycle {}: global queue holds {} batches ({} items)",
            self.phase, self.cycle, self.global_batches, self.global_items
        )?;
        for worker in self.workers.iter().filter(|w| w.is_dirty()) {
            write!(
                f,
                "; {:?} worker {}: local={} barrier={} flushed={} unmarked_unpublished={}",
                worker.kind,
                worker.id.0,
                worker.local_queue,
                worker.barrier_buffer,
                worker.flushed,
                worker.unmarked_unpublished
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for InvariantViolation {}

impl InvariantViolation {
    /// Report the violation and abort the process.
    #[cold]
    pub fn abort(&self) -> ! {
        eprintln!("[GC] fatal: {self}");
        #[cfg(feature = "tracing")]
        tracing::error!(
            cycle = self.cycle,
            phase = ?self.phase,
            global_items = self.global_items,
            "mark termination invariant violated"
        );
        std::process::abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::Zero("batch_capacity").to_string(),
            "`batch_capacity` must be greater than zero"
        );
    }

    #[test]
    fn test_violation_lists_only_dirty_workers() {
        let violation = InvariantViolation {
            phase: Phase::ConcurrentMark,
            cycle: 7,
            global_batches: 1,
            global_items: 3,
            workers: vec![
                WorkerSnapshot {
                    id: WorkerId(1),
                    kind: WorkerKind::Mutator,
                    local_queue: 0,
                    barrier_buffer: 0,
                    flushed: false,
                    unmarked_unpublished: 0,
                },
                WorkerSnapshot {
                    id: WorkerId(2),
                    kind: WorkerKind::Background,
                    local_queue: 4,
                    barrier_buffer: 0,
                    flushed: true,
                    unmarked_unpublished: 0,
                },
            ],
        };
        let text = violation.to_string();
        assert!(text.contains("cycle 7"));
        assert!(text.contains("Background worker 2: local=4"));
        assert!(!text.contains("worker 1:"));
    }
}
