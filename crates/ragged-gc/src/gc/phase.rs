//! The global phase and its versioned encoding.

use std::sync::atomic::{AtomicU64, Ordering};

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// No collection in progress; the write barrier is off.
    Off = 0,
    /// Marking runs concurrently with the mutators.
    ConcurrentMark = 1,
    /// Marking is complete; the heap is being reset for allocation.
    MarkTermination = 2,
}

impl Phase {
    const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            1 => Self::ConcurrentMark,
            2 => Self::MarkTermination,
            _ => Self::Off,
        }
    }
}

/// A phase together with the cycle it belongs to.
///
/// `cycle` is the number of the most recently started cycle; it is 0 until
/// the first cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseState {
    /// Current phase.
    pub phase: Phase,
    /// Cycle number.
    pub cycle: u64,
}

impl PhaseState {
    /// Whether the write barrier must shade and allocation must be black.
    #[must_use]
    pub const fn is_marking(self) -> bool {
        matches!(self.phase, Phase::ConcurrentMark)
    }
}

/// The phase word: `cycle << 2 | phase` in one atomic.
///
/// Readers get a consistent `(phase, cycle)` pair from a single load. Only
/// the coordinator stores, while holding the transition lock.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU64);

impl PhaseCell {
    /// `Off` at cycle 0.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current phase and cycle.
    #[must_use]
    pub fn load(&self) -> PhaseState {
        let bits = self.0.load(Ordering::Acquire);
        PhaseState {
            phase: Phase::from_bits(bits),
            cycle: bits >> 2,
        }
    }

    pub(crate) fn store(&self, state: PhaseState) {
        self.0
            .store((state.cycle << 2) | state.phase as u64, Ordering::Release);
    }
}

/// Result of [`Collector::request_transition`](crate::Collector::request_transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// This call moved the phase forward.
    Advanced {
        /// Phase left.
        from: Phase,
        /// Phase entered.
        to: Phase,
        /// Cycle of the phase entered.
        cycle: u64,
    },
    /// The phase had already moved on, or its exit condition does not hold.
    Declined {
        /// Phase observed under the lock.
        current: PhaseState,
    },
}

impl Transition {
    /// Whether this call performed the transition.
    #[must_use]
    pub const fn advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}
