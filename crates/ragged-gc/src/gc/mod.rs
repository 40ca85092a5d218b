//! Collection coordination and concurrent marking.
//!
//! This module provides the collector's moving parts:
//! - The phase word and the coordinator that advances it
//! - Mark arenas and per-span mark bitmaps
//! - Local and global work queues, and the write-barrier buffer
//! - Ragged-barrier termination detection
//! - Lock ordering discipline for deadlock prevention

pub mod barrier;
pub(crate) mod coordinator;
pub mod mark;
pub(crate) mod marker;
pub mod phase;
pub mod sync;
pub mod termination;
pub mod tracing;
pub mod worker;
pub mod worklist;

pub use phase::{Phase, PhaseState, Transition};
pub use termination::{check_quiescent, DetectorOutcome};
pub use worker::{WorkerId, WorkerKind};
