//! The coordination core of a concurrent mark-sweep garbage collector.
//!
//! `ragged-gc` marks an embedder-described object graph concurrently with
//! the threads that mutate it, detects the end of marking with a ragged
//! barrier instead of a global stop, and allocates without ever sweeping:
//! free slots are read straight out of the previous cycle's mark bitmap.
//!
//! # Architecture
//!
//! - **Phase coordinator**: a versioned `(phase, cycle)` word advanced
//!   `Off -> ConcurrentMark -> MarkTermination -> Off` under one lock.
//! - **Termination detector**: visits workers one at a time at their
//!   safe-points and certifies that no grey reference is left anywhere.
//! - **Mark arenas**: each cycle's mark bits live in one double-buffered
//!   arena; the previous cycle's arena is the allocator's free map.
//! - **Work queues**: per-worker local queues, a global queue of batches,
//!   and a write-barrier buffer per mutator.
//! - **Span table**: address-to-span lookup, size-class pools, and freeing
//!   spans with no marked slot.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use ragged_gc::{Collector, ExplicitGraph, GcConfig, SizeClass};
//!
//! let graph = Arc::new(ExplicitGraph::new());
//! let collector = Collector::new(GcConfig::new(2), graph.clone()).unwrap();
//! let mutator = collector.register_mutator();
//!
//! let class = SizeClass::for_size(64).unwrap();
//! let parent = mutator.allocate(class);
//! let child = mutator.allocate(class);
//! mutator.write_barrier(None, None, Some(parent), || graph.add_root(parent));
//! let old = graph.field(parent, 0);
//! mutator.write_barrier(Some(parent), old, Some(child), || {
//!     graph.set_field(parent, 0, Some(child));
//! });
//! mutator.safepoint();
//!
//! mutator.collect();
//! assert!(collector.is_marked(child));
//! ```
//!
//! # Mutator contract
//!
//! A mutator performs every pointer store through
//! [`Mutator::write_barrier`] and calls [`Mutator::safepoint`] regularly.
//! Objects it allocated since its last safe-point are kept alive even if
//! the graph does not reach them.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod alloc;
mod collector;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod gc;
pub mod graph;
pub mod metrics;
pub mod tracing;

/// Span and size-class internals.
///
/// This module is public for testing and advanced use cases.
pub mod heap;

pub use alloc::BitmapState;
pub use collector::{Collector, Mutator, StartError};
pub use config::GcConfig;
pub use error::{ConfigError, InvariantViolation, WorkerSnapshot};
pub use finalizer::FinalizerQueue;
pub use gc::{DetectorOutcome, Phase, PhaseState, Transition, WorkerId, WorkerKind};
pub use graph::{ExplicitGraph, ObjectGraph, RootClass, RootJob, Visitor};
pub use heap::{ObjectRef, SizeClass};
pub use metrics::{CollectorMetrics, CycleMetrics};
