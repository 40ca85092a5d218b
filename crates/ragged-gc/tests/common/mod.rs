//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use ragged_gc::{Collector, ExplicitGraph, GcConfig, Mutator, ObjectRef, SizeClass};

/// Collector over a fresh explicit graph with heap-growth triggering off,
/// so cycles only run when a test asks for one.
pub fn collector(background_workers: usize) -> (Collector, Arc<ExplicitGraph>) {
    let mut config = GcConfig::new(background_workers);
    config.set_gc_percent(None);
    collector_with(config)
}

pub fn collector_with(config: GcConfig) -> (Collector, Arc<ExplicitGraph>) {
    let graph = Arc::new(ExplicitGraph::new());
    let collector = Collector::new(config, graph.clone()).unwrap();
    (collector, graph)
}

pub fn class(size: usize) -> SizeClass {
    SizeClass::for_size(size).unwrap()
}

/// Add `object` to the concurrent root set through the barrier.
pub fn add_root(mutator: &Mutator, graph: &ExplicitGraph, object: ObjectRef) {
    mutator.write_barrier(None, None, Some(object), || graph.add_root(object));
}

/// Store `value` in `object.field` through the barrier.
pub fn store(mutator: &Mutator, graph: &ExplicitGraph, object: ObjectRef, field: usize, value: Option<ObjectRef>) {
    let old = graph.field(object, field);
    mutator.write_barrier(Some(object), old, value, || {
        graph.set_field(object, field, value);
    });
}

/// Everything reachable from the graph's roots.
pub fn reachable(graph: &ExplicitGraph) -> HashSet<ObjectRef> {
    let mut seen: HashSet<ObjectRef> = HashSet::new();
    let mut queue: VecDeque<ObjectRef> = graph.roots().into_iter().collect();
    while let Some(object) = queue.pop_front() {
        if seen.insert(object) {
            queue.extend(graph.edges(object));
        }
    }
    seen
}
