//! Property tests: every reachable object survives a cycle, unreachable
//! objects do not, and no live slot is handed out again.

mod common;

use std::collections::HashSet;

use common::{add_root, class, collector, reachable, store};
use proptest::prelude::*;
use ragged_gc::ObjectRef;

#[test]
fn test_property_cycle_marks_exactly_the_reachable_set() {
    proptest!(ProptestConfig::with_cases(32), |(
        nodes in 1usize..48,
        edges in proptest::collection::vec((0usize..48, 0usize..48), 0..96),
        roots in proptest::collection::vec(0usize..48, 0..6),
    )| {
        let (collector, graph) = collector(0);
        let mutator = collector.register_mutator();
        let objects: Vec<ObjectRef> = (0..nodes).map(|_| mutator.allocate(class(48))).collect();
        for &(from, to) in &edges {
            graph.add_edge(objects[from % nodes], objects[to % nodes]);
        }
        for &root in &roots {
            add_root(&mutator, &graph, objects[root % nodes]);
        }
        mutator.safepoint();
        mutator.collect();

        let live = reachable(&graph);
        for object in &objects {
            prop_assert_eq!(collector.is_marked(*object), live.contains(object));
        }
        prop_assert_eq!(collector.metrics().last_cycle().live_objects, live.len());
    });
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { parent: usize, field: usize },
    Store { from: usize, field: usize, to: usize },
    Cut { from: usize, field: usize },
    Drain(usize),
    TryComplete,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<usize>(), 0usize..3).prop_map(|(parent, field)| Op::Allocate { parent, field }),
        (any::<usize>(), 0usize..3, any::<usize>()).prop_map(|(from, field, to)| Op::Store { from, field, to }),
        (any::<usize>(), 0usize..3).prop_map(|(from, field)| Op::Cut { from, field }),
        (1usize..8).prop_map(Op::Drain),
        Just(Op::TryComplete),
    ]
}

fn pick(set: &[ObjectRef], index: usize) -> Option<ObjectRef> {
    (!set.is_empty()).then(|| set[index % set.len()])
}

#[test]
fn test_property_mutation_during_marking_loses_nothing() {
    proptest!(ProptestConfig::with_cases(32), |(
        initial in 1usize..24,
        ops in proptest::collection::vec(op(), 0..64),
    )| {
        let (collector, graph) = collector(0);
        let mutator = collector.register_mutator();

        let root = mutator.allocate(class(32));
        add_root(&mutator, &graph, root);
        let mut previous = root;
        for _ in 0..initial {
            let node = mutator.allocate(class(32));
            store(&mutator, &graph, previous, 0, Some(node));
            previous = node;
        }
        mutator.safepoint();
        prop_assert!(collector.request_cycle().advanced());

        for op in ops {
            // Only objects the mutator can actually reach are touched.
            let live: Vec<ObjectRef> = {
                let mut live: Vec<_> = reachable(&graph).into_iter().collect();
                live.sort();
                live
            };
            match op {
                Op::Allocate { parent, field } => {
                    let node = mutator.allocate(class(32));
                    if let Some(parent) = pick(&live, parent) {
                        store(&mutator, &graph, parent, field, Some(node));
                    }
                }
                Op::Store { from, field, to } => {
                    if let (Some(from), Some(to)) = (pick(&live, from), pick(&live, to)) {
                        store(&mutator, &graph, from, field, Some(to));
                    }
                }
                Op::Cut { from, field } => {
                    if let Some(from) = pick(&live, from) {
                        store(&mutator, &graph, from, field, None);
                    }
                }
                Op::Drain(budget) => {
                    mutator.drain_mark_work(budget);
                }
                Op::TryComplete => {
                    let _ = mutator.try_complete_mark();
                }
            }
            if collector.completed_cycle() >= 1 {
                break;
            }
        }
        // Finish whatever cycle is running.
        while collector.completed_cycle() < 1 {
            mutator.drain_mark_work(usize::MAX);
            let _ = mutator.try_complete_mark();
        }

        let live = reachable(&graph);
        for object in &live {
            prop_assert!(collector.is_marked(*object), "reachable {} not marked", object);
            prop_assert!(collector.contains(*object));
        }

        // No reachable slot is handed out again.
        mutator.safepoint();
        for _ in 0..256 {
            let fresh = mutator.allocate(class(32));
            prop_assert!(!live.contains(&fresh), "live {} reallocated", fresh);
        }
    });
}

#[test]
fn test_unrooted_garbage_spans_are_freed() {
    let (collector, graph) = collector(0);
    let mutator = collector.register_mutator();
    let keep = mutator.allocate(class(16));
    add_root(&mutator, &graph, keep);
    // Fill several spans of another class with garbage.
    let garbage: HashSet<ObjectRef> = (0..100).map(|_| mutator.allocate(class(512))).collect();
    mutator.safepoint();
    let spans_before = collector.span_count();

    mutator.collect();
    assert!(collector.is_marked(keep));
    assert!(garbage.iter().all(|object| !collector.contains(*object)));
    assert_eq!(collector.span_count(), 1);
    assert!(collector.span_count() < spans_before);
    assert_eq!(collector.metrics().last_cycle().spans_freed, spans_before - 1);
}
