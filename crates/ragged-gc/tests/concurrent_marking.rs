//! Stress tests: mutators rewrite linked lists while background workers mark
//! and cycles start and finish underneath them.
//!
//! A lost object would show up as a reachable node that is unmarked or
//! handed out again; a broken termination check aborts the process.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{add_root, class, collector, collector_with, reachable, store};
use ragged_gc::{ExplicitGraph, GcConfig, Mutator, ObjectRef, Phase};

const MUTATORS: usize = 3;
const OPS_PER_MUTATOR: usize = 2_000;

/// One mutator's list: `anchor.0 -> n1 -> n2 -> ...`, each link in field 0.
fn churn(mutator: &Mutator, graph: &ExplicitGraph, seed: usize) {
    let anchor = mutator.allocate(class(64));
    add_root(mutator, graph, anchor);
    mutator.safepoint();

    let mut members: HashSet<ObjectRef> = HashSet::new();
    let mut len = 0usize;
    for op in 0..OPS_PER_MUTATOR {
        let node = mutator.allocate(class(64));
        assert!(!members.contains(&node), "live node {node} handed out again");

        // Push at the head.
        let head = graph.field(anchor, 0);
        store(mutator, graph, node, 0, head);
        store(mutator, graph, anchor, 0, Some(node));
        members.insert(node);
        len += 1;

        // Now and then cut the tail off after a pseudo-random length.
        if (op + seed) % 97 == 0 && len > 8 {
            let keep = 1 + (op * 31 + seed) % (len - 1);
            let mut cursor = node;
            for _ in 1..keep {
                cursor = graph.field(cursor, 0).unwrap();
            }
            let mut dropped = graph.field(cursor, 0);
            store(mutator, graph, cursor, 0, None);
            while let Some(object) = dropped {
                members.remove(&object);
                dropped = graph.field(object, 0);
            }
            len = keep;
        }
        mutator.safepoint();
    }
}

#[test]
fn test_mutators_and_background_markers() {
    let mut config = GcConfig::new(2);
    config.set_gc_percent(None);
    config.set_safepoint_interval(16);
    config.set_batch_capacity(8);
    config.set_balance_threshold(32);
    let (collector, graph) = collector_with(config);
    let collector = Arc::new(collector);
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(MUTATORS + 1));

    let requester = {
        let collector = Arc::clone(&collector);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            while !stop.load(Ordering::Acquire) {
                let _ = collector.request_cycle();
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let mutators: Vec<_> = (0..MUTATORS)
        .map(|seed| {
            let collector = Arc::clone(&collector);
            let graph = Arc::clone(&graph);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mutator = collector.register_mutator();
                start.wait();
                churn(&mutator, &graph, seed);
            })
        })
        .collect();
    for handle in mutators {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    requester.join().unwrap();

    let mutator = collector.register_mutator();
    mutator.collect();
    assert!(collector.metrics().cycles_completed() >= 1);
    for object in reachable(&graph) {
        assert!(collector.is_marked(object), "reachable {object} not marked");
    }
}

#[test]
fn test_background_workers_finish_cycles_alone() {
    let (collector, graph) = collector(2);
    let mutator = collector.register_mutator();
    let root = mutator.allocate(class(128));
    add_root(&mutator, &graph, root);
    let mut previous = root;
    for _ in 0..500 {
        let node = mutator.allocate(class(128));
        store(&mutator, &graph, previous, 0, Some(node));
        previous = node;
    }
    mutator.safepoint();

    assert!(collector.request_cycle().advanced());
    // The mutator stays at safe-points and does no mark work itself.
    while collector.completed_cycle() < 1 {
        mutator.safepoint();
        thread::sleep(Duration::from_millis(1));
    }
    while collector.phase().phase != Phase::Off {
        thread::yield_now();
    }
    assert!(reachable(&graph).iter().all(|&object| collector.is_marked(object)));
    assert!(collector.metrics().objects_scanned() >= 501);
}

#[test]
fn test_heap_growth_triggers_cycles() {
    let mut config = GcConfig::new(1);
    config.set_gc_percent(Some(100));
    config.set_min_trigger_bytes(64 * 1024);
    let (collector, graph) = collector_with(config);
    let mutator = collector.register_mutator();
    let root = mutator.allocate(class(16));
    add_root(&mutator, &graph, root);

    for _ in 0..20_000 {
        let _ = mutator.allocate(class(256));
        mutator.safepoint();
    }
    mutator.collect();
    assert!(collector.metrics().cycles_completed() >= 2);
    assert!(collector.is_marked(root));
}

#[test]
fn test_liveness_queries_during_span_creation_and_cycles() {
    let (collector, graph) = collector(1);
    let driver = collector.register_mutator();
    let seed = driver.allocate(class(16));
    add_root(&driver, &graph, seed);
    driver.safepoint();
    driver.collect();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    assert!(collector.is_marked(seed));
                }
            });
        }
        for _ in 0..2 {
            s.spawn(|| {
                let mutator = collector.register_mutator();
                // Large objects fill spans fast, so new ones keep being made.
                for _ in 0..2_000 {
                    let _ = mutator.allocate(class(2048));
                    mutator.safepoint();
                }
            });
        }
        for _ in 0..30 {
            driver.collect();
        }
        stop.store(true, Ordering::Release);
    });

    assert!(collector.is_marked(seed));
    assert!(collector.metrics().cycles_completed() >= 31);
}
