//! Termination roots: root jobs scanned only once every worker is stopped,
//! and stores that move their referents into the concurrently marked graph.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::{add_root, class, collector, store};
use ragged_gc::{DetectorOutcome, Phase};

#[test]
fn test_termination_roots_are_scanned_at_termination() {
    let (collector, graph) = collector(0);
    let mutator = collector.register_mutator();
    let root = mutator.allocate(class(32));
    let child = mutator.allocate(class(32));
    let garbage = mutator.allocate(class(32));
    graph.add_termination_root(root);
    graph.add_edge(root, child);
    mutator.safepoint();

    assert!(collector.request_cycle().advanced());
    // No concurrent root job exists, so nothing is marked before the stop.
    assert_eq!(mutator.drain_mark_work(usize::MAX), 0);
    assert_eq!(mutator.try_complete_mark(), Some(DetectorOutcome::Terminated));

    assert_eq!(collector.phase().phase, Phase::Off);
    assert!(collector.is_marked(root));
    assert!(collector.is_marked(child));
    assert!(!collector.is_marked(garbage));
    assert_eq!(collector.metrics().last_cycle().live_objects, 2);
}

#[test]
fn test_store_of_termination_only_object_during_marking() {
    let (collector, graph) = collector(0);
    let mutator = collector.register_mutator();
    let root = mutator.allocate(class(64));
    let holder = mutator.allocate(class(64));
    let hidden = mutator.allocate(class(64));
    add_root(&mutator, &graph, root);
    graph.add_termination_root(holder);
    graph.add_edge(holder, hidden);
    mutator.safepoint();

    assert!(collector.request_cycle().advanced());
    assert_eq!(mutator.drain_mark_work(usize::MAX), 2);

    // `hidden` is still white: only the termination root reaches it. The
    // store greys it into this mutator's barrier buffer.
    store(&mutator, &graph, root, 0, Some(hidden));
    assert_eq!(
        mutator.try_complete_mark(),
        Some(DetectorOutcome::FlushedWork { workers: 1 })
    );
    assert_eq!(mutator.drain_mark_work(usize::MAX), 1);
    assert_eq!(mutator.try_complete_mark(), Some(DetectorOutcome::Terminated));

    for object in [root, holder, hidden] {
        assert!(collector.is_marked(object), "{object} not marked");
    }
}

#[test]
fn test_stores_racing_termination_never_abort() {
    let (collector, graph) = collector(0);
    let driver = collector.register_mutator();
    let root = driver.allocate(class(32));
    let holder = driver.allocate(class(32));
    add_root(&driver, &graph, root);
    graph.add_termination_root(holder);
    driver.safepoint();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let writer = collector.register_mutator();
            while !stop.load(Ordering::Acquire) {
                // A fresh object reachable only from the termination root,
                // then briefly from the concurrent root too.
                let hidden = writer.allocate(class(32));
                store(&writer, &graph, holder, 0, Some(hidden));
                writer.safepoint();
                store(&writer, &graph, root, 0, Some(hidden));
                store(&writer, &graph, root, 0, None);
                writer.safepoint();
            }
        });

        for _ in 0..50 {
            driver.collect();
        }
        stop.store(true, Ordering::Release);
    });

    driver.collect();
    assert!(collector.is_marked(root));
    assert!(collector.is_marked(holder));
    if let Some(hidden) = graph.field(holder, 0) {
        assert!(collector.is_marked(hidden));
    }
}
