//! The embedder's view of the object graph.
//!
//! The collector knows objects only by address. Everything it needs to know
//! about references comes through [`ObjectGraph`]: which root jobs exist,
//! what a root job reaches, and what an object points to.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::heap::ObjectRef;

/// Receives the references an object or root job holds.
pub trait Visitor {
    /// Report one outgoing reference.
    fn visit(&mut self, object: ObjectRef);
}

impl<F: FnMut(ObjectRef)> Visitor for F {
    fn visit(&mut self, object: ObjectRef) {
        self(object);
    }
}

/// When a root job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootClass {
    /// Seeded into the work queue at the start of marking and scanned
    /// concurrently with the mutators.
    Concurrent,
    /// Scanned while the world is stopped at mark termination, for roots
    /// that cannot be read safely while mutators run.
    Termination,
}

/// A unit of root-marking work.
///
/// `index` is opaque to the collector; the embedder uses it to pick which
/// part of its root set to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootJob {
    /// When the job runs.
    pub class: RootClass,
    /// Embedder-defined job number.
    pub index: u32,
}

impl RootJob {
    /// A job scanned during concurrent marking.
    #[must_use]
    pub const fn concurrent(index: u32) -> Self {
        Self {
            class: RootClass::Concurrent,
            index,
        }
    }

    /// A job scanned at mark termination.
    #[must_use]
    pub const fn termination(index: u32) -> Self {
        Self {
            class: RootClass::Termination,
            index,
        }
    }
}

/// Object graph supplied by the embedder.
///
/// Methods are called from marker threads, sometimes while the caller holds
/// collector locks. Implementations must not call back into the collector.
pub trait ObjectGraph: Send + Sync + 'static {
    /// Root jobs for the cycle that is starting.
    fn root_jobs(&self) -> Vec<RootJob>;

    /// Report every object `job` reaches directly.
    fn scan_root(&self, job: RootJob, visitor: &mut dyn Visitor);

    /// Report every reference held by `object`.
    fn trace(&self, object: ObjectRef, visitor: &mut dyn Visitor);
}

/// An [`ObjectGraph`] kept as an explicit adjacency map.
///
/// Suits embedders that store references out of line, and tests. Roots are
/// a flat list scanned by one concurrent job; termination roots, if any, by
/// one termination job.
///
/// The write barrier must run before the map is changed: call
/// [`Mutator::record_pointer_overwrite`](crate::Mutator::record_pointer_overwrite)
/// with the value about to be replaced, then update the map.
#[derive(Debug, Default)]
pub struct ExplicitGraph {
    edges: RwLock<HashMap<ObjectRef, Vec<Option<ObjectRef>>>>,
    roots: RwLock<Vec<ObjectRef>>,
    termination_roots: RwLock<Vec<ObjectRef>>,
}

impl ExplicitGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a concurrently scanned root.
    pub fn add_root(&self, object: ObjectRef) {
        self.roots.write().push(object);
    }

    /// Remove one occurrence of `object` from the roots.
    pub fn remove_root(&self, object: ObjectRef) -> bool {
        let mut roots = self.roots.write();
        roots.iter().position(|&r| r == object).is_some_and(|pos| {
            roots.swap_remove(pos);
            true
        })
    }

    /// Add a root scanned only at mark termination.
    pub fn add_termination_root(&self, object: ObjectRef) {
        self.termination_roots.write().push(object);
    }

    /// Snapshot of the concurrent roots.
    #[must_use]
    pub fn roots(&self) -> Vec<ObjectRef> {
        self.roots.read().clone()
    }

    /// Set reference field `field` of `object`, growing the field list as
    /// needed. Returns the previous value.
    pub fn set_field(&self, object: ObjectRef, field: usize, value: Option<ObjectRef>) -> Option<ObjectRef> {
        let mut edges = self.edges.write();
        let fields = edges.entry(object).or_default();
        if fields.len() <= field {
            fields.resize(field + 1, None);
        }
        std::mem::replace(&mut fields[field], value)
    }

    /// Current value of field `field` of `object`.
    #[must_use]
    pub fn field(&self, object: ObjectRef, field: usize) -> Option<ObjectRef> {
        self.edges
            .read()
            .get(&object)
            .and_then(|fields| fields.get(field).copied().flatten())
    }

    /// Append a reference to `object`.
    pub fn add_edge(&self, object: ObjectRef, target: ObjectRef) {
        self.edges.write().entry(object).or_default().push(Some(target));
    }

    /// Forget every reference held by `object`.
    pub fn clear(&self, object: ObjectRef) {
        self.edges.write().remove(&object);
    }

    /// Non-null references held by `object`.
    #[must_use]
    pub fn edges(&self, object: ObjectRef) -> Vec<ObjectRef> {
        self.edges
            .read()
            .get(&object)
            .map(|fields| fields.iter().flatten().copied().collect())
            .unwrap_or_default()
    }
}

impl ObjectGraph for ExplicitGraph {
    fn root_jobs(&self) -> Vec<RootJob> {
        let mut jobs = Vec::with_capacity(2);
        if !self.roots.read().is_empty() {
            jobs.push(RootJob::concurrent(0));
        }
        if !self.termination_roots.read().is_empty() {
            jobs.push(RootJob::termination(0));
        }
        jobs
    }

    fn scan_root(&self, job: RootJob, visitor: &mut dyn Visitor) {
        let roots = match job.class {
            RootClass::Concurrent => self.roots.read().clone(),
            RootClass::Termination => self.termination_roots.read().clone(),
        };
        for root in roots {
            visitor.visit(root);
        }
    }

    fn trace(&self, object: ObjectRef, visitor: &mut dyn Visitor) {
        for target in self.edges(object) {
            visitor.visit(target);
        }
    }
}
