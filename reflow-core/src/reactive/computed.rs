//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its computation inside a fresh
//!    evaluation frame and caches the result.
//!
//! 2. When accessed again, if no dependency changed, it returns the cache.
//!
//! 3. When a dependency changes, the invalidation walk marks it dirty.
//!
//! 4. On next access, it recomputes and its dependency set is replaced by
//!    whatever this evaluation read.
//!
//! # Why This Matters
//!
//! This "lazy" approach avoids unnecessary recomputation:
//!
//! - A cell changes
//! - 10 computeds depend on it
//! - Only the computeds actually accessed will recompute
//! - Computeds that are never read stay dirty (no wasted work)
//!
//! # Failures
//!
//! An error returned by the computation propagates to the reader and leaves
//! the cache invalid, so the next read retries from scratch. This is what
//! lets a computed wait for an input that is not available yet.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::context::ReactiveContext;
use super::gate::{isolate, Gate, Trigger};
use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyState, Node, NodeFlags, NodeId};

type ComputeFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let n = rt.cell(10);
/// let double = rt.computed({
///     let n = n.clone();
///     move || Ok(n.get()? * 2)
/// });
///
/// assert_eq!(double.get()?, 20);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    runtime: Runtime,
    node: NodeId,
    label: String,
    compute: ComputeFn<T>,
    gate: Option<Gate>,

    /// The cached value. Valid only while the node is clean.
    value: RwLock<Option<T>>,

    evaluations: AtomicUsize,
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        self.runtime.dispose(self.node);
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Get the computed's node id.
    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// This is the main entry point for reading a computed's value.
    pub fn get(&self) -> Result<T> {
        let inner = &self.inner;
        inner.runtime.track_read(inner.node);

        if ReactiveContext::is_evaluating(inner.runtime.id(), inner.node) {
            return Err(ReactiveError::CircularDependency(inner.label.clone()));
        }

        match inner.runtime.dirty_state(inner.node) {
            None => return Err(ReactiveError::Disposed(inner.node)),
            Some(DirtyState::Clean) => {
                // Value is up-to-date, return cached
                if let Some(value) = inner.value.read().clone() {
                    return Ok(value);
                }
            }
            Some(DirtyState::Dirty) => {}
        }

        self.recompute()
    }

    /// Get the cached value without evaluating or tracking.
    pub fn peek(&self) -> Option<T> {
        if self.is_valid() {
            self.inner.value.read().clone()
        } else {
            None
        }
    }

    /// Recompute the value.
    ///
    /// This runs the computation within a fresh frame to track dependencies.
    fn recompute(&self) -> Result<T> {
        let inner = &self.inner;
        let runtime = &inner.runtime;

        let evaluation = runtime
            .begin_evaluation(inner.node)
            .ok_or(ReactiveError::Disposed(inner.node))?;
        inner.evaluations.fetch_add(1, Ordering::Relaxed);

        let frame = ReactiveContext::enter(runtime.id(), inner.node);
        let result = match &inner.gate {
            None => (inner.compute)(),
            Some(gate) => match gate.probe() {
                Ok(true) => isolate(|| (inner.compute)()),
                Ok(false) => Err(ReactiveError::Cancelled),
                Err(err) => Err(err),
            },
        };
        let reads = frame.finish();

        if !evaluation.finish(reads, result.is_ok()) {
            debug!(node = %inner.node, "computed disposed mid-evaluation; result discarded");
            return Err(ReactiveError::Disposed(inner.node));
        }

        match result {
            Ok(value) => {
                *inner.value.write() = Some(value.clone());
                Ok(value)
            }
            Err(err) => {
                inner.value.write().take();
                debug!(node = %inner.node, label = %inner.label, error = %err, "computed evaluation failed");
                Err(err.within(&inner.label))
            }
        }
    }

    /// Force the next read to recompute, and invalidate everything that read
    /// this computed.
    pub fn invalidate(&self) {
        self.inner.runtime.invalidate(self.inner.node);
    }

    /// Whether a cached value is present and up to date.
    pub fn is_valid(&self) -> bool {
        self.inner.runtime.dirty_state(self.inner.node) == Some(DirtyState::Clean)
            && self.inner.value.read().is_some()
    }

    /// Number of times the computation has run.
    pub fn evaluation_count(&self) -> usize {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    /// Number of nodes that read this computed during their last evaluation.
    pub fn dependent_count(&self) -> usize {
        self.inner.runtime.dependents(self.inner.node).len()
    }

    /// Remove the node from the graph. Further reads fail with
    /// [`ReactiveError::Disposed`].
    pub fn dispose(&self) {
        self.inner.runtime.dispose(self.inner.node);
        self.inner.value.write().take();
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("node", &self.inner.node)
            .field("label", &self.inner.label)
            .field("valid", &self.is_valid())
            .field("evaluations", &self.evaluation_count())
            .finish()
    }
}

/// Builder for computeds and outputs.
///
/// ```rust,ignore
/// let sample = rt
///     .build_computed()
///     .label("sample")
///     .on(&simulate)
///     .ignore_none(false)
///     .compute(move || draw(n.get()?));
/// ```
pub struct ComputedBuilder {
    runtime: Runtime,
    label: Option<String>,
    triggers: Vec<Trigger>,
    ignore_none: bool,
}

impl ComputedBuilder {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            label: None,
            triggers: Vec::new(),
            ignore_none: true,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Gate the computed on `trigger`: it only invalidates when a trigger
    /// does, and every other read in its body is isolated.
    pub fn on(mut self, trigger: impl Into<Trigger>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    /// With `true` (the default), a gated computed whose triggers are all
    /// unset fails with the silent [`ReactiveError::Cancelled`].
    pub fn ignore_none(mut self, ignore_none: bool) -> Self {
        self.ignore_none = ignore_none;
        self
    }

    pub fn compute<T, F>(self, compute: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let node = self.node(Node::computed());
        let node = self.runtime.register_node(node);
        self.finish(node, Box::new(compute))
    }

    /// Register as an output binding, reported by name when it goes dirty.
    pub fn output<T, F>(self, compute: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let node = self.node(Node::output());
        let node = self.runtime.register_output(node);
        self.finish(node, Box::new(compute))
    }

    fn node(&self, mut node: Node) -> Node {
        if let Some(label) = &self.label {
            node = node.with_label(label.clone());
        }
        let mut flags = NodeFlags::empty();
        if !self.triggers.is_empty() {
            flags |= NodeFlags::EVENT_GATED;
            flags.set(NodeFlags::IGNORE_NONE, self.ignore_none);
        }
        node.with_flags(flags)
    }

    fn finish<T>(self, node: NodeId, compute: ComputeFn<T>) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let label = self.runtime.label(node);
        let gate = (!self.triggers.is_empty()).then(|| Gate::new(self.triggers, self.ignore_none));

        Computed {
            inner: Arc::new(ComputedInner {
                runtime: self.runtime,
                node,
                label,
                compute,
                gate,
                value: RwLock::new(None),
                evaluations: AtomicUsize::new(0),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
