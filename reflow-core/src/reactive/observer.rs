//! Observer Implementation
//!
//! An Observer is a side-effecting computation that re-runs whenever its
//! dependencies change.
//!
//! # How Observers Work
//!
//! 1. When created, the observer runs once to establish its dependencies.
//!
//! 2. When any dependency changes, the observer is queued for the next
//!    flush.
//!
//! 3. Every run records a fresh set of reads, which replaces the previous
//!    dependency set.
//!
//! # Differences from Computed
//!
//! - Computeds return a value; observers do not.
//! - Computeds are lazy (compute on access); observers are eager (run in the
//!   flush after a dependency changes).
//! - An observer failure is reported and isolated; it never stops the flush.
//!
//! # Async Observers
//!
//! An async observer splits into a tracked, synchronous prepare step that
//! returns a future, and the future itself. Reads inside the future are not
//! tracked. The session awaits the future before it reports the flush, so
//! the caller never sees an output computed from half-applied effects.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use super::context::ReactiveContext;
use super::gate::{isolate, Gate, Trigger};
use super::runtime::{DeferredTask, Reactive, Runtime};
use crate::error::Result;
use crate::graph::{Node, NodeFlags, NodeId};

type SyncBody = Box<dyn Fn() -> Result<()> + Send + Sync>;
type AsyncBody = Box<dyn Fn() -> Result<BoxFuture<'static, Result<()>>> + Send + Sync>;

enum Body {
    Sync(SyncBody),
    Async(AsyncBody),
}

/// Handle to a registered observer.
///
/// Observers live until destroyed; dropping the handle does not stop them.
///
/// # Example
///
/// ```rust,ignore
/// let count = rt.cell(0);
///
/// let count_clone = count.clone();
/// let observer = rt.observer(move || {
///     println!("Count is: {}", count_clone.get()?);
///     Ok(())
/// });
///
/// count.set(5); // Prints: "Count is: 5"
/// ```
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    runtime: Runtime,
    node: NodeId,
    label: String,
    body: Body,
    gate: Option<Gate>,
    ignore_init: bool,
    started: AtomicBool,
    runs: AtomicUsize,
}

impl ObserverInner {
    fn execute(&self, first_run: bool) -> Result<()> {
        if let Some(gate) = &self.gate {
            let provided = gate.probe()?;
            if first_run && self.ignore_init {
                trace!(node = %self.node, "first run skipped; subscribed to triggers only");
                return Ok(());
            }
            if !provided {
                return Ok(());
            }
            return isolate(|| self.call_body());
        }
        self.call_body()
    }

    fn call_body(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        match &self.body {
            Body::Sync(body) => body(),
            Body::Async(prepare) => {
                let future = prepare()?;
                self.runtime.push_deferred(DeferredTask {
                    node: self.node,
                    label: self.label.clone(),
                    future,
                });
                Ok(())
            }
        }
    }
}

impl Reactive for ObserverInner {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn run(&self) -> Result<()> {
        let Some(evaluation) = self.runtime.begin_evaluation(self.node) else {
            debug!(node = %self.node, "destroyed observer skipped");
            return Ok(());
        };
        let first_run = !self.started.swap(true, Ordering::AcqRel);

        let frame = ReactiveContext::enter(self.runtime.id(), self.node);
        let result = self.execute(first_run);
        let reads = frame.finish();

        // Observers are only queued again by a dependency change, so a
        // failed run keeps its reads instead of being marked for retry.
        evaluation.finish(reads, true);
        result.map_err(|err| err.within(&self.label))
    }
}

impl Observer {
    /// Get the observer's node id.
    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Number of times the body has run. Gated runs that were skipped do
    /// not count.
    pub fn run_count(&self) -> usize {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Queue a re-run regardless of its dependencies.
    pub fn trigger(&self) {
        self.inner.runtime.invalidate(self.inner.node);
    }

    /// Stop the observer. It will not run again.
    pub fn destroy(&self) {
        self.inner.runtime.dispose(self.inner.node);
    }

    pub fn is_destroyed(&self) -> bool {
        !self.inner.runtime.contains(self.inner.node)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("node", &self.inner.node)
            .field("label", &self.inner.label)
            .field("run_count", &self.run_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Builder for observers.
///
/// ```rust,ignore
/// rt.build_observer()
///     .label("notify")
///     .priority(10)
///     .on(&clicks)
///     .ignore_init(true)
///     .run(move || { /* ... */ Ok(()) });
/// ```
pub struct ObserverBuilder {
    runtime: Runtime,
    label: Option<String>,
    priority: i32,
    triggers: Vec<Trigger>,
    ignore_none: bool,
    ignore_init: bool,
}

impl ObserverBuilder {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            label: None,
            priority: 0,
            triggers: Vec::new(),
            ignore_none: true,
            ignore_init: false,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Higher priority observers run first within a flush cycle.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Gate the observer on `trigger`. Only trigger changes re-run it;
    /// every other read in its body is isolated.
    pub fn on(mut self, trigger: impl Into<Trigger>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    /// With `true` (the default), the body is skipped while every trigger
    /// is unset.
    pub fn ignore_none(mut self, ignore_none: bool) -> Self {
        self.ignore_none = ignore_none;
        self
    }

    /// Skip the body on the first run. The triggers are still subscribed.
    pub fn ignore_init(mut self, ignore_init: bool) -> Self {
        self.ignore_init = ignore_init;
        self
    }

    /// Register the observer and run it once.
    pub fn run<F>(self, body: F) -> Observer
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.register(Body::Sync(Box::new(body)))
    }

    /// Register an async observer. `prepare` runs tracked and returns the
    /// future to await.
    pub fn run_async<F>(self, prepare: F) -> Observer
    where
        F: Fn() -> Result<BoxFuture<'static, Result<()>>> + Send + Sync + 'static,
    {
        self.register(Body::Async(Box::new(prepare)))
    }

    fn register(self, body: Body) -> Observer {
        let mut node = Node::observer().with_priority(self.priority);
        if let Some(label) = self.label {
            node = node.with_label(label);
        }
        let gated = !self.triggers.is_empty();
        let mut flags = NodeFlags::empty();
        flags.set(NodeFlags::EVENT_GATED, gated);
        flags.set(NodeFlags::IGNORE_NONE, gated && self.ignore_none);
        flags.set(NodeFlags::IGNORE_INIT, gated && self.ignore_init);

        let node = self.runtime.register_node(node.with_flags(flags));
        let label = self.runtime.label(node);
        let gate = gated.then(|| Gate::new(self.triggers, self.ignore_none));

        let inner = Arc::new(ObserverInner {
            runtime: self.runtime.clone(),
            node,
            label,
            body,
            gate,
            ignore_init: self.ignore_init,
            started: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        });

        self.runtime.register_observer(inner.clone());
        Observer { inner }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
