//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells, computeds and
//! observers of one session. It owns the dependency graph and the flush
//! scheduler and runs the flush loop.
//!
//! # How It Works
//!
//! 1. Every cell, computed, observer and output registers a node with the
//!    runtime.
//!
//! 2. While a computed or observer evaluates, the reads it performs are
//!    recorded in its context frame. When it finishes, the runtime replaces
//!    its dependency set with those reads.
//!
//! 3. When a cell's value changes, the runtime:
//!    a. Walks the graph from the cell, marking computeds dirty
//!    b. Queues the observers and outputs it reaches
//!    c. Computeds stay lazy: they recompute on next access
//!
//! 4. A flush drains the queue cycle by cycle. Observers that mutate cells
//!    while running only add to the queue; the running flush picks that up
//!    in its next cycle.
//!
//! # Locking
//!
//! All graph and scheduler state lives behind one mutex. The lock is only
//! held for bookkeeping and is always released before user code runs, and
//! anything that may own user closures is dropped after it is released.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, debug_span, error, trace, warn};

use super::cell::Cell;
use super::computed::{Computed, ComputedBuilder};
use super::context::{ReactiveContext, Reads};
use super::observer::{Observer, ObserverBuilder};
use super::scheduler::{FlushPhase, Scheduler};
use super::scope::Scope;
use crate::config::RuntimeConfig;
use crate::error::{ReactiveError, Result};
use crate::graph::{DependencyGraph, DirtyState, Node, NodeFlags, NodeId, NodeKind};
use crate::session::Directive;

/// Identifies one runtime. Evaluation frames carry it so reads never leak
/// between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(u64);

impl RuntimeId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RuntimeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime-{}", self.0)
    }
}

/// An eager node the flush loop can run.
pub trait Reactive: Send + Sync {
    /// The node this reactive value is registered as.
    fn node_id(&self) -> NodeId;

    /// Re-evaluate, re-tracking dependencies.
    fn run(&self) -> Result<()>;
}

/// A hard failure of one observer, isolated from the rest of its flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverFailure {
    pub node: NodeId,
    pub label: String,
    pub error: ReactiveError,
}

/// What a flush produced, drained from the runtime's outbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Flush cycles executed.
    pub cycles: usize,
    /// Names of outputs invalidated since the last report, in flush order.
    pub dirty_outputs: Vec<String>,
    /// Side-channel directives in emission order.
    pub directives: Vec<Directive>,
    pub failures: Vec<ObserverFailure>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.dirty_outputs.is_empty() && self.directives.is_empty() && self.failures.is_empty()
    }
}

/// The asynchronous tail of an async observer run, awaited by the session.
pub(crate) struct DeferredTask {
    pub node: NodeId,
    pub label: String,
    pub future: BoxFuture<'static, Result<()>>,
}

#[derive(Default)]
struct Outbox {
    dirty_outputs: IndexSet<NodeId>,
    directives: Vec<Directive>,
    failures: Vec<ObserverFailure>,
    cycles: usize,
}

struct RuntimeState {
    graph: DependencyGraph,
    scheduler: Scheduler,
    observers: HashMap<NodeId, Arc<dyn Reactive>>,
    /// One pending wake-up per node.
    timers: HashMap<NodeId, Instant>,
    deferred: Vec<DeferredTask>,
    outbox: Outbox,
}

struct RuntimeInner {
    id: RuntimeId,
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
}

/// The reactive runtime of one session.
///
/// Cloning is cheap and yields another handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                id: RuntimeId::new(),
                config,
                state: Mutex::new(RuntimeState {
                    graph: DependencyGraph::new(),
                    scheduler: Scheduler::new(),
                    observers: HashMap::new(),
                    timers: HashMap::new(),
                    deferred: Vec::new(),
                    outbox: Outbox::default(),
                }),
            }),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.inner.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.inner.state.lock()
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a cell holding `value`.
    pub fn cell<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::new(self, Some(value), None)
    }

    /// Create a cell with no value yet. Reading it yields
    /// [`ReactiveError::ValueNotAvailable`] until it is set.
    pub fn empty_cell<T>(&self) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::new(self, None, None)
    }

    /// Create a named cell, optionally with an initial value.
    pub fn named_cell<T>(&self, name: impl Into<String>, value: Option<T>) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::new(self, value, Some(name.into()))
    }

    /// Register a lazily evaluated, memoized computation.
    pub fn computed<T, F>(&self, compute: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.build_computed().compute(compute)
    }

    pub fn build_computed(&self) -> ComputedBuilder {
        ComputedBuilder::new(self.clone())
    }

    /// Register an output binding. It behaves like a computed whose
    /// invalidation is reported by the next flush under `name`.
    pub fn output<T, F>(&self, name: impl Into<String>, compute: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.build_computed().label(name).output(compute)
    }

    /// Register an observer and run it once.
    pub fn observer<F>(&self, run: F) -> Observer
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.build_observer().run(run)
    }

    pub fn build_observer(&self) -> ObserverBuilder {
        ObserverBuilder::new(self.clone())
    }

    /// Create a scope that tears down the nodes it owns.
    pub fn scope(&self) -> Scope {
        Scope::new(self.clone())
    }

    pub(crate) fn register_node(&self, node: Node) -> NodeId {
        let id = self.state().graph.add_node(node);
        trace!(runtime = %self.id(), node = %id, "registered node");
        id
    }

    /// Register an output node and queue it so the next flush reports it.
    pub(crate) fn register_output(&self, node: Node) -> NodeId {
        let mut state = self.state();
        let id = state.graph.add_node(node);
        state.scheduler.enqueue(id);
        id
    }

    /// Register an observer and run it for the first time.
    pub(crate) fn register_observer(&self, observer: Arc<dyn Reactive>) {
        let node = observer.node_id();
        self.state().observers.insert(node, Arc::clone(&observer));

        let guard = self.hold();
        self.run_observer(node, observer.as_ref());
        if guard.release() && self.inner.config.auto_flush {
            self.run_flush();
        }
    }

    // ------------------------------------------------------------------
    // Tracking and evaluation
    // ------------------------------------------------------------------

    /// Record a read of `node` against the current evaluation, if any.
    pub(crate) fn track_read(&self, node: NodeId) {
        ReactiveContext::track(self.inner.id, node);
    }

    /// Record a read of a cell. While the cell is frozen, reads made on
    /// behalf of an evaluation fail with [`ReactiveError::Cancelled`].
    pub(crate) fn read_source(&self, node: NodeId) -> Result<()> {
        self.track_read(node);
        if ReactiveContext::current_node(self.inner.id).is_some() && self.is_frozen(node) {
            trace!(%node, "read of a frozen cell cancelled");
            return Err(ReactiveError::Cancelled);
        }
        Ok(())
    }

    /// Start evaluating `node`: mark it clean so that invalidations arriving
    /// mid-evaluation stick, and cancel its pending timer.
    ///
    /// Returns `None` if the node has been disposed.
    pub(crate) fn begin_evaluation(&self, node: NodeId) -> Option<Evaluation<'_>> {
        let mut state = self.state();
        state.timers.remove(&node);
        let entry = state.graph.get_node_mut(node)?;
        entry.mark_clean();
        Some(Evaluation {
            runtime: self,
            node,
            done: false,
        })
    }

    fn finish_evaluation(&self, node: NodeId, reads: Reads, ok: bool) -> bool {
        let mut state = self.state();
        if !state.graph.contains(node) {
            return false;
        }
        state.graph.replace_dependencies(node, reads);
        if !ok {
            if let Some(entry) = state.graph.get_node_mut(node) {
                entry.mark_dirty();
            }
        }
        true
    }

    fn abort_evaluation(&self, node: NodeId) {
        if let Some(entry) = self.state().graph.get_node_mut(node) {
            entry.mark_dirty();
        }
    }

    pub(crate) fn dirty_state(&self, node: NodeId) -> Option<DirtyState> {
        self.state().graph.dirty_state(node)
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// A cell's value changed. Returns `false` if propagation was suppressed
    /// because the cell is frozen or disposed.
    pub(crate) fn source_changed(&self, node: NodeId) -> bool {
        self.propagate(node, false)
    }

    /// Invalidate `node` itself and everything downstream of it.
    pub fn invalidate(&self, node: NodeId) -> bool {
        self.propagate(node, true)
    }

    fn propagate(&self, node: NodeId, include_self: bool) -> bool {
        let flush_now = {
            let mut state = self.state();
            match state.graph.flags(node) {
                None => return false,
                Some(flags) if flags.contains(NodeFlags::FROZEN) => {
                    trace!(%node, "frozen cell changed; propagation suspended");
                    return false;
                }
                Some(_) => {}
            }

            let invalidation = state.graph.invalidate_from(node, include_self);
            state.scheduler.enqueue_all(invalidation.eager);

            self.inner.config.auto_flush
                && state.scheduler.can_flush_now()
                && state.scheduler.has_pending()
        };

        if flush_now {
            self.run_flush();
        }
        true
    }

    /// Suspend propagation from `cell` until the end of the next completed
    /// flush, or until [`Runtime::thaw`].
    pub(crate) fn freeze(&self, cell: NodeId) {
        let mut state = self.state();
        if state.graph.contains(cell) {
            state.graph.set_flag(cell, NodeFlags::FROZEN, true);
            state.scheduler.freeze_until_flush(cell);
        }
    }

    pub(crate) fn thaw(&self, cell: NodeId) {
        let mut state = self.state();
        state.graph.set_flag(cell, NodeFlags::FROZEN, false);
        state.scheduler.forget_freeze(cell);
    }

    pub fn is_frozen(&self, node: NodeId) -> bool {
        self.state()
            .graph
            .flags(node)
            .is_some_and(|flags| flags.contains(NodeFlags::FROZEN))
    }

    // ------------------------------------------------------------------
    // Batching and flushing
    // ------------------------------------------------------------------

    /// Run `f` as one external event: mutations inside accumulate and are
    /// flushed once afterwards (when auto flush is on).
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = self.hold();
        let result = f();
        if guard.release() && self.inner.config.auto_flush {
            self.run_flush();
        }
        result
    }

    /// Open a batch that lasts until the guard is released or dropped.
    /// Closing it never flushes; call [`Runtime::flush`] afterwards.
    pub fn hold(&self) -> BatchGuard {
        self.state().scheduler.begin_batch();
        BatchGuard {
            runtime: self.clone(),
            released: false,
        }
    }

    /// Drain all pending work and report what happened since the last
    /// report.
    ///
    /// With `auto_flush` on, mutations flush by themselves but their
    /// directives, failures and dirty outputs stay in the outbox until a
    /// host calls this. Hosts that never read reports may ignore them; the
    /// outbox is only bounded by how often it is drained.
    ///
    /// Calling this from inside a running flush is a no-op: the running
    /// flush already picks up new work.
    pub fn flush(&self) -> FlushReport {
        self.flush_with(|report| report)
    }

    /// Like [`Runtime::flush`], but hands the report to `f` before the
    /// cells frozen during this flush thaw. Outputs pulled inside `f` still
    /// see those freezes.
    pub fn flush_with<R>(&self, f: impl FnOnce(FlushReport) -> R) -> R {
        if !self.state().scheduler.begin_flush() {
            trace!("flush requested during a flush");
            return f(FlushReport::default());
        }

        let result = {
            let _finish = FlushEnd { runtime: self };
            self.drain();
            f(self.take_report())
        };

        let flush_again = {
            let state = self.state();
            self.inner.config.auto_flush
                && state.scheduler.can_flush_now()
                && state.scheduler.has_pending()
        };
        if flush_again {
            self.run_flush();
        }
        result
    }

    fn run_flush(&self) {
        if !self.state().scheduler.begin_flush() {
            return;
        }
        let _finish = FlushEnd { runtime: self };
        self.drain();
    }

    /// Run flush cycles until nothing is pending or the cycle limit is hit.
    fn drain(&self) {
        let span = debug_span!("flush", runtime = %self.inner.id);
        let _enter = span.enter();

        let max_cycles = self.inner.config.max_flush_cycles;
        let mut cycles = 0;

        loop {
            let batch: Vec<(NodeId, Arc<dyn Reactive>)> = {
                let mut state = self.state();
                if !state.scheduler.has_pending() {
                    break;
                }
                if cycles >= max_cycles {
                    warn!(
                        pending = state.scheduler.pending_len(),
                        max_cycles, "flush cycle limit reached; deferring remaining work"
                    );
                    break;
                }

                let pending = state.scheduler.take_pending();
                let order = state.graph.execution_order(&pending);
                let mut runnable = Vec::with_capacity(order.len());

                for id in order {
                    match state.graph.kind(id) {
                        Some(NodeKind::Output) => {
                            state.outbox.dirty_outputs.insert(id);
                        }
                        Some(NodeKind::Observer) => {
                            if let Some(observer) = state.observers.get(&id) {
                                runnable.push((id, Arc::clone(observer)));
                            }
                        }
                        _ => {}
                    }
                }
                runnable
            };

            cycles += 1;
            trace!(cycle = cycles, observers = batch.len(), "flush cycle");

            for (id, observer) in batch {
                // Already brought up to date, e.g. re-run earlier this cycle
                if self.dirty_state(id) != Some(DirtyState::Dirty) {
                    continue;
                }
                self.run_observer(id, observer.as_ref());
            }
        }

        self.state().outbox.cycles += cycles;
        debug!(cycles, "flush drained");
    }

    /// Leave the flushing phase and thaw the cells whose freeze expires.
    fn end_flush(&self) {
        let mut state = self.state();
        let thawed = state.scheduler.end_flush();
        for cell in &thawed {
            state.graph.set_flag(*cell, NodeFlags::FROZEN, false);
        }
        if !thawed.is_empty() {
            debug!(thawed = thawed.len(), "frozen cells thawed");
        }
    }

    /// Run one observer, isolating its failure from everything else.
    fn run_observer(&self, node: NodeId, observer: &dyn Reactive) {
        let result = if self.inner.config.catch_panics {
            match panic::catch_unwind(AssertUnwindSafe(|| observer.run())) {
                Ok(result) => result,
                Err(payload) => Err(ReactiveError::Panicked {
                    node: self.label(node),
                    message: panic_message(payload.as_ref()),
                }),
            }
        } else {
            observer.run()
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_silent() => {
                debug!(%node, error = %err, "observer short-circuited");
            }
            Err(err) => self.report_failure(node, err),
        }
    }

    pub(crate) fn report_failure(&self, node: NodeId, error: ReactiveError) {
        let mut state = self.state();
        let label = state.graph.label(node);
        error!(%node, node_label = %label, %error, "observer failed");
        state.outbox.failures.push(ObserverFailure { node, label, error });
    }

    fn take_report(&self) -> FlushReport {
        let mut state = self.state();
        let outbox = std::mem::take(&mut state.outbox);
        let dirty_outputs = outbox
            .dirty_outputs
            .into_iter()
            .filter(|id| state.graph.kind(*id) == Some(NodeKind::Output))
            .map(|id| state.graph.label(id))
            .collect();

        FlushReport {
            cycles: outbox.cycles,
            dirty_outputs,
            directives: outbox.directives,
            failures: outbox.failures,
        }
    }

    /// Queue a side-channel directive. Directives are reported in the order
    /// they are emitted.
    pub fn emit(&self, directive: Directive) {
        trace!(?directive, "directive emitted");
        self.state().outbox.directives.push(directive);
    }

    pub(crate) fn push_deferred(&self, task: DeferredTask) {
        self.state().deferred.push(task);
    }

    pub(crate) fn take_deferred(&self) -> Vec<DeferredTask> {
        std::mem::take(&mut self.state().deferred)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Invalidate the node currently being evaluated after `delay`.
    ///
    /// The wake-up is one-shot. Re-evaluating or disposing the node cancels
    /// it; the host is responsible for calling [`Runtime::fire_due_timers`].
    pub fn invalidate_later(&self, delay: Duration) -> Result<()> {
        let node =
            ReactiveContext::current_node(self.inner.id).ok_or(ReactiveError::NoActiveEvaluation)?;
        let deadline = Instant::now() + delay;
        self.state().timers.insert(node, deadline);
        trace!(%node, ?delay, "armed invalidation timer");
        Ok(())
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state().timers.values().min().copied()
    }

    /// Invalidate every node whose timer expired at `now`. Returns the
    /// number of timers fired.
    pub fn fire_due_timers(&self, now: Instant) -> usize {
        let (fired, flush_now) = {
            let mut state = self.state();
            let mut due: Vec<(Instant, NodeId)> = state
                .timers
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(node, deadline)| (*deadline, *node))
                .collect();
            due.sort();

            for (_, node) in &due {
                state.timers.remove(node);
                let invalidation = state.graph.invalidate_from(*node, true);
                state.scheduler.enqueue_all(invalidation.eager);
            }

            let flush_now = self.inner.config.auto_flush
                && state.scheduler.can_flush_now()
                && state.scheduler.has_pending();
            (due.len(), flush_now)
        };

        if fired > 0 {
            debug!(fired, "invalidation timers fired");
        }
        if flush_now {
            self.run_flush();
        }
        fired
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove `node`, its edges, its timer and any queued run.
    ///
    /// An evaluation of the node still in flight completes, but its result is
    /// discarded.
    pub fn dispose(&self, node: NodeId) -> bool {
        let (removed, observer) = {
            let mut state = self.state();
            state.timers.remove(&node);
            state.scheduler.dequeue(node);
            state.scheduler.forget_freeze(node);
            state.outbox.dirty_outputs.shift_remove(&node);
            let observer = state.observers.remove(&node);
            (state.graph.remove_node(node).is_some(), observer)
        };

        if removed {
            trace!(runtime = %self.inner.id, %node, "disposed node");
        }
        // Dropped outside the lock: the observer may own other handles.
        drop(observer);
        removed
    }

    /// Tear down every node. Used when the owning session closes.
    pub fn dispose_all(&self) {
        let (observers, deferred) = {
            let mut state = self.state();
            state.graph = DependencyGraph::new();
            state.scheduler = Scheduler::new();
            state.timers.clear();
            state.outbox = Outbox::default();
            (
                std::mem::take(&mut state.observers),
                std::mem::take(&mut state.deferred),
            )
        };
        debug!(runtime = %self.inner.id, observers = observers.len(), "runtime disposed");
        drop(observers);
        drop(deferred);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn contains(&self, node: NodeId) -> bool {
        self.state().graph.contains(node)
    }

    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.dirty_state(node) == Some(DirtyState::Dirty)
    }

    /// Nodes `node` read during its last evaluation.
    pub fn dependencies(&self, node: NodeId) -> Vec<NodeId> {
        self.state().graph.dependencies_of(node)
    }

    /// Nodes that read `node` during their last evaluation.
    pub fn dependents(&self, node: NodeId) -> Vec<NodeId> {
        self.state().graph.dependents_of(node)
    }

    pub fn label(&self, node: NodeId) -> String {
        self.state().graph.label(node)
    }

    pub fn node_count(&self) -> usize {
        self.state().graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.state().graph.edge_count()
    }

    pub fn phase(&self) -> FlushPhase {
        self.state().scheduler.phase()
    }

    pub fn pending_len(&self) -> usize {
        self.state().scheduler.pending_len()
    }

    pub fn flush_count(&self) -> u64 {
        self.state().scheduler.flush_count()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("nodes", &state.graph.node_count())
            .field("phase", &state.scheduler.phase())
            .field("pending", &state.scheduler.pending_len())
            .finish()
    }
}

/// An open batch. See [`Runtime::hold`].
pub struct BatchGuard {
    runtime: Runtime,
    released: bool,
}

impl BatchGuard {
    /// Close the batch. Returns `true` when no other batch or flush is open,
    /// i.e. the caller may flush now.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.runtime.state().scheduler.end_batch()
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if !self.released {
            self.runtime.state().scheduler.end_batch();
        }
    }
}

/// Ends the flush when dropped, including on unwind.
struct FlushEnd<'a> {
    runtime: &'a Runtime,
}

impl Drop for FlushEnd<'_> {
    fn drop(&mut self) {
        self.runtime.end_flush();
    }
}

/// An evaluation in progress. Dropping it without finishing (a panic in the
/// user closure) leaves the node dirty.
pub(crate) struct Evaluation<'a> {
    runtime: &'a Runtime,
    node: NodeId,
    done: bool,
}

impl Evaluation<'_> {
    /// Commit the reads as the node's dependency set. Returns `false` if the
    /// node was disposed while evaluating, in which case the result must be
    /// discarded.
    pub(crate) fn finish(mut self, reads: Reads, ok: bool) -> bool {
        self.done = true;
        self.runtime.finish_evaluation(self.node, reads, ok)
    }
}

impl Drop for Evaluation<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.runtime.abort_evaluation(self.node);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct MockReactive {
        id: NodeId,
        runs: AtomicI32,
        fail: bool,
    }

    impl MockReactive {
        fn register(rt: &Runtime, fail: bool) -> Arc<Self> {
            let id = rt.register_node(Node::observer());
            let mock = Arc::new(Self {
                id,
                runs: AtomicI32::new(0),
                fail,
            });
            rt.register_observer(mock.clone());
            mock
        }
    }

    impl Reactive for MockReactive {
        fn node_id(&self) -> NodeId {
            self.id
        }

        fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ReactiveError::failed("mock failure"));
            }
            Ok(())
        }
    }

    #[test]
    fn runtime_registers_and_disposes() {
        let rt = Runtime::new();
        let mock = MockReactive::register(&rt, false);

        assert!(rt.contains(mock.id));
        assert_eq!(mock.runs.load(Ordering::SeqCst), 1);

        assert!(rt.dispose(mock.id));
        assert!(!rt.contains(mock.id));
        assert!(!rt.dispose(mock.id));
    }

    #[test]
    fn runtime_notifies_dependents() {
        let rt = Runtime::new();
        let source = rt.register_node(Node::source());
        let derived = rt.register_node(Node::computed());
        let observer = MockReactive::register(&rt, false);

        {
            let mut state = rt.state();
            state.graph.add_edge(source, derived);
            state.graph.add_edge(derived, observer.id);
            state.graph.get_node_mut(derived).unwrap().mark_clean();
            state.graph.get_node_mut(observer.id).unwrap().mark_clean();
        }

        // Auto flush runs the observer straight away
        assert!(rt.source_changed(source));

        assert!(rt.is_dirty(derived));
        assert_eq!(observer.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn runtime_replaces_dependencies() {
        let rt = Runtime::new();
        let a = rt.register_node(Node::source());
        let b = rt.register_node(Node::source());
        let node = rt.register_node(Node::computed());

        let eval = rt.begin_evaluation(node).unwrap();
        assert!(eval.finish(Reads::from_slice(&[a, b]), true));
        assert_eq!(rt.dependencies(node), vec![a, b]);

        let eval = rt.begin_evaluation(node).unwrap();
        assert!(eval.finish(Reads::from_slice(&[b]), true));
        assert_eq!(rt.dependencies(node), vec![b]);
        assert!(rt.dependents(a).is_empty());
    }

    #[test]
    fn failed_evaluation_leaves_node_dirty() {
        let rt = Runtime::new();
        let node = rt.register_node(Node::computed());

        let eval = rt.begin_evaluation(node).unwrap();
        assert!(!rt.is_dirty(node));
        eval.finish(Reads::new(), false);
        assert!(rt.is_dirty(node));

        // Abandoned evaluations (panics) also leave it dirty
        let eval = rt.begin_evaluation(node).unwrap();
        drop(eval);
        assert!(rt.is_dirty(node));
    }

    #[test]
    fn observer_failures_are_reported_once() {
        let rt = Runtime::new();
        let mock = MockReactive::register(&rt, true);

        let report = rt.flush();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].node, mock.id);

        assert!(rt.flush().failures.is_empty());
    }

    #[test]
    fn frozen_sources_do_not_propagate() {
        let rt = Runtime::new();
        let source = rt.register_node(Node::source());
        let derived = rt.register_node(Node::computed());
        {
            let mut state = rt.state();
            state.graph.add_edge(source, derived);
            state.graph.get_node_mut(derived).unwrap().mark_clean();
        }

        rt.freeze(source);
        assert!(rt.is_frozen(source));
        assert!(!rt.source_changed(source));
        assert!(!rt.is_dirty(derived));

        // One-flush expiry
        rt.flush();
        assert!(!rt.is_frozen(source));
        assert!(rt.source_changed(source));
        assert!(rt.is_dirty(derived));
    }

    #[test]
    fn flush_with_runs_before_freezes_expire() {
        let rt = Runtime::new();
        let source = rt.register_node(Node::source());

        rt.freeze(source);
        assert!(rt.flush_with(|_| rt.is_frozen(source)));
        assert!(!rt.is_frozen(source));
        assert_eq!(rt.phase(), FlushPhase::Idle);
    }

    #[test]
    fn auto_flush_keeps_reports_until_flushed() {
        let rt = Runtime::new();
        let source = rt.register_node(Node::source());
        let mock = MockReactive::register(&rt, true);
        rt.state().graph.add_edge(source, mock.id);
        rt.flush();
        let runs = mock.runs.load(Ordering::SeqCst);

        assert!(rt.source_changed(source));
        assert!(rt.source_changed(source));
        assert_eq!(mock.runs.load(Ordering::SeqCst), runs + 2);

        // Both runs flushed on their own; the failures wait for the host
        assert_eq!(rt.flush().failures.len(), 2);
        assert!(rt.flush().failures.is_empty());
    }

    #[test]
    fn invalidate_later_requires_an_evaluation() {
        let rt = Runtime::new();
        assert_eq!(
            rt.invalidate_later(Duration::from_millis(10)),
            Err(ReactiveError::NoActiveEvaluation)
        );
        assert!(rt.next_deadline().is_none());
    }

    #[test]
    fn batch_defers_until_closed() {
        let rt = Runtime::new();
        let guard = rt.hold();
        assert_eq!(rt.phase(), FlushPhase::Collecting);
        assert!(guard.release());
        assert_eq!(rt.phase(), FlushPhase::Idle);

        let value = rt.batch(|| 7);
        assert_eq!(value, 7);
    }
}
