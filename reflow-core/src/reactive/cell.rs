//! Cell Implementation
//!
//! A Cell is the unit of input mutation. It holds a value and is the root
//! of every dependency chain.
//!
//! # How Cells Work
//!
//! 1. When a cell is read within an evaluation (computed/observer), the read
//!    is recorded and becomes a dependency edge when the evaluation ends.
//!
//! 2. When a cell's value changes, the runtime marks every transitive
//!    dependent dirty and queues the eager ones for the next flush.
//!
//! 3. Setting a cell to the value it already holds does nothing.
//!
//! # Empty Cells
//!
//! A cell may have no value yet (an input the client has not sent).
//! Reading it yields [`ReactiveError::ValueNotAvailable`], a silent condition
//! that makes downstream work skip instead of fail.
//!
//! # Freezing
//!
//! A frozen cell still stores new values, but its mutations do not
//! propagate, and computeds or observers that read it are cancelled with
//! [`ReactiveError::Cancelled`]. The read is still recorded, so the reader
//! runs again once the cell changes after the thaw. Reads outside any
//! evaluation stay live.
//!
//! The freeze lifts at the end of the next completed flush, or on
//! [`Cell::thaw`]. Thawing never replays the suppressed invalidation.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};
use crate::graph::{Node, NodeId};

/// A reactive cell holding a value of type T.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the cell. `PartialEq` is needed to
///   skip propagation when a set does not change anything.
///
/// # Example
///
/// ```rust,ignore
/// let count = rt.cell(0);
///
/// // Read the value
/// let value = count.get()?;
///
/// // Update the value (invalidates dependents)
/// count.set(5);
/// ```
pub struct Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    runtime: Runtime,
    node: NodeId,
    label: String,
    value: RwLock<Option<T>>,
    revision: AtomicU64,
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        self.runtime.dispose(self.node);
    }
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(runtime: &Runtime, value: Option<T>, name: Option<String>) -> Self {
        let mut node = Node::source();
        if let Some(name) = &name {
            node = node.with_label(name.clone());
        }
        let label = node.label();
        let node = runtime.register_node(node);

        Self {
            inner: Arc::new(CellInner {
                runtime: runtime.clone(),
                node,
                label,
                value: RwLock::new(value),
                revision: AtomicU64::new(0),
            }),
        }
    }

    /// Get the cell's node id.
    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Get the current value.
    ///
    /// If called within an evaluation, this also records the read as a
    /// dependency.
    pub fn get(&self) -> Result<T> {
        self.inner.runtime.read_source(self.inner.node)?;
        self.inner
            .value
            .read()
            .clone()
            .ok_or_else(|| ReactiveError::ValueNotAvailable(self.inner.label.clone()))
    }

    /// Tracked read that returns `None` for an empty or frozen cell.
    pub fn try_get(&self) -> Option<T> {
        self.inner.runtime.read_source(self.inner.node).ok()?;
        self.inner.value.read().clone()
    }

    /// Tracked read that borrows the value instead of cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.inner.runtime.read_source(self.inner.node)?;
        let guard = self.inner.value.read();
        match guard.as_ref() {
            Some(value) => Ok(f(value)),
            None => Err(ReactiveError::ValueNotAvailable(self.inner.label.clone())),
        }
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> Option<T> {
        self.inner.value.read().clone()
    }

    /// Whether the cell holds a value. Tracked.
    pub fn is_set(&self) -> bool {
        self.inner.runtime.track_read(self.inner.node);
        self.inner.value.read().is_some()
    }

    /// Set a new value and invalidate dependents if it changed.
    pub fn set(&self, value: T) {
        self.store(Some(value), false);
    }

    /// Set a new value and invalidate dependents even if it is unchanged.
    pub fn set_force(&self, value: T) {
        self.store(Some(value), true);
    }

    /// Update the value using a function of the current one.
    ///
    /// Does nothing on an empty cell.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.inner.value.read();
            match guard.as_ref() {
                Some(value) => f(value),
                None => return,
            }
        };
        self.set(new_value);
    }

    /// Return to the "not provided" state.
    pub fn clear(&self) {
        self.store(None, false);
    }

    /// Invalidate dependents without changing the value.
    pub fn invalidate(&self) {
        self.inner.runtime.source_changed(self.inner.node);
    }

    fn store(&self, value: Option<T>, force: bool) {
        let changed = {
            let mut guard = self.inner.value.write();
            let changed = *guard != value;
            if changed {
                *guard = value;
            }
            changed
        };

        if !changed && !force {
            return;
        }
        if changed {
            self.inner.revision.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.runtime.source_changed(self.inner.node);
    }

    /// Suspend propagation until the end of the next completed flush.
    pub fn freeze(&self) {
        self.inner.runtime.freeze(self.inner.node);
    }

    /// Resume propagation for future mutations.
    pub fn thaw(&self) {
        self.inner.runtime.thaw(self.inner.node);
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.runtime.is_frozen(self.inner.node)
    }

    /// Number of times the stored value changed.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::Relaxed)
    }

    /// Number of nodes that read this cell during their last evaluation.
    pub fn dependent_count(&self) -> usize {
        self.inner.runtime.dependents(self.inner.node).len()
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("node", &self.inner.node)
            .field("label", &self.inner.label)
            .field("value", &self.get_untracked())
            .field("revision", &self.revision())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn cell_get_and_set() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        assert_eq!(cell.get(), Ok(0));

        cell.set(42);
        assert_eq!(cell.get(), Ok(42));
        assert_eq!(cell.revision(), 1);
    }

    #[test]
    fn cell_update() {
        let rt = Runtime::new();
        let cell = rt.cell(10);
        cell.update(|v| v + 5);
        assert_eq!(cell.get(), Ok(15));
    }

    #[test]
    fn empty_cell_is_not_available() {
        let rt = Runtime::new();
        let cell = rt.named_cell::<i32>("n", None);

        let err = cell.get().unwrap_err();
        assert_eq!(err, ReactiveError::ValueNotAvailable("n".into()));
        assert!(err.is_silent());
        assert!(!cell.is_set());

        cell.update(|v| v + 1);
        assert!(cell.try_get().is_none());

        cell.set(3);
        assert_eq!(cell.with(|v| v * 2), Ok(6));

        cell.clear();
        assert!(cell.get_untracked().is_none());
    }

    #[test]
    fn unchanged_set_does_not_notify() {
        let rt = Runtime::new();
        let cell = rt.cell(1);
        let runs = Arc::new(AtomicI32::new(0));

        let runs_clone = runs.clone();
        let cell_clone = cell.clone();
        let _observer = rt.observer(move || {
            cell_clone.get()?;
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        cell.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cell.revision(), 0);

        cell.set_force(1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        cell.invalidate();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cell_clone_shares_state() {
        let rt = Runtime::new();
        let cell1 = rt.cell(0);
        let cell2 = cell1.clone();

        cell1.set(42);
        assert_eq!(cell2.get(), Ok(42));

        cell2.set(100);
        assert_eq!(cell1.get(), Ok(100));
        assert_eq!(cell1.node_id(), cell2.node_id());
    }

    #[test]
    fn dropping_last_handle_disposes_node() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        let id = cell.node_id();
        let clone = cell.clone();

        drop(cell);
        assert!(rt.contains(id));

        drop(clone);
        assert!(!rt.contains(id));
    }

    #[test]
    fn freeze_and_thaw() {
        let rt = Runtime::new();
        let cell = rt.cell(0);

        cell.freeze();
        assert!(cell.is_frozen());

        // Stored and readable while frozen
        cell.set(5);
        assert_eq!(cell.get(), Ok(5));

        cell.thaw();
        assert!(!cell.is_frozen());
    }

    #[test]
    fn frozen_reads_cancel_evaluations() {
        let rt = Runtime::new();
        let cell = rt.cell(1);

        let cell_clone = cell.clone();
        let doubled = rt.computed(move || Ok(cell_clone.get()? * 2));
        assert_eq!(doubled.get(), Ok(2));

        cell.freeze();
        cell.set(2);
        doubled.invalidate();
        assert_eq!(doubled.get(), Err(ReactiveError::Cancelled));

        // The cancelled read still subscribed the computed
        assert_eq!(cell.dependent_count(), 1);

        let cell_clone = cell.clone();
        let peeked = rt.computed(move || Ok(cell_clone.try_get().unwrap_or(-1)));
        assert_eq!(peeked.get(), Ok(-1));

        cell.thaw();
        cell.set(3);
        assert_eq!(doubled.get(), Ok(6));
        assert_eq!(peeked.get(), Ok(3));
    }
}
