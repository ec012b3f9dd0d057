//! Ownership scopes.
//!
//! A scope collects nodes created for one purpose (a dynamic section of a
//! page, a module instance) and disposes all of them at once.

use parking_lot::Mutex;
use tracing::debug;

use super::cell::Cell;
use super::computed::Computed;
use super::observer::Observer;
use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::NodeId;

/// Anything backed by a graph node.
pub trait ReactiveNode {
    fn node_id(&self) -> NodeId;
}

impl<T> ReactiveNode for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        Cell::node_id(self)
    }
}

impl<T> ReactiveNode for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        Computed::node_id(self)
    }
}

impl ReactiveNode for Observer {
    fn node_id(&self) -> NodeId {
        Observer::node_id(self)
    }
}

/// Disposes its nodes when dropped or disposed explicitly.
pub struct Scope {
    runtime: Runtime,
    nodes: Mutex<Vec<NodeId>>,
}

impl Scope {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Take ownership of `node`'s lifetime.
    pub fn adopt<N: ReactiveNode>(&self, node: &N) {
        self.nodes.lock().push(node.node_id());
    }

    /// Create an observer owned by this scope.
    pub fn observer<F>(&self, run: F) -> Observer
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let observer = self.runtime.observer(run);
        self.adopt(&observer);
        observer
    }

    /// Create a computed owned by this scope.
    pub fn computed<T, F>(&self, compute: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let computed = self.runtime.computed(compute);
        self.adopt(&computed);
        computed
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Dispose every owned node, most recent first.
    pub fn dispose(&self) {
        let nodes = std::mem::take(&mut *self.nodes.lock());
        if nodes.is_empty() {
            return;
        }
        let count = nodes.len();
        for node in nodes.into_iter().rev() {
            self.runtime.dispose(node);
        }
        debug!(runtime = %self.runtime.id(), nodes = count, "scope disposed");
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_disposes_owned_nodes() {
        let rt = Runtime::new();
        let count = rt.cell(0);

        let observer = {
            let scope = rt.scope();
            let count_clone = count.clone();
            let observer = scope.observer(move || {
                count_clone.get()?;
                Ok(())
            });
            let count_clone = count.clone();
            let doubled = scope.computed(move || Ok(count_clone.get()? * 2));
            assert_eq!(doubled.get(), Ok(0));
            assert_eq!(scope.len(), 2);
            assert_eq!(count.dependent_count(), 2);
            observer
        };

        assert!(observer.is_destroyed());
        assert_eq!(count.dependent_count(), 0);

        count.set(1);
        assert_eq!(observer.run_count(), 1);
    }

    #[test]
    fn explicit_dispose_empties_the_scope() {
        let rt = Runtime::new();
        let scope = rt.scope();
        let cell = rt.cell(1);
        scope.adopt(&cell);

        scope.dispose();
        assert!(scope.is_empty());
        assert!(!rt.contains(cell.node_id()));
    }
}
