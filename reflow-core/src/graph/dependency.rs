//! Dependency Graph Store
//!
//! Owns every node of one runtime and both directions of every edge. The
//! runtime mutates it under its state lock; nothing in here calls user code.
//!
//! # Algorithms
//!
//! Invalidation is a breadth-first walk from the changed node through its
//! dependents. Each node is visited at most once per walk, computeds are
//! marked dirty and walked through, eager nodes are collected for the flush
//! batch.
//!
//! Execution order for a batch is a topological sort (Kahn's algorithm)
//! restricted to the batch, picking among ready nodes by priority, then
//! registration order. Nodes caught in a cycle are appended in the same
//! priority order instead of being dropped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use indexmap::IndexSet;
use smallvec::SmallVec;
use tracing::trace;

use super::node::{DirtyState, Node, NodeFlags, NodeId, NodeKind};

/// Result of an invalidation walk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Observers and outputs reached by the walk, in visit order.
    pub eager: Vec<NodeId>,
    /// Computeds marked dirty by the walk, in visit order.
    pub computed: Vec<NodeId>,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.eager.is_empty() && self.computed.is_empty()
    }
}

/// Edge changes produced by replacing a node's dependency set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EdgeUpdate {
    pub added: SmallVec<[NodeId; 4]>,
    pub removed: SmallVec<[NodeId; 4]>,
    /// Computeds left without dependents, cleaned as a cascade.
    pub orphaned: Vec<NodeId>,
}

/// The dependency graph of one runtime.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<NodeId, Node>,
    next_order: u64,
}

type ReadyKey = (i32, Reverse<u64>, NodeId);

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph, stamping its registration order.
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = node.id();
        node.set_order(self.next_order);
        self.next_order += 1;
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node. Computeds that only this
    /// node was reading are cascade-cleaned.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let mut node = self.nodes.remove(&node_id)?;

        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        let mut orphaned = Vec::new();
        for dep_id in node.take_dependencies() {
            self.detach(node_id, dep_id, &mut orphaned);
        }
        if !orphaned.is_empty() {
            trace!(node = %node_id, ?orphaned, "cascade-cleaned orphaned computeds");
        }

        Some(node)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn dirty_state(&self, node_id: NodeId) -> Option<DirtyState> {
        self.nodes.get(&node_id).map(Node::dirty_state)
    }

    pub fn kind(&self, node_id: NodeId) -> Option<NodeKind> {
        self.nodes.get(&node_id).map(Node::kind)
    }

    pub fn flags(&self, node_id: NodeId) -> Option<NodeFlags> {
        self.nodes.get(&node_id).map(Node::flags)
    }

    pub fn set_flag(&mut self, node_id: NodeId, flag: NodeFlags, enabled: bool) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.set_flag(flag, enabled);
        }
    }

    pub fn label(&self, node_id: NodeId) -> String {
        self.nodes
            .get(&node_id)
            .map(Node::label)
            .unwrap_or_else(|| format!("node {node_id}"))
    }

    /// Nodes `node_id` read during its last evaluation.
    pub fn dependencies_of(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node_id)
            .map(|n| n.dependencies().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes that read `node_id` during their last evaluation.
    pub fn dependents_of(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node_id)
            .map(|n| n.dependents().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if dependency == dependent
            || !self.nodes.contains_key(&dependency)
            || !self.nodes.contains_key(&dependent)
        {
            return;
        }
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    /// Replace the dependency set of `node_id` with exactly `reads`.
    ///
    /// Self reads and reads of unknown nodes are ignored. Edges that are not
    /// re-read are dropped, and any computed left without dependents is
    /// cascade-cleaned: marked dirty with its own upstream edges dropped, so
    /// it recomputes from scratch if anything reads it again.
    pub fn replace_dependencies<I>(&mut self, node_id: NodeId, reads: I) -> EdgeUpdate
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut update = EdgeUpdate::default();

        let new_deps: IndexSet<NodeId> = reads
            .into_iter()
            .filter(|id| *id != node_id && self.nodes.contains_key(id))
            .collect();

        let old_deps = match self.nodes.get_mut(&node_id) {
            Some(node) => node.take_dependencies(),
            None => return update,
        };

        for &dep in &new_deps {
            if !old_deps.contains(&dep) {
                update.added.push(dep);
            }
            self.add_edge(dep, node_id);
        }

        for dep in old_deps {
            if !new_deps.contains(&dep) {
                update.removed.push(dep);
                self.detach(node_id, dep, &mut update.orphaned);
            }
        }

        if !update.added.is_empty() || !update.removed.is_empty() {
            trace!(
                node = %node_id,
                added = ?update.added,
                removed = ?update.removed,
                "dependency set changed"
            );
        }

        update
    }

    /// Drop the `dependent -> dependency` back edge and cascade-clean
    /// computeds left without dependents.
    fn detach(&mut self, dependent: NodeId, dependency: NodeId, orphaned: &mut Vec<NodeId>) {
        let mut stack = vec![(dependent, dependency)];

        while let Some((from, to)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&to) else {
                continue;
            };
            node.remove_dependent(from);

            if node.kind() == NodeKind::Computed && node.dependents().is_empty() {
                node.mark_dirty();
                for upstream in node.take_dependencies() {
                    stack.push((to, upstream));
                }
                orphaned.push(to);
            }
        }
    }

    /// Mark everything downstream of `source` dirty.
    ///
    /// With `include_source`, `source` itself is invalidated too (used for
    /// timer expiry on computeds and observers). Source cells never become
    /// dirty themselves.
    pub fn invalidate_from(&mut self, source: NodeId, include_source: bool) -> Invalidation {
        let mut result = Invalidation::default();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        if include_source {
            queue.push_back(source);
        } else if let Some(node) = self.nodes.get(&source) {
            queue.extend(node.dependents().iter().copied());
        }

        // BFS to propagate dirty status
        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            let Some(node) = self.nodes.get_mut(&node_id) else {
                continue;
            };

            match node.kind() {
                NodeKind::Source => {}
                NodeKind::Computed => {
                    node.mark_dirty();
                    result.computed.push(node_id);
                }
                NodeKind::Observer | NodeKind::Output => {
                    node.mark_dirty();
                    result.eager.push(node_id);
                }
            }

            queue.extend(node.dependents().iter().copied());
        }

        trace!(
            source = %source,
            computed = result.computed.len(),
            eager = result.eager.len(),
            "invalidation walk"
        );

        result
    }

    /// Order a batch for execution.
    ///
    /// Dependencies come before dependents; among ready nodes, higher
    /// priority first, then earlier registration. Unknown ids are skipped.
    pub fn execution_order(&self, batch: &[NodeId]) -> Vec<NodeId> {
        let node_set: HashSet<NodeId> = batch
            .iter()
            .copied()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut ready: BinaryHeap<ReadyKey> = BinaryHeap::new();
        let mut result = Vec::with_capacity(node_set.len());

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in &node_set {
            let node = &self.nodes[&node_id];
            let degree = node
                .dependencies()
                .iter()
                .filter(|d| node_set.contains(d))
                .count();
            in_degree.insert(node_id, degree);
            if degree == 0 {
                ready.push(self.ready_key(node));
            }
        }

        // Kahn's algorithm
        while let Some((_, _, node_id)) = ready.pop() {
            result.push(node_id);

            for dependent_id in self.nodes[&node_id].dependents() {
                if let Some(degree) = in_degree.get_mut(dependent_id) {
                    if *degree == 0 {
                        continue;
                    }
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(self.ready_key(&self.nodes[dependent_id]));
                    }
                }
            }
        }

        // Anything left is part of a cycle
        if result.len() < node_set.len() {
            let placed: HashSet<NodeId> = result.iter().copied().collect();
            let mut leftover: Vec<ReadyKey> = node_set
                .iter()
                .filter(|id| !placed.contains(id))
                .map(|id| self.ready_key(&self.nodes[id]))
                .collect();
            leftover.sort_unstable_by(|a, b| b.cmp(a));
            result.extend(leftover.into_iter().map(|(_, _, id)| id));
        }

        result
    }

    fn ready_key(&self, node: &Node) -> ReadyKey {
        (node.priority(), Reverse(node.order()), node.id())
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the total number of dependency edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.dependencies().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (DependencyGraph, NodeId, NodeId, NodeId) {
        let mut graph = DependencyGraph::new();
        let source = graph.add_node(Node::source());
        let derived = graph.add_node(Node::computed());
        let observer = graph.add_node(Node::observer());

        graph.add_edge(source, derived);
        graph.add_edge(derived, observer);

        graph.get_node_mut(derived).unwrap().mark_clean();
        graph.get_node_mut(observer).unwrap().mark_clean();

        (graph, source, derived, observer)
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut graph = DependencyGraph::new();

        let id1 = graph.add_node(Node::source());
        let id2 = graph.add_node(Node::computed());

        assert_eq!(graph.node_count(), 2);

        graph.remove_node(id1);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.get_node(id1).is_none());
        assert!(graph.get_node(id2).is_some());
    }

    #[test]
    fn add_and_remove_edges() {
        let mut graph = DependencyGraph::new();

        let source_id = graph.add_node(Node::source());
        let derived_id = graph.add_node(Node::computed());

        graph.add_edge(source_id, derived_id);

        assert_eq!(graph.dependents_of(source_id), vec![derived_id]);
        assert_eq!(graph.dependencies_of(derived_id), vec![source_id]);

        graph.remove_edge(source_id, derived_id);

        assert!(graph.dependents_of(source_id).is_empty());
        assert!(graph.dependencies_of(derived_id).is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn self_edges_are_ignored() {
        let mut graph = DependencyGraph::new();
        let id = graph.add_node(Node::computed());
        graph.add_edge(id, id);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn invalidation_propagates_through_computeds() {
        let (mut graph, source, derived, observer) = chain();

        let inv = graph.invalidate_from(source, false);

        assert_eq!(inv.computed, vec![derived]);
        assert_eq!(inv.eager, vec![observer]);
        assert_eq!(graph.dirty_state(derived), Some(DirtyState::Dirty));
        assert_eq!(graph.dirty_state(observer), Some(DirtyState::Dirty));
        assert_eq!(graph.dirty_state(source), Some(DirtyState::Clean));
    }

    #[test]
    fn diamond_visits_each_node_once() {
        let mut graph = DependencyGraph::new();
        let source = graph.add_node(Node::source());
        let left = graph.add_node(Node::computed());
        let right = graph.add_node(Node::computed());
        let sink = graph.add_node(Node::observer());

        graph.add_edge(source, left);
        graph.add_edge(source, right);
        graph.add_edge(left, sink);
        graph.add_edge(right, sink);

        let inv = graph.invalidate_from(source, false);
        assert_eq!(inv.computed.len(), 2);
        assert_eq!(inv.eager, vec![sink]);
    }

    #[test]
    fn invalidation_survives_cycles() {
        let mut graph = DependencyGraph::new();
        let p = graph.add_node(Node::computed());
        let q = graph.add_node(Node::computed());
        graph.add_edge(p, q);
        graph.add_edge(q, p);

        let inv = graph.invalidate_from(p, true);
        assert_eq!(inv.computed, vec![p, q]);
    }

    #[test]
    fn replace_dependencies_prunes_stale_edges() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(Node::source());
        let b = graph.add_node(Node::source());
        let node = graph.add_node(Node::observer());

        graph.replace_dependencies(node, [a, b]);
        assert_eq!(graph.dependencies_of(node), vec![a, b]);

        let update = graph.replace_dependencies(node, [b, b]);
        assert_eq!(update.removed.as_slice(), &[a]);
        assert!(update.added.is_empty());
        assert_eq!(graph.dependencies_of(node), vec![b]);
        assert!(graph.dependents_of(a).is_empty());
    }

    #[test]
    fn orphaned_computeds_are_cascade_cleaned() {
        let mut graph = DependencyGraph::new();
        let cell = graph.add_node(Node::source());
        let inner = graph.add_node(Node::computed());
        let outer = graph.add_node(Node::computed());
        let observer = graph.add_node(Node::observer());

        graph.replace_dependencies(inner, [cell]);
        graph.replace_dependencies(outer, [inner]);
        graph.replace_dependencies(observer, [outer]);
        graph.get_node_mut(inner).unwrap().mark_clean();
        graph.get_node_mut(outer).unwrap().mark_clean();

        let update = graph.replace_dependencies(observer, []);

        assert_eq!(update.orphaned, vec![outer, inner]);
        assert_eq!(graph.dirty_state(outer), Some(DirtyState::Dirty));
        assert_eq!(graph.dirty_state(inner), Some(DirtyState::Dirty));
        assert!(graph.dependents_of(cell).is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn removing_a_node_drops_both_edge_directions() {
        let (mut graph, source, derived, observer) = chain();

        graph.remove_node(derived);

        assert!(graph.dependents_of(source).is_empty());
        assert!(graph.dependencies_of(observer).is_empty());
    }

    #[test]
    fn execution_order_respects_priority_then_registration() {
        let mut graph = DependencyGraph::new();
        let first = graph.add_node(Node::observer());
        let second = graph.add_node(Node::observer());
        let urgent = graph.add_node(Node::observer().with_priority(10));

        let order = graph.execution_order(&[second, urgent, first]);
        assert_eq!(order, vec![urgent, first, second]);
    }

    #[test]
    fn execution_order_is_topological() {
        let (graph, _, derived, observer) = chain();
        let order = graph.execution_order(&[observer, derived]);
        assert_eq!(order, vec![derived, observer]);
    }

    #[test]
    fn execution_order_keeps_cyclic_nodes() {
        let mut graph = DependencyGraph::new();
        let p = graph.add_node(Node::computed());
        let q = graph.add_node(Node::computed());
        graph.add_edge(p, q);
        graph.add_edge(q, p);

        let order = graph.execution_order(&[q, p]);
        assert_eq!(order, vec![p, q]);
    }
}
