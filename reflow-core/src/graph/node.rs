//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the dependency graph.
///
/// Ids come from a process-wide counter, so nodes of different sessions can
/// never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A value cell. Roots of the graph: no dependencies, only dependents.
    Source,

    /// A lazily evaluated, memoized expression.
    Computed,

    /// An eager side-effecting node. Leaves of the graph.
    Observer,

    /// A named output binding. Lazily valued like a computed, but collected
    /// into the flush report when it becomes dirty.
    Output,
}

impl NodeKind {
    /// Eager nodes are queued into the flush batch when invalidated.
    pub fn is_eager(&self) -> bool {
        matches!(self, NodeKind::Observer | NodeKind::Output)
    }
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's last evaluation is still valid.
    Clean,

    /// An upstream value changed since the last evaluation, or the node has
    /// never been evaluated.
    Dirty,
}

bitflags! {
    /// Policy flags attached to a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u8 {
        /// Mutations of this cell do not propagate.
        const FROZEN = 1 << 0;
        /// Only the declared triggers are tracked.
        const EVENT_GATED = 1 << 1;
        /// Skip the body while every trigger is unset.
        const IGNORE_NONE = 1 << 2;
        /// Do not run the body at registration.
        const IGNORE_INIT = 1 << 3;
    }
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    dirty: DirtyState,
    flags: NodeFlags,

    /// Higher priorities run first within a flush cycle.
    priority: i32,

    /// Registration sequence, assigned by the graph. Used as tie-break.
    order: u64,

    label: Option<String>,

    /// Nodes that this node read during its last evaluation.
    dependencies: IndexSet<NodeId>,

    /// Nodes that read this node during their last evaluation.
    dependents: IndexSet<NodeId>,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            dirty: match kind {
                NodeKind::Source => DirtyState::Clean,
                // Start dirty to ensure first computation
                _ => DirtyState::Dirty,
            },
            flags: NodeFlags::empty(),
            priority: 0,
            order: 0,
            label: None,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn source() -> Self {
        Self::new(NodeKind::Source)
    }

    pub fn computed() -> Self {
        Self::new(NodeKind::Computed)
    }

    pub fn observer() -> Self {
        Self::new(NodeKind::Observer)
    }

    pub fn output() -> Self {
        Self::new(NodeKind::Output)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    pub fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: NodeFlags, enabled: bool) {
        self.flags.set(flag, enabled);
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub(crate) fn set_order(&mut self, order: u64) {
        self.order = order;
    }

    /// Human readable name for logs and error messages.
    pub fn label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{:?} {}", self.kind, self.id).to_lowercase(),
        }
    }

    pub fn add_dependency(&mut self, node_id: NodeId) {
        self.dependencies.insert(node_id);
    }

    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.shift_remove(&node_id);
    }

    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    /// Take the dependency set, leaving it empty.
    pub(crate) fn take_dependencies(&mut self) -> IndexSet<NodeId> {
        std::mem::take(&mut self.dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn source_node_starts_clean() {
        let node = Node::source();
        assert_eq!(node.kind(), NodeKind::Source);
        assert!(node.is_clean());
    }

    #[test]
    fn evaluated_nodes_start_dirty() {
        assert_eq!(Node::computed().dirty_state(), DirtyState::Dirty);
        assert_eq!(Node::observer().dirty_state(), DirtyState::Dirty);
        assert_eq!(Node::output().dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn only_observers_and_outputs_are_eager() {
        assert!(!NodeKind::Source.is_eager());
        assert!(!NodeKind::Computed.is_eager());
        assert!(NodeKind::Observer.is_eager());
        assert!(NodeKind::Output.is_eager());
    }

    #[test]
    fn dependency_management() {
        let mut node = Node::computed();
        let dep1 = NodeId::new();
        let dep2 = NodeId::new();

        node.add_dependency(dep1);
        node.add_dependency(dep2);
        node.add_dependency(dep1);

        assert_eq!(node.dependencies().len(), 2);
        assert_eq!(node.dependencies().get_index(0), Some(&dep1));

        node.remove_dependency(dep1);
        assert!(!node.dependencies().contains(&dep1));
        assert_eq!(node.dependencies().len(), 1);
    }

    #[test]
    fn flags_toggle() {
        let mut node = Node::source();
        assert!(!node.flags().contains(NodeFlags::FROZEN));

        node.set_flag(NodeFlags::FROZEN, true);
        assert!(node.flags().contains(NodeFlags::FROZEN));

        node.set_flag(NodeFlags::FROZEN, false);
        assert!(node.flags().is_empty());
    }

    #[test]
    fn labels_fall_back_to_kind_and_id() {
        let node = Node::computed();
        assert_eq!(node.label(), format!("computed {}", node.id()));

        let named = Node::output().with_label("greeting");
        assert_eq!(named.label(), "greeting");
    }
}
