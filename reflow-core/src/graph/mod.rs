//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between cells and the computations that read them.
//!
//! # Overview
//!
//! The graph is bipartite in spirit: sources (cells) only have dependents,
//! observers and outputs only have dependencies, computeds sit in between.
//!
//! - Nodes represent cells, computeds, observers and outputs
//! - Edges represent dependencies: if A read B, there is an edge from B to A
//!
//! Edges are never declared up front. Each evaluation records what it read
//! and the runtime replaces the node's whole dependency set with that record,
//! so a read that stops happening stops causing invalidation.
//!
//! # Design Decisions
//!
//! 1. We use a centralized graph rather than distributed linked lists because:
//!    - It enables efficient topological ordering for batch updates
//!    - It keeps dirty propagation to a single walk per change
//!    - Teardown of a node is one call that removes both edge directions
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod dependency;
mod node;

pub use dependency::{DependencyGraph, EdgeUpdate, Invalidation};
pub use node::{DirtyState, Node, NodeFlags, NodeId, NodeKind};
