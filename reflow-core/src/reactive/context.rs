//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a cell or computed is
//! read, the read is recorded against the computation on top of the stack.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Entering an evaluation pushes a
//! frame; finishing it pops the frame and hands back everything it read,
//! which becomes the node's new dependency set.
//!
//! Isolation pushes a frame with no node. Reads that land on it are dropped,
//! so `isolate` works no matter how deeply it is nested.
//!
//! Frames carry the id of their runtime. A read of a node from a different
//! runtime is never recorded, which keeps sessions that share a thread fully
//! independent.

use std::cell::RefCell;

use smallvec::SmallVec;
use tracing::warn;

use super::runtime::RuntimeId;
use crate::graph::NodeId;

/// Reads recorded by one evaluation.
pub type Reads = SmallVec<[NodeId; 8]>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
struct Frame {
    runtime: Option<RuntimeId>,
    /// `None` for isolation frames.
    node: Option<NodeId>,
    reads: Reads,
}

/// Guard that pops its frame when finished or dropped.
///
/// Dropping pops too, so the stack stays balanced even if the computation
/// panics.
pub struct ReactiveContext {
    node: Option<NodeId>,
    finished: bool,
}

impl ReactiveContext {
    /// Enter a new evaluation frame for `node`.
    ///
    /// While this frame is on top, reads of nodes of `runtime` are recorded
    /// against it.
    pub fn enter(runtime: RuntimeId, node: NodeId) -> Self {
        Self::push(Frame {
            runtime: Some(runtime),
            node: Some(node),
            reads: Reads::new(),
        })
    }

    /// Enter an isolation frame: reads return live values but are not
    /// recorded anywhere.
    pub fn isolated() -> Self {
        Self::push(Frame {
            runtime: None,
            node: None,
            reads: Reads::new(),
        })
    }

    fn push(frame: Frame) -> Self {
        let node = frame.node;
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(frame));
        Self {
            node,
            finished: false,
        }
    }

    /// Pop the frame and return the reads it recorded.
    pub fn finish(mut self) -> Reads {
        self.finished = true;
        self.pop()
    }

    fn pop(&self) -> Reads {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            match popped {
                Some(frame) => {
                    // Verify we're popping the right frame.
                    debug_assert_eq!(
                        frame.node, self.node,
                        "ReactiveContext mismatch: expected {:?}, got {:?}",
                        self.node, frame.node
                    );
                    frame.reads
                }
                None => Reads::new(),
            }
        })
    }

    /// Check if reads are currently being tracked.
    pub fn is_tracking() -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .is_some_and(|frame| frame.node.is_some())
        })
    }

    /// The node being evaluated for `runtime`.
    ///
    /// Isolation frames are looked through: an isolated section still runs on
    /// behalf of the node that entered it.
    pub fn current_node(runtime: RuntimeId) -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|frame| frame.node.is_some())
                .filter(|frame| frame.runtime == Some(runtime))
                .and_then(|frame| frame.node)
        })
    }

    /// Record a read of `node` against the top frame.
    pub fn track(runtime: RuntimeId, node: NodeId) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(frame) = stack.last_mut() else {
                return;
            };
            match (frame.runtime, frame.node) {
                (Some(owner), Some(_)) if owner == runtime => frame.reads.push(node),
                (Some(owner), Some(reader)) => {
                    warn!(%node, %reader, ?owner, "ignoring read across runtimes");
                }
                _ => {}
            }
        });
    }

    /// Whether `node` of `runtime` has a frame anywhere on the stack.
    ///
    /// Reading a computed that is already being evaluated means it depends
    /// on itself.
    pub fn is_evaluating(runtime: RuntimeId, node: NodeId) -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|frame| frame.runtime == Some(runtime) && frame.node == Some(node))
        })
    }

    /// Reads recorded so far by the top frame.
    pub fn reads() -> Reads {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|frame| frame.reads.clone())
                .unwrap_or_default()
        })
    }

    /// Number of frames on the stack.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_node() {
        let rt = RuntimeId::new();
        let id = NodeId::new();

        assert!(!ReactiveContext::is_tracking());
        assert!(ReactiveContext::current_node(rt).is_none());

        {
            let _ctx = ReactiveContext::enter(rt, id);

            assert!(ReactiveContext::is_tracking());
            assert_eq!(ReactiveContext::current_node(rt), Some(id));
        }

        // Frame should be cleaned up after drop
        assert!(!ReactiveContext::is_tracking());
        assert_eq!(ReactiveContext::depth(), 0);
    }

    #[test]
    fn finish_returns_reads() {
        let rt = RuntimeId::new();
        let ctx = ReactiveContext::enter(rt, NodeId::new());

        let (a, b) = (NodeId::new(), NodeId::new());
        ReactiveContext::track(rt, a);
        assert_eq!(ReactiveContext::reads().as_slice(), &[a]);
        ReactiveContext::track(rt, b);

        let reads = ctx.finish();
        assert!(ReactiveContext::reads().is_empty());
        assert_eq!(reads.as_slice(), &[a, b]);
        assert_eq!(ReactiveContext::depth(), 0);
    }

    #[test]
    fn nested_contexts() {
        let rt = RuntimeId::new();
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        {
            let _ctx1 = ReactiveContext::enter(rt, id1);
            assert_eq!(ReactiveContext::current_node(rt), Some(id1));

            {
                let _ctx2 = ReactiveContext::enter(rt, id2);
                assert_eq!(ReactiveContext::current_node(rt), Some(id2));
                assert!(ReactiveContext::is_evaluating(rt, id1));
            }

            // After inner frame drops, outer should be current
            assert_eq!(ReactiveContext::current_node(rt), Some(id1));
            assert!(!ReactiveContext::is_evaluating(rt, id2));
        }

        assert!(ReactiveContext::current_node(rt).is_none());
    }

    #[test]
    fn isolation_drops_reads() {
        let rt = RuntimeId::new();
        let node = NodeId::new();
        let outer = ReactiveContext::enter(rt, node);

        {
            let _iso = ReactiveContext::isolated();
            assert!(!ReactiveContext::is_tracking());
            assert_eq!(ReactiveContext::current_node(rt), Some(node));
            ReactiveContext::track(rt, NodeId::new());
            assert!(ReactiveContext::reads().is_empty());
        }

        assert!(outer.finish().is_empty());
    }

    #[test]
    fn reads_from_other_runtimes_are_ignored() {
        let mine = RuntimeId::new();
        let theirs = RuntimeId::new();
        let ctx = ReactiveContext::enter(mine, NodeId::new());

        ReactiveContext::track(theirs, NodeId::new());

        assert!(ctx.finish().is_empty());
    }
}
