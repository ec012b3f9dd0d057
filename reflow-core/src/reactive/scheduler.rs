//! Flush Scheduler
//!
//! Pure bookkeeping for the flush cycle. The runtime owns one of these behind
//! its state lock and drives it; nothing in here runs user code.
//!
//! # State Machine
//!
//! ```text
//!   Idle ──mutation / batch──▶ Collecting ──flush──▶ Flushing ──done──▶ Idle
//!                                  ▲                     │
//!                                  └── work left over ───┘
//! ```
//!
//! Mutations made while `Flushing` go into the pending set, which the
//! running flush drains in its next cycle. The flush routine is never
//! re-entered.

use indexmap::IndexSet;

use crate::graph::NodeId;

/// Phase of the flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPhase {
    /// Nothing pending.
    #[default]
    Idle,
    /// Invalidations are accumulating, no flush running.
    Collecting,
    /// A flush is draining the pending set.
    Flushing,
}

/// Pending-batch bookkeeping for one runtime.
#[derive(Debug, Default)]
pub struct Scheduler {
    phase: FlushPhase,
    batch_depth: usize,

    /// Eager nodes waiting for the next flush cycle, deduplicated and kept in
    /// invalidation order.
    pending: IndexSet<NodeId>,

    /// Cells frozen until the end of the next completed flush.
    frozen: Vec<NodeId>,

    flushes: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    pub fn is_flushing(&self) -> bool {
        self.phase == FlushPhase::Flushing
    }

    /// Queue an eager node for the next flush cycle.
    ///
    /// Queueing the same node twice before it runs is a no-op.
    pub fn enqueue(&mut self, node: NodeId) {
        self.pending.insert(node);
        if self.phase == FlushPhase::Idle {
            self.phase = FlushPhase::Collecting;
        }
    }

    pub fn enqueue_all<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        for node in nodes {
            self.enqueue(node);
        }
    }

    /// Forget a node, e.g. because it was disposed.
    pub fn dequeue(&mut self, node: NodeId) {
        self.pending.shift_remove(&node);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Open a batch. Flushing is deferred until every batch is closed.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
        if self.phase == FlushPhase::Idle {
            self.phase = FlushPhase::Collecting;
        }
    }

    /// Close a batch. Returns `true` when the caller may flush now.
    pub fn end_batch(&mut self) -> bool {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.in_batch() || self.is_flushing() {
            return false;
        }
        if self.pending.is_empty() {
            self.phase = FlushPhase::Idle;
        }
        true
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    /// Whether a mutation happening right now may trigger an immediate flush.
    pub fn can_flush_now(&self) -> bool {
        !self.in_batch() && !self.is_flushing()
    }

    /// Enter `Flushing`. Returns `false` if a flush is already running.
    pub fn begin_flush(&mut self) -> bool {
        if self.is_flushing() {
            return false;
        }
        self.phase = FlushPhase::Flushing;
        true
    }

    /// Take the current batch, leaving an empty pending set for mutations
    /// made while it runs.
    pub fn take_pending(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Leave `Flushing`. Returns the cells whose freeze expires now.
    pub fn end_flush(&mut self) -> Vec<NodeId> {
        self.phase = if self.pending.is_empty() && !self.in_batch() {
            FlushPhase::Idle
        } else {
            FlushPhase::Collecting
        };
        self.flushes += 1;
        std::mem::take(&mut self.frozen)
    }

    /// Remember a frozen cell so the current (or next) flush thaws it.
    pub fn freeze_until_flush(&mut self, cell: NodeId) {
        if !self.frozen.contains(&cell) {
            self.frozen.push(cell);
        }
    }

    /// Forget a freeze that was lifted early.
    pub fn forget_freeze(&mut self, cell: NodeId) {
        self.frozen.retain(|id| *id != cell);
    }

    /// Number of completed flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_moves_idle_to_collecting() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.phase(), FlushPhase::Idle);

        scheduler.enqueue(NodeId::new());
        assert_eq!(scheduler.phase(), FlushPhase::Collecting);
    }

    #[test]
    fn pending_is_deduplicated_and_ordered() {
        let mut scheduler = Scheduler::new();
        let (a, b) = (NodeId::new(), NodeId::new());

        scheduler.enqueue_all([b, a, b, a]);
        assert_eq!(scheduler.take_pending(), vec![b, a]);
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn nested_batches_defer_flush() {
        let mut scheduler = Scheduler::new();
        scheduler.begin_batch();
        scheduler.begin_batch();
        assert!(scheduler.in_batch());
        assert!(!scheduler.can_flush_now());

        assert!(!scheduler.end_batch());
        assert!(scheduler.in_batch());
        assert!(scheduler.end_batch());
        assert!(!scheduler.in_batch());
        assert!(scheduler.can_flush_now());
        assert_eq!(scheduler.phase(), FlushPhase::Idle);
    }

    #[test]
    fn flush_is_not_reentrant() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.begin_flush());
        assert!(!scheduler.begin_flush());
        assert!(!scheduler.can_flush_now());

        // Mutations during a flush wait for the next cycle
        let late = NodeId::new();
        scheduler.enqueue(late);
        assert_eq!(scheduler.phase(), FlushPhase::Flushing);

        scheduler.begin_batch();
        assert!(!scheduler.end_batch());

        assert_eq!(scheduler.take_pending(), vec![late]);
        scheduler.end_flush();
        assert_eq!(scheduler.phase(), FlushPhase::Idle);
        assert_eq!(scheduler.flush_count(), 1);
    }

    #[test]
    fn leftover_work_returns_to_collecting() {
        let mut scheduler = Scheduler::new();
        scheduler.begin_flush();
        scheduler.enqueue(NodeId::new());
        scheduler.end_flush();
        assert_eq!(scheduler.phase(), FlushPhase::Collecting);
    }

    #[test]
    fn freezes_expire_at_end_of_flush() {
        let mut scheduler = Scheduler::new();
        let cell = NodeId::new();

        scheduler.freeze_until_flush(cell);
        scheduler.freeze_until_flush(cell);
        scheduler.begin_flush();

        assert_eq!(scheduler.end_flush(), vec![cell]);
        assert!(scheduler.end_flush().is_empty());
    }
}
