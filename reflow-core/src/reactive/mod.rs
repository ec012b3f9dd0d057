//! Reactive Primitives
//!
//! This module implements the core reactive system: cells, computeds and
//! observers, tied together by a per-session [`Runtime`].
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. When a cell's value is read
//! within an evaluation (a computed or an observer), the read is recorded as
//! a dependency. When the value changes, all dependents are invalidated.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates
//! only when one of its dependencies changed and someone reads it again.
//! Outputs are computeds whose invalidation is reported by name.
//!
//! ## Observers
//!
//! An Observer is a side-effecting computation that re-runs in the flush
//! after one of its dependencies changed.
//!
//! # Implementation Notes
//!
//! Dependencies are detected automatically through a thread-local stack of
//! evaluation frames. Every evaluation records exactly what it read, and that
//! set replaces its previous dependencies, so conditional reads never leave
//! stale edges behind.

mod cell;
mod computed;
mod context;
mod gate;
mod observer;
mod runtime;
mod scheduler;
mod scope;

pub use cell::Cell;
pub use computed::{Computed, ComputedBuilder};
pub use context::{ReactiveContext, Reads};
pub use gate::{isolate, req, Required, Trigger};
pub use observer::{Observer, ObserverBuilder};
pub use runtime::{BatchGuard, FlushReport, ObserverFailure, Reactive, Runtime, RuntimeId};
pub use scheduler::{FlushPhase, Scheduler};
pub use scope::{ReactiveNode, Scope};
