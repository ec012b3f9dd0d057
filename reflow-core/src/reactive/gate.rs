//! Isolation and Event-Gating
//!
//! - [`isolate`] runs a closure whose reads are live but untracked.
//! - A [`Trigger`] names one piece of reactive state that may re-run a gated
//!   computed or observer. A gated node depends on its triggers only; every
//!   other read in its body is isolated.
//! - [`req`] turns a "not provided" value into the silent
//!   [`ReactiveError::Cancelled`] condition.

use std::fmt;
use std::sync::Arc;

use super::cell::Cell;
use super::computed::Computed;
use super::context::ReactiveContext;
use crate::error::{ReactiveError, Result};
use crate::graph::NodeId;

/// Run `f` without recording any of its reads as dependencies of the
/// enclosing evaluation.
pub fn isolate<R>(f: impl FnOnce() -> R) -> R {
    let _frame = ReactiveContext::isolated();
    f()
}

/// Values that can be "not provided": empty strings, `None`, `false`, empty
/// collections.
pub trait Required {
    fn is_provided(&self) -> bool;
}

impl Required for bool {
    fn is_provided(&self) -> bool {
        *self
    }
}

impl<T> Required for Option<T> {
    fn is_provided(&self) -> bool {
        self.is_some()
    }
}

impl Required for String {
    fn is_provided(&self) -> bool {
        !self.is_empty()
    }
}

impl Required for &str {
    fn is_provided(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Required for Vec<T> {
    fn is_provided(&self) -> bool {
        !self.is_empty()
    }
}

impl Required for serde_json::Value {
    fn is_provided(&self) -> bool {
        use serde_json::Value;
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Number(_) => true,
        }
    }
}

/// Pass `value` through if it is provided, otherwise cancel the current
/// evaluation silently.
///
/// ```rust,ignore
/// let greeting = rt.computed(move || {
///     let name = req(name.get()?)?;
///     Ok(format!("Hello {name}!"))
/// });
/// ```
pub fn req<R: Required>(value: R) -> Result<R> {
    if value.is_provided() {
        Ok(value)
    } else {
        Err(ReactiveError::Cancelled)
    }
}

type Probe = Arc<dyn Fn() -> Result<bool> + Send + Sync>;

/// A piece of reactive state that re-runs a gated node when it changes.
///
/// Probing a trigger reads it (tracked) and reports whether it currently
/// holds a provided value.
#[derive(Clone)]
pub struct Trigger {
    node: NodeId,
    probe: Probe,
}

impl Trigger {
    /// Fire on changes of `cell`. It counts as unset while the cell is empty.
    pub fn cell<T>(cell: &Cell<T>) -> Self
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let cell = cell.clone();
        Self {
            node: cell.node_id(),
            probe: Arc::new(move || Ok(cell.is_set())),
        }
    }

    /// Fire on changes of `cell`. It counts as unset while the cell is empty
    /// or `provided` returns `false` for its value.
    pub fn cell_when<T, F>(cell: &Cell<T>, provided: F) -> Self
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let cell = cell.clone();
        Self {
            node: cell.node_id(),
            probe: Arc::new(move || Ok(cell.with(|value| provided(value)).unwrap_or(false))),
        }
    }

    /// Fire when `computed` is invalidated. Silent failures count as unset;
    /// hard failures propagate.
    pub fn computed<T>(computed: &Computed<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let computed = computed.clone();
        Self {
            node: computed.node_id(),
            probe: Arc::new(move || match computed.get() {
                Ok(_) => Ok(true),
                Err(err) if err.is_silent() => Ok(false),
                Err(err) => Err(err),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub(crate) fn probe(&self) -> Result<bool> {
        (self.probe)()
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger").field("node", &self.node).finish()
    }
}

impl<T> From<&Cell<T>> for Trigger
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn from(cell: &Cell<T>) -> Self {
        Trigger::cell(cell)
    }
}

impl<T> From<&Computed<T>> for Trigger
where
    T: Clone + Send + Sync + 'static,
{
    fn from(computed: &Computed<T>) -> Self {
        Trigger::computed(computed)
    }
}

/// Event-gating policy of one node.
#[derive(Clone, Debug)]
pub(crate) struct Gate {
    triggers: Vec<Trigger>,
    ignore_none: bool,
}

impl Gate {
    pub(crate) fn new(triggers: Vec<Trigger>, ignore_none: bool) -> Self {
        Self {
            triggers,
            ignore_none,
        }
    }

    /// Read every trigger (tracked) and decide whether the body should run.
    ///
    /// All triggers are probed, even after one is found provided, so the
    /// node subscribes to the full trigger list.
    pub(crate) fn probe(&self) -> Result<bool> {
        let mut any_provided = false;
        for trigger in &self.triggers {
            any_provided |= trigger.probe()?;
        }
        Ok(!self.ignore_none || any_provided)
    }
}
