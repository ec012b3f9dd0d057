//! Error Types
//!
//! Every fallible reactive operation returns [`ReactiveError`]. The variants
//! fall into two groups:
//!
//! - *Silent* conditions (`ValueNotAvailable`, `Cancelled`) mean "there is
//!   nothing to produce yet". They short-circuit the current evaluation chain
//!   and are never surfaced to the user as failures.
//! - Everything else is a hard error. Hard errors are reported to the host
//!   but never leave the graph in an inconsistent state.

use thiserror::Error;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors produced by the reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A value required to continue has not been provided yet.
    #[error("value not yet available: {0}")]
    ValueNotAvailable(String),

    /// The evaluation was deliberately short-circuited (e.g. by `req`).
    #[error("evaluation cancelled")]
    Cancelled,

    /// A computed transitively read itself during its own evaluation.
    #[error("circular dependency detected while evaluating {0}")]
    CircularDependency(String),

    /// A user computation failed.
    #[error("evaluation of {node} failed: {message}")]
    Evaluation { node: String, message: String },

    /// An observer panicked and the panic was caught at the flush boundary.
    #[error("{node} panicked: {message}")]
    Panicked { node: String, message: String },

    /// The node was destroyed.
    #[error("node {0} has been disposed")]
    Disposed(NodeId),

    /// `invalidate_later` was called with no node being evaluated.
    #[error("invalidate_later called outside of a reactive evaluation")]
    NoActiveEvaluation,

    #[error("unknown input `{0}`")]
    UnknownInput(String),

    #[error("unknown output `{0}`")]
    UnknownOutput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("wire format error: {0}")]
    Wire(String),
}

impl ReactiveError {
    /// Build an evaluation failure from inside a user computation.
    ///
    /// The node label is filled in by the runtime when the error crosses a
    /// node boundary without one.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Evaluation {
            node: String::new(),
            message: message.into(),
        }
    }

    /// Whether this is a soft condition that should skip downstream work
    /// without being reported.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::ValueNotAvailable(_) | Self::Cancelled)
    }

    /// Attach a node label to an unlabeled evaluation failure.
    pub(crate) fn within(self, label: &str) -> Self {
        match self {
            Self::Evaluation { node, message } if node.is_empty() => Self::Evaluation {
                node: label.to_string(),
                message,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for ReactiveError {
    fn from(err: serde_json::Error) -> Self {
        Self::failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_conditions() {
        assert!(ReactiveError::ValueNotAvailable("n".into()).is_silent());
        assert!(ReactiveError::Cancelled.is_silent());
        assert!(!ReactiveError::CircularDependency("p".into()).is_silent());
        assert!(!ReactiveError::failed("boom").is_silent());
    }

    #[test]
    fn within_labels_only_unlabeled_failures() {
        let err = ReactiveError::failed("boom").within("total");
        assert_eq!(
            err,
            ReactiveError::Evaluation {
                node: "total".into(),
                message: "boom".into()
            }
        );

        let labeled = err.clone().within("other");
        assert_eq!(labeled, err);

        assert_eq!(
            ReactiveError::Cancelled.within("total"),
            ReactiveError::Cancelled
        );
    }
}
