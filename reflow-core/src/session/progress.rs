//! Progress bars driven from inside long-running computations.

use tracing::trace;

use super::directive::Directive;
use crate::reactive::Runtime;

/// A progress bar shown while a computation runs.
///
/// Every update emits a [`Directive::ShowProgress`] carrying the full state.
/// The bar is removed on [`Progress::close`] or when the handle is dropped.
///
/// ```rust,ignore
/// let mut progress = session.progress();
/// progress.set_message("Computing random number");
/// for _ in 0..steps {
///     progress.inc(1.0 / steps as f64);
/// }
/// ```
pub struct Progress {
    runtime: Runtime,
    id: String,
    message: Option<String>,
    detail: Option<String>,
    value: Option<f64>,
    closed: bool,
}

impl Progress {
    pub(crate) fn open(runtime: Runtime, id: String) -> Self {
        let progress = Self {
            runtime,
            id,
            message: None,
            detail: None,
            value: None,
            closed: false,
        };
        progress.emit();
        progress
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.emit();
    }

    pub fn set_detail(&mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
        self.emit();
    }

    /// Set the fraction done, clamped to `0.0..=1.0`.
    pub fn set_value(&mut self, value: f64) {
        self.value = Some(value.clamp(0.0, 1.0));
        self.emit();
    }

    /// Advance by `amount`. An indeterminate bar starts from zero.
    pub fn inc(&mut self, amount: f64) {
        let value = self.value.unwrap_or(0.0) + amount;
        self.set_value(value);
    }

    /// Remove the bar.
    pub fn close(mut self) {
        self.remove();
    }

    fn emit(&self) {
        self.runtime.emit(Directive::ShowProgress {
            id: self.id.clone(),
            message: self.message.clone(),
            detail: self.detail.clone(),
            value: self.value,
        });
    }

    fn remove(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        trace!(id = %self.id, "progress closed");
        self.runtime.emit(Directive::RemoveProgress {
            id: self.id.clone(),
        });
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_carry_the_full_state() {
        let rt = Runtime::new();
        let mut progress = Progress::open(rt.clone(), "p".into());
        progress.set_message("Reading");
        progress.inc(0.25);
        progress.set_detail("row 10");
        progress.inc(2.0);
        assert_eq!(progress.value(), Some(1.0));
        progress.close();

        let show = |message: Option<&str>, detail: Option<&str>, value: Option<f64>| Directive::ShowProgress {
            id: "p".into(),
            message: message.map(Into::into),
            detail: detail.map(Into::into),
            value,
        };
        assert_eq!(
            rt.flush().directives,
            vec![
                show(None, None, None),
                show(Some("Reading"), None, None),
                show(Some("Reading"), None, Some(0.25)),
                show(Some("Reading"), Some("row 10"), Some(0.25)),
                show(Some("Reading"), Some("row 10"), Some(1.0)),
                Directive::RemoveProgress { id: "p".into() },
            ]
        );
    }

    #[test]
    fn dropping_removes_the_bar_once() {
        let rt = Runtime::new();
        {
            let _progress = Progress::open(rt.clone(), "p".into());
        }
        let directives = rt.flush().directives;
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[1], Directive::RemoveProgress { id: "p".into() });
    }
}
