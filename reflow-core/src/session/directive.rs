//! Side-channel directives.
//!
//! Directives are fire-and-forget instructions for the client that are not
//! output values: notifications, modal dialogs, progress bars, input
//! updates. They are queued on the runtime and delivered with the flush that
//! emitted them, in emission order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One instruction for the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    /// Show a notification, or replace the one with the same id.
    ShowNotification {
        id: String,
        message: String,
        level: NotificationLevel,
        /// `None` keeps it open until removed.
        duration_ms: Option<u64>,
        close_button: bool,
    },
    RemoveNotification {
        id: String,
    },
    ShowModal {
        modal: Modal,
    },
    RemoveModal,
    /// Show a progress bar, or update the one with the same id.
    ShowProgress {
        id: String,
        message: Option<String>,
        detail: Option<String>,
        /// Fraction done in `0.0..=1.0`. `None` while indeterminate.
        value: Option<f64>,
    },
    RemoveProgress {
        id: String,
    },
    /// Patch the client-side state of an input (value, choices, bounds).
    UpdateInput {
        name: String,
        patch: Value,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Default,
    Message,
    Warning,
    Error,
}

/// A notification to show.
///
/// ```rust,ignore
/// session.show_notification(Notification::new("Reading data...").persistent());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub(crate) id: Option<String>,
    pub(crate) message: String,
    pub(crate) level: NotificationLevel,
    pub(crate) duration: Option<Duration>,
    pub(crate) close_button: bool,
}

impl Notification {
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(5);

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: None,
            message: message.into(),
            level: NotificationLevel::Default,
            duration: Some(Self::DEFAULT_DURATION),
            close_button: true,
        }
    }

    /// Reuse `id` so the notification replaces an earlier one in place.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Stay open until removed.
    pub fn persistent(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn close_button(mut self, close_button: bool) -> Self {
        self.close_button = close_button;
        self
    }

    pub(crate) fn into_directive(self, id: String) -> Directive {
        Directive::ShowNotification {
            id,
            message: self.message,
            level: self.level,
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
            close_button: self.close_button,
        }
    }
}

/// A modal dialog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modal {
    pub title: Option<String>,
    pub body: String,
    /// Footer markup. `None` renders the client's default dismiss button.
    pub footer: Option<String>,
    /// Close when clicking outside the dialog or pressing escape.
    pub easy_close: bool,
}

impl Modal {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn easy_close(mut self, easy_close: bool) -> Self {
        self.easy_close = easy_close;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_defaults() {
        let directive = Notification::new("So long").into_directive("n-1".into());
        assert_eq!(
            directive,
            Directive::ShowNotification {
                id: "n-1".into(),
                message: "So long".into(),
                level: NotificationLevel::Default,
                duration_ms: Some(5000),
                close_button: true,
            }
        );
    }

    #[test]
    fn directives_serialize_with_kind_tag() {
        let directive = Notification::new("Adieu")
            .level(NotificationLevel::Error)
            .persistent()
            .close_button(false)
            .into_directive("n-2".into());

        assert_eq!(
            serde_json::to_value(&directive).unwrap(),
            json!({
                "kind": "show_notification",
                "id": "n-2",
                "message": "Adieu",
                "level": "error",
                "duration_ms": null,
                "close_button": false,
            })
        );
        assert_eq!(
            serde_json::to_value(Directive::RemoveModal).unwrap(),
            json!({"kind": "remove_modal"})
        );
    }

    #[test]
    fn modal_builder() {
        let modal = Modal::new("Are you sure you want to continue?")
            .title("Delete files")
            .easy_close(true);
        assert_eq!(modal.title.as_deref(), Some("Delete files"));
        assert!(modal.footer.is_none());
        assert!(modal.easy_close);
    }
}
