//! Wire format.
//!
//! Messages in both directions are MessagePack maps (field names included),
//! so clients can decode them without a schema.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::directive::Directive;
use crate::error::{ReactiveError, Result};

/// A message from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One input changed. `force` invalidates even when the value is
    /// unchanged (button clicks).
    Input {
        name: String,
        value: Value,
        #[serde(default)]
        force: bool,
    },
    /// Several inputs changed in one event.
    Inputs { values: IndexMap<String, Value> },
    /// Deliver whatever is pending without changing anything.
    Flush,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| ReactiveError::Wire(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| ReactiveError::Wire(e.to_string()))
    }
}

/// A hard observer failure, as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub node: String,
    pub message: String,
}

/// Everything one flush produced for the client.
///
/// Only outputs that were invalidated appear. An output that cannot produce
/// a value yet is listed in `cleared`; one that failed is listed in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputFrame {
    pub values: IndexMap<String, Value>,
    pub cleared: Vec<String>,
    pub errors: IndexMap<String, String>,
    pub directives: Vec<Directive>,
    pub failures: Vec<FailureReport>,
}

impl OutputFrame {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.cleared.is_empty()
            && self.errors.is_empty()
            && self.directives.is_empty()
            && self.failures.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| ReactiveError::Wire(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| ReactiveError::Wire(e.to_string()))
    }

    /// Record the latest state of output `name`, replacing anything an
    /// earlier round of the same flush recorded.
    pub(crate) fn record(&mut self, name: String, result: Result<Value>) {
        self.cleared.retain(|cleared| *cleared != name);
        self.values.shift_remove(&name);
        self.errors.shift_remove(&name);

        match result {
            Ok(value) => {
                self.values.insert(name, value);
            }
            Err(err) if err.is_silent() => self.cleared.push(name),
            Err(err) => {
                self.errors.insert(name, err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_message_decodes_with_default_force() {
        #[derive(Serialize)]
        struct Raw<'a> {
            r#type: &'a str,
            name: &'a str,
            value: Value,
        }

        let bytes = rmp_serde::to_vec_named(&Raw {
            r#type: "input",
            name: "n",
            value: json!(3),
        })
        .unwrap();

        assert_eq!(
            ClientMessage::decode(&bytes).unwrap(),
            ClientMessage::Input {
                name: "n".into(),
                value: json!(3),
                force: false
            }
        );
    }

    #[test]
    fn garbage_is_a_wire_error() {
        let err = ClientMessage::decode(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, ReactiveError::Wire(_)));
    }

    #[test]
    fn frame_records_latest_state() {
        let mut frame = OutputFrame::default();
        frame.record("greeting".into(), Err(ReactiveError::Cancelled));
        assert_eq!(frame.cleared, vec!["greeting".to_string()]);

        frame.record("greeting".into(), Ok(json!("Hello Maori!")));
        assert!(frame.cleared.is_empty());
        assert_eq!(frame.values["greeting"], json!("Hello Maori!"));

        frame.record("total".into(), Err(ReactiveError::failed("boom").within("total")));
        assert_eq!(frame.errors["total"], "evaluation of total failed: boom");
        assert!(!frame.is_empty());
    }

    #[test]
    fn frame_survives_the_wire() {
        let mut frame = OutputFrame::default();
        frame.record("n".into(), Ok(json!({"mean": 1.5, "rows": [1, 2]})));
        frame.directives.push(Directive::RemoveModal);

        let decoded = OutputFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
