//! Runtime Configuration
//!
//! Configuration is plain data with serde defaults, so a host can load it
//! from JSON (or build it in code and tweak single fields).

use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};

/// Tuning knobs for a single reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of flush cycles drained by one flush.
    ///
    /// Observers that keep invalidating themselves would otherwise spin
    /// forever. Work left over stays pending for the next flush.
    pub max_flush_cycles: usize,

    /// Flush immediately when a cell changes outside of any batch.
    ///
    /// Reports still accumulate until the host calls `Runtime::flush`, as
    /// do the futures of async observers until a session awaits them.
    pub auto_flush: bool,

    /// Convert observer panics into reported failures instead of unwinding
    /// through the flush.
    pub catch_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_cycles: 100,
            auto_flush: true,
            catch_panics: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ReactiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_flush_cycles == 0 {
            return Err(ReactiveError::Config(
                "max_flush_cycles must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a session.
///
/// Sessions flush explicitly after each external event, so `auto_flush` on
/// the wrapped runtime config is always turned off.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub runtime: RuntimeConfig,
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ReactiveError::Config(e.to_string()))?;
        config.runtime.validate()?;
        Ok(config)
    }

    pub(crate) fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            auto_flush: false,
            ..self.runtime.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "max_flush_cycles": 8 }"#).unwrap();
        assert_eq!(config.max_flush_cycles, 8);
        assert!(config.auto_flush);
        assert!(config.catch_panics);
    }

    #[test]
    fn zero_cycles_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "max_flush_cycles": 0 }"#).unwrap_err();
        assert!(matches!(err, ReactiveError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = RuntimeConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, ReactiveError::Config(_)));
    }

    #[test]
    fn session_config_disables_auto_flush() {
        let config = SessionConfig::from_json(r#"{ "runtime": { "auto_flush": true } }"#).unwrap();
        assert!(config.runtime.auto_flush);
        assert!(!config.runtime_config().auto_flush);
    }
}
