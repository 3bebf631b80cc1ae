//! Configuration types for the guardian.
//!
//! One JSON document configures every component. Missing fields take their
//! documented defaults, so `{}` is a valid config.
//!
//! ```json
//! {
//!   "debug_logging": true,
//!   "stack": { "warning_depth": 150 },
//!   "memory": { "absolute_ceiling": 0.97, "critical_components": ["db"] },
//!   "shutdown": { "state_dir": "/var/lib/app/guardian" }
//! }
//! ```

use std::path::Path;

use guardian_memory::MemoryManagerConfig;
use guardian_runtime::ConfigError;
use guardian_shutdown::ShutdownConfig;
use guardian_stack::StackMonitorConfig;
use serde::{Deserialize, Serialize};

use crate::error::GuardianError;
use crate::Result;

/// Configuration for the [`Guardian`](crate::Guardian) facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Event bus capacity; slow subscribers beyond it lag.
    pub event_capacity: usize,

    /// Heap budget in bytes. Total system memory when unset.
    pub heap_limit: Option<u64>,

    /// Run the stack monitor when the guardian starts.
    pub enable_stack_monitoring: bool,

    /// Run the memory manager when the guardian starts.
    pub enable_memory_management: bool,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    pub debug_logging: bool,

    /// Stack monitor configuration.
    pub stack: StackMonitorConfig,

    /// Memory manager configuration (sampler and cleanup nested inside).
    pub memory: MemoryManagerConfig,

    /// Shutdown engine configuration.
    pub shutdown: ShutdownConfig,
}

impl GuardianConfig {
    /// Creates a config with every component at its defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_capacity: 1024,
            heap_limit: None,
            enable_stack_monitoring: true,
            enable_memory_management: true,
            debug_logging: false,
            stack: StackMonitorConfig::new(),
            memory: MemoryManagerConfig::new(),
            shutdown: ShutdownConfig::new(),
        }
    }

    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// [`GuardianError::ConfigParse`] on malformed JSON,
    /// [`GuardianError::Config`] when a value violates an invariant.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// [`GuardianError::ConfigIo`] when the file cannot be read, otherwise
    /// as [`from_json`](Self::from_json).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| GuardianError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Only if serialization fails, which the derived impls do not.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every sub-config and the facade's own fields.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::new("event_capacity", "must be positive"));
        }
        if self.heap_limit == Some(0) {
            return Err(ConfigError::new("heap_limit", "must be positive when set"));
        }
        self.stack.validate()?;
        self.memory.validate()?;
        self.shutdown.validate()?;
        Ok(())
    }
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GuardianConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enable_stack_monitoring);
        assert_eq!(config.stack.warning_depth, 100);
        assert_eq!(config.memory.absolute_ceiling, 0.98);
        assert_eq!(config.shutdown.exit_code, 1);
    }

    #[test]
    fn test_empty_document_takes_defaults() {
        let config = GuardianConfig::from_json("{}").unwrap();
        assert_eq!(config, GuardianConfig::new());
    }

    #[test]
    fn test_partial_override() {
        let config = GuardianConfig::from_json(
            r#"{"debug_logging": true, "stack": {"warning_depth": 150}, "memory": {"sampler": {"warning_threshold": 0.6}}}"#,
        )
        .unwrap();
        assert!(config.debug_logging);
        assert_eq!(config.stack.warning_depth, 150);
        assert_eq!(config.stack.critical_depth, 200);
        assert_eq!(config.memory.sampler.warning_threshold, 0.6);
    }

    #[test]
    fn test_config_serialization() {
        let config = GuardianConfig::default();
        let json = config.to_json().unwrap();
        let parsed: GuardianConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = GuardianConfig::from_json(r#"{"event_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, GuardianError::Config(ref e) if e.field == "event_capacity"));
    }

    #[test]
    fn test_nested_invariant_rejected() {
        let err = GuardianConfig::from_json(
            r#"{"memory": {"sampler": {"warning_threshold": 0.9, "critical_threshold": 0.8}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, GuardianError::Config(_)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            GuardianConfig::from_json("{not json"),
            Err(GuardianError::ConfigParse(_))
        ));
    }
}
