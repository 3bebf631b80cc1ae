//! Shutdown engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use guardian_runtime::ConfigError;
use serde::{Deserialize, Serialize};

/// Timeouts, persistence and recovery settings for [`ShutdownEngine`].
///
/// All durations are in milliseconds so the config round-trips through
/// JSON unchanged.
///
/// [`ShutdownEngine`]: crate::ShutdownEngine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Budget for the whole graceful phase.
    pub graceful_timeout_ms: u64,
    /// Budget per component handler during the graceful phase.
    pub component_timeout_ms: u64,
    /// Budget for the whole force phase.
    pub force_timeout_ms: u64,
    /// Budget per component handler during the force phase.
    pub force_component_timeout_ms: u64,
    /// Write a snapshot when a graceful shutdown starts and finishes.
    pub save_state: bool,
    /// Directory holding `shutdown-snapshot.json`.
    pub state_dir: PathBuf,
    /// Exit the process once shutdown completes instead of recovering.
    pub exit_on_shutdown: bool,
    /// Process exit code used by termination paths.
    pub exit_code: i32,
    /// Delay before each recovery attempt.
    pub recovery_delay_ms: u64,
    /// Recovery attempts before giving up.
    pub max_recovery_attempts: u32,
}

impl ShutdownConfig {
    /// Creates a config with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graceful_timeout_ms: 30_000,
            component_timeout_ms: 5_000,
            force_timeout_ms: 10_000,
            force_component_timeout_ms: 2_000,
            save_state: true,
            state_dir: PathBuf::from("./guardian-state"),
            exit_on_shutdown: false,
            exit_code: 1,
            recovery_delay_ms: 5_000,
            max_recovery_attempts: 3,
        }
    }

    /// Sets the snapshot directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Enables or disables snapshots.
    #[must_use]
    pub fn with_save_state(mut self, save: bool) -> Self {
        self.save_state = save;
        self
    }

    /// Sets graceful-phase timeouts (overall, per component).
    #[must_use]
    pub fn with_graceful_timeouts(mut self, overall_ms: u64, per_component_ms: u64) -> Self {
        self.graceful_timeout_ms = overall_ms;
        self.component_timeout_ms = per_component_ms;
        self
    }

    /// Sets force-phase timeouts (overall, per component).
    #[must_use]
    pub fn with_force_timeouts(mut self, overall_ms: u64, per_component_ms: u64) -> Self {
        self.force_timeout_ms = overall_ms;
        self.force_component_timeout_ms = per_component_ms;
        self
    }

    /// Exit instead of recovering.
    #[must_use]
    pub fn with_exit_on_shutdown(mut self, exit: bool) -> Self {
        self.exit_on_shutdown = exit;
        self
    }

    /// Sets recovery delay and attempt cap.
    #[must_use]
    pub fn with_recovery(mut self, delay_ms: u64, max_attempts: u32) -> Self {
        self.recovery_delay_ms = delay_ms;
        self.max_recovery_attempts = max_attempts;
        self
    }

    pub(crate) fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub(crate) fn component_timeout(&self) -> Duration {
        Duration::from_millis(self.component_timeout_ms)
    }

    pub(crate) fn force_timeout(&self) -> Duration {
        Duration::from_millis(self.force_timeout_ms)
    }

    pub(crate) fn force_component_timeout(&self) -> Duration {
        Duration::from_millis(self.force_component_timeout_ms)
    }

    pub(crate) fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// Checks that timeouts nest sensibly.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graceful_timeout_ms == 0 {
            return Err(ConfigError::new("graceful_timeout_ms", "must be positive"));
        }
        if self.force_timeout_ms == 0 {
            return Err(ConfigError::new("force_timeout_ms", "must be positive"));
        }
        if self.component_timeout_ms > self.graceful_timeout_ms {
            return Err(ConfigError::new(
                "component_timeout_ms",
                "must not exceed graceful_timeout_ms",
            ));
        }
        if self.force_component_timeout_ms > self.force_timeout_ms {
            return Err(ConfigError::new(
                "force_component_timeout_ms",
                "must not exceed force_timeout_ms",
            ));
        }
        if self.save_state && self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::new("state_dir", "required when save_state is on"));
        }
        Ok(())
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ShutdownConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_recovery_attempts, 3);
        assert!(!config.exit_on_shutdown);
    }

    #[test]
    fn test_component_timeout_must_fit() {
        let config = ShutdownConfig::new().with_graceful_timeouts(1_000, 2_000);
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "component_timeout_ms");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ShutdownConfig =
            serde_json::from_str(r#"{"exit_on_shutdown": true, "exit_code": 3}"#).unwrap();
        assert!(config.exit_on_shutdown);
        assert_eq!(config.exit_code, 3);
        assert_eq!(config.graceful_timeout_ms, 30_000);
    }
}
