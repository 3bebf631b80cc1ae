//! Error types for memory management.

use guardian_runtime::{CleanupLevel, ConfigError};
use guardian_shutdown::ShutdownError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors raised by the sampler, cleanup manager and memory manager.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A cleanup was requested while another one was running.
    #[error("cleanup already in progress; {requested} request rejected")]
    CleanupInProgress {
        /// Level that was requested
        requested: CleanupLevel,
    },

    /// Escalation into the shutdown engine failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// One cleanup action failed. Recorded in the run's result; the remaining
/// actions still run.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{level} cleanup action '{action}' failed: {message}")]
pub struct StrategyExecutionError {
    /// Strategy the action belonged to
    pub level: CleanupLevel,
    /// Action name
    pub action: String,
    /// What went wrong
    pub message: String,
}

impl StrategyExecutionError {
    /// Creates a new strategy execution error.
    pub fn new(level: CleanupLevel, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            action: action.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_error_display() {
        let err = StrategyExecutionError::new(CleanupLevel::Moderate, "drain_queues", "poisoned");
        assert_eq!(
            err.to_string(),
            "moderate cleanup action 'drain_queues' failed: poisoned"
        );
    }

    #[test]
    fn test_in_progress_display() {
        let err = MemoryError::CleanupInProgress {
            requested: CleanupLevel::Gentle,
        };
        assert!(err.to_string().contains("gentle"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: MemoryError = ConfigError::new("warning_threshold", "out of range").into();
        assert!(matches!(err, MemoryError::Config(_)));
    }
}
