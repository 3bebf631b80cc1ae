//! Error types for stack monitoring.

use guardian_runtime::ConfigError;
use thiserror::Error;

/// Result type alias for stack operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Errors raised by the stack monitor and shadow stack.
///
/// # Security Notes
///
/// `RecursionBroken` is the signal instrumented code uses to unwind out of
/// runaway recursion. Callers should propagate it rather than retry.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The shadow stack was tripped by recursion recovery; the call must
    /// not proceed.
    #[error("recursion broken: refused to enter {function} at depth {depth}")]
    RecursionBroken {
        /// Function that tried to enter
        function: String,
        /// Shadow depth at the time
        depth: usize,
    },

    /// A tick failed.
    #[error(transparent)]
    Monitoring(#[from] MonitoringError),
}

/// A single monitor tick failed. Counted and reported, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stack monitoring failed during {stage}: {message}")]
pub struct MonitoringError {
    /// Tick stage that failed (`capture`, `analysis`, ...)
    pub stage: &'static str,
    /// What went wrong
    pub message: String,
}

impl MonitoringError {
    /// Creates a new monitoring error.
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursion_broken_display() {
        let err = StackError::RecursionBroken {
            function: "walk".into(),
            depth: 301,
        };
        assert_eq!(
            err.to_string(),
            "recursion broken: refused to enter walk at depth 301"
        );
    }

    #[test]
    fn test_monitoring_error_converts() {
        let err: StackError = MonitoringError::new("capture", "backtraces disabled").into();
        assert!(err.to_string().contains("capture"));
    }
}
