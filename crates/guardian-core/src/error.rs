//! Error types for the guardian facade.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for guardian operations.
#[derive(Debug, Error)]
pub enum GuardianError {
    /// A configuration value violates an invariant.
    #[error(transparent)]
    Config(#[from] guardian_runtime::ConfigError),

    /// The config file could not be read.
    #[error("cannot read config {path}: {source}")]
    ConfigIo {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`crate::GuardianConfig`].
    #[error("cannot parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Stack monitor error passthrough.
    #[error("stack monitor error: {0}")]
    Stack(#[from] guardian_stack::StackError),

    /// Memory manager error passthrough.
    #[error("memory manager error: {0}")]
    Memory(#[from] guardian_memory::MemoryError),

    /// Shutdown engine error passthrough.
    #[error("shutdown engine error: {0}")]
    Shutdown(#[from] guardian_shutdown::ShutdownError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_runtime::ConfigError;

    #[test]
    fn test_config_error_is_transparent() {
        let err: GuardianError = ConfigError::new("event_capacity", "must be positive").into();
        assert_eq!(
            err.to_string(),
            "invalid configuration for `event_capacity`: must be positive"
        );
    }

    #[test]
    fn test_shutdown_error_wraps() {
        let err: GuardianError = guardian_shutdown::ShutdownError::AlreadyShuttingDown.into();
        assert_eq!(
            err.to_string(),
            "shutdown engine error: shutdown already in progress"
        );
    }
}
