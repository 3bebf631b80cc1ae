//! Error types for the shutdown engine.

use guardian_runtime::{ConfigError, ServiceError};
use thiserror::Error;

/// Errors that can occur while shutting down or recovering.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// A shutdown sequence is already running; this call did nothing.
    #[error("shutdown already in progress")]
    AlreadyShuttingDown,

    /// Both graceful and force phases failed; the process was terminated.
    #[error(transparent)]
    CriticalTermination(#[from] CriticalTerminationError),

    /// Configuration rejected at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Snapshot file could not be read or written.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file is not valid JSON for the expected shape.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A single component failed to stop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("component '{component}' failed to shut down: {source}")]
pub struct ComponentShutdownError {
    /// Component name
    pub component: String,
    /// Underlying failure (including timeouts)
    #[source]
    pub source: ServiceError,
}

impl ComponentShutdownError {
    /// Creates a new component failure record.
    pub fn new(component: impl Into<String>, source: ServiceError) -> Self {
        Self {
            component: component.into(),
            source,
        }
    }
}

/// Graceful and force shutdown both failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("critical termination ({reason}): {detail}")]
pub struct CriticalTerminationError {
    /// Reason the shutdown was initiated
    pub reason: String,
    /// What went wrong in the force phase
    pub detail: String,
}
