//! Error types shared across guardian crates.

use thiserror::Error;

/// Errors raised by the runtime plumbing itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A component lookup failed.
    #[error("component not registered: {0}")]
    ComponentNotFound(String),

    /// A capability was requested that the component never opted into.
    #[error("component '{name}' does not provide the {capability} capability")]
    MissingCapability {
        /// Component name
        name: String,
        /// Capability that was requested
        capability: &'static str,
    },

    /// A host service call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Failure reported by a host service (stop/start/shutdown handler).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The service reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The call did not finish within its allotted time.
    #[error("timed out after {0}ms")]
    Timeout(u64),
}

impl ServiceError {
    /// Convenience constructor for [`ServiceError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A configuration value violates one of the documented invariants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration for `{field}`: {reason}")]
pub struct ConfigError {
    /// Offending field
    pub field: &'static str,
    /// Why the value was rejected
    pub reason: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("warning_depth", "must be below critical_depth");
        assert!(err.to_string().contains("warning_depth"));
        assert!(err.to_string().contains("critical_depth"));
    }

    #[test]
    fn test_service_error_into_runtime() {
        let err: RuntimeError = ServiceError::Timeout(250).into();
        assert_eq!(err.to_string(), "timed out after 250ms");
    }
}
