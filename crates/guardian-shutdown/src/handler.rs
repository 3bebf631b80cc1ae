//! Host-supplied callbacks: shutdown handlers, recovery strategies,
//! per-component recovery and process termination.
//!
//! Every async callback trait has a blanket impl for closures returning a
//! future, so simple hosts can register `|| async { Ok(()) }` directly.

use std::future::Future;

use async_trait::async_trait;
use guardian_runtime::ServiceError;
use tracing::error;

use crate::snapshot::ShutdownSnapshot;

/// Stops one component during shutdown.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Stops the component. Called at most once per phase.
    async fn shutdown(&self) -> Result<(), ServiceError>;
}

#[async_trait]
impl<F, Fut> ShutdownHandler for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    async fn shutdown(&self) -> Result<(), ServiceError> {
        self().await
    }
}

/// Idempotent repair step run during recovery.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Repairs whatever this strategy owns. `snapshot` is the last saved
    /// snapshot, if any could be read.
    async fn recover(&self, snapshot: Option<&ShutdownSnapshot>) -> Result<(), ServiceError>;
}

#[async_trait]
impl<F, Fut> RecoveryStrategy for F
where
    F: Fn(Option<ShutdownSnapshot>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    async fn recover(&self, snapshot: Option<&ShutdownSnapshot>) -> Result<(), ServiceError> {
        self(snapshot.cloned()).await
    }
}

/// Brings back a component that failed to stop cleanly.
#[async_trait]
pub trait ComponentRecovery: Send + Sync {
    /// Restores the component.
    async fn recover_component(&self) -> Result<(), ServiceError>;
}

#[async_trait]
impl<F, Fut> ComponentRecovery for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    async fn recover_component(&self) -> Result<(), ServiceError> {
        self().await
    }
}

/// Ends the process. Injected so tests can observe termination.
pub trait Terminator: Send + Sync {
    /// Terminates with `code`. The real implementation never returns.
    fn terminate(&self, code: i32);
}

/// Terminator calling [`std::process::exit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) {
        error!(code, "terminating process");
        std::process::exit(code);
    }
}
