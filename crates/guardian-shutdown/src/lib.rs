//! # Guardian Shutdown
//!
//! Last line of defence for the resource guardian. When stack or memory
//! monitors decide the process cannot continue safely, the
//! [`ShutdownEngine`] stops every registered component in priority order,
//! releases tracked resources, records what happened in a JSON snapshot,
//! and, unless told to exit, schedules bounded automatic recovery.
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`ShutdownEngine`] | graceful → force → immediate state machine, recovery |
//! | [`ResourceTracker`] | tasks, intervals, child processes, closeables |
//! | [`SnapshotStore`] | `shutdown-snapshot.json` persistence |
//! | [`EmergencyState`] | current phase, completed/failed components |
//!
//! ## Security Notes
//!
//! - Only one shutdown sequence runs at a time per engine.
//! - Termination goes through an injectable [`Terminator`], so nothing in
//!   this crate calls `std::process::exit` directly except
//!   [`ProcessTerminator`].

mod config;
mod engine;
mod error;
mod handler;
mod resources;
mod snapshot;
mod state;

pub use config::ShutdownConfig;
pub use engine::{RecoveryOutcome, ShutdownEngine, ShutdownReport};
pub use error::{ComponentShutdownError, CriticalTerminationError, ShutdownError};
pub use handler::{
    ComponentRecovery, ProcessTerminator, RecoveryStrategy, ShutdownHandler, Terminator,
};
pub use resources::{Closeable, ReleaseReport, ResourceKind, ResourceTracker};
pub use snapshot::{ShutdownSnapshot, SnapshotStore, SNAPSHOT_FILE};
pub use state::{EmergencyState, ShutdownStats};

/// Result type alias for shutdown operations.
pub type Result<T> = std::result::Result<T, ShutdownError>;
