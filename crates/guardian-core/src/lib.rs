//! # Guardian Core
//!
//! Unified facade for the resource guardian. Wires the stack monitor, the
//! memory manager and the shutdown engine onto one event bus, one component
//! registry and one clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        GUARDIAN CORE                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │                    ┌─────────────────┐                          │
//! │                    │    Guardian     │  ← Unified Facade        │
//! │                    └────────┬────────┘                          │
//! │                             │                                   │
//! │         ┌───────────────────┼───────────────────┐               │
//! │         ▼                   ▼                   ▼               │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐          │
//! │  │    Stack    │    │   Memory    │    │  Shutdown   │          │
//! │  │   Monitor   │───►│   Manager   │───►│   Engine    │          │
//! │  └─────────────┘    └─────────────┘    └─────────────┘          │
//! │         │                   │                   │               │
//! │         └──────────── EventBus / Registry ──────┘               │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use guardian_core::{init_logging, Guardian, GuardianConfig};
//!
//! let config = GuardianConfig::from_file("guardian.json")?;
//! init_logging(config.debug_logging);
//!
//! let guardian = Guardian::new(config)?;
//! guardian.register_component(
//!     ComponentRegistration::new("worker-pool")
//!         .with_priority(10)
//!         .with_lifecycle(pool.clone()),
//! );
//! guardian.start();
//!
//! let mut events = guardian.subscribe();
//! while let Ok(event) = events.recv().await {
//!     tracing::info!(event = event.name(), "guardian event");
//! }
//! ```
//!
//! ## Security Notes
//!
//! - Both monitors escalate into the same shutdown engine, so at most one
//!   shutdown sequence runs per guardian
//! - Components with a lifecycle are stopped by shutdown in priority order
//!   and restarted by recovery
//! - Configs are validated before any component is built

mod config;
mod error;
mod guardian;
mod logging;

pub use config::GuardianConfig;
pub use error::GuardianError;
pub use guardian::{CheckReport, Guardian, GuardianBuilder, GuardianStatus};
pub use logging::{default_directive, init_logging};

// Re-export component crates for convenience
pub use guardian_memory as memory;
pub use guardian_runtime as runtime;
pub use guardian_shutdown as shutdown;
pub use guardian_stack as stack;

/// Core result type for guardian operations.
pub type Result<T> = std::result::Result<T, GuardianError>;
