//! # Guardian Runtime
//!
//! Shared plumbing used by every guardian component: the typed event bus,
//! the component registry and its capability traits, the clock and
//! periodic-task abstractions, and the memory probe / reclaimer pair.
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`EventBus`] | Broadcast channel of [`GuardianEvent`] values |
//! | [`ComponentRegistry`] | Host components and their opt-in capabilities |
//! | [`PeriodicTask`] | Cancellable fixed-interval task handle |
//! | [`Clock`] | Wall clock abstraction ([`SystemClock`], [`ManualClock`]) |
//! | [`MemoryProbe`] | Raw process/system memory statistics |
//! | [`Reclaimer`] | Forced-collection hooks and their history |
//!
//! ## Example
//!
//! ```rust
//! use guardian_runtime::{EventBus, GuardianEvent, StackLevel};
//!
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(GuardianEvent::StackAlert {
//!     level: StackLevel::Warning,
//!     depth: 120,
//!     threshold: 100,
//!     top_function: None,
//! });
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.name(), "stack:warning");
//! ```

mod clock;
mod component;
mod error;
mod event;
mod level;
mod probe;
mod reclaim;
mod scheduler;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use component::{
    Capabilities, ComponentRegistration, ComponentRegistry, Lifecycle, MemoryReporter,
    RegisteredComponent,
};
pub use error::{ConfigError, RuntimeError, ServiceError};
pub use event::{drain_events, EventBus, GuardianEvent};
pub use level::{CleanupLevel, PressureLevel, RecursionType, ShutdownPhase, StackLevel};
pub use probe::{ManualProbe, MemoryProbe, ProcessProbe, RawMemoryStats, TrackingAllocator};
pub use reclaim::{CollectionRecord, CollectionStats, Reclaimer};
pub use scheduler::PeriodicTask;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
