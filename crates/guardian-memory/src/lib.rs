//! # Guardian Memory
//!
//! Memory pressure management for long-lived processes: periodic sampling
//! with cooldown-gated alerts, trend and leak analysis, escalating cleanup
//! over registered collections, and last-resort protection that stops
//! non-critical components before handing over to the shutdown engine.
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`MemorySampler`] | Samples, classifies, alerts, detects leaks and emergencies |
//! | [`CleanupManager`] | Gentle → moderate → aggressive → emergency strategies |
//! | [`ManagedCollection`] | What strategies shrink; [`TimedQueue`] adds expiry |
//! | [`MemoryManager`] | Sample → cleanup loop, emergency latch, shutdown protection |
//!
//! ## Pressure Levels
//!
//! | Level | Default heap fraction | Cleanup |
//! |-------|-----------------------|---------|
//! | warning | ≥ 0.70 | gentle |
//! | critical | ≥ 0.85 | moderate |
//! | emergency | ≥ 0.95 | aggressive |
//! | ceiling | ≥ 0.98 | shutdown protection |
//!
//! ## Security Notes
//!
//! - Cleanup runs never overlap; a second request is rejected, not queued
//! - A panicking collection fails its action only; the run continues
//! - Critical components are never stopped under memory pressure
//!
//! ## Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), guardian_memory::MemoryError> {
//! use std::collections::VecDeque;
//! use std::sync::{Arc, Mutex};
//! use guardian_memory::{CollectionKind, MemoryManager, MemoryManagerConfig};
//! use guardian_runtime::{EventBus, ManualProbe, RawMemoryStats};
//!
//! let probe = ManualProbe::new(RawMemoryStats {
//!     heap_used: 75,
//!     heap_limit: 100,
//!     ..RawMemoryStats::default()
//! });
//! let manager = MemoryManager::builder(MemoryManagerConfig::new(), Arc::new(probe), EventBus::new(64))
//!     .build()?;
//!
//! let history: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new((0..500).collect()));
//! manager
//!     .cleanup()
//!     .register_collection("request-history", CollectionKind::History, history.clone());
//!
//! manager.tick().await;
//! assert_eq!(history.lock().unwrap().len(), 100);
//! # Ok(())
//! # }
//! ```

mod cleanup;
mod collection;
mod error;
mod manager;
mod sampler;

pub use cleanup::{
    ActionOutcome, CleanupAction, CleanupConfig, CleanupManager, CleanupManagerBuilder,
    CleanupResult, CleanupStats,
};
pub use collection::{CollectionKind, ManagedCollection, TimedQueue};
pub use error::{MemoryError, Result, StrategyExecutionError};
pub use manager::{
    cleanup_level_for, ManagerStats, ManagerStatus, ManagerTick, MemoryManager,
    MemoryManagerBuilder, MemoryManagerConfig, ProtectionOutcome, REASON_MEMORY_CEILING,
};
pub use sampler::{
    LeakReport, MemorySampler, MemorySamplerBuilder, MemoryTrend, PressureSample, SampleOutcome,
    SamplerConfig, SamplerStats, TrendDirection, CONDITION_EXTERNAL, CONDITION_FRAGMENTATION,
    CONDITION_HEAP, CONDITION_RSS, CONDITION_SYSTEM, INDICATOR_CONSISTENT_GROWTH,
    INDICATOR_EXTERNAL, INDICATOR_GROWTH_RATE, INDICATOR_LOW_EFFICIENCY,
};
