//! # Guardian Stack
//!
//! Call-stack monitoring for long-lived processes: depth thresholds with
//! latched alerts, recursion detection, call-pattern analysis and bounded
//! recovery that escalates to the shutdown engine.
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`FrameParser`] | Textual stack capture → [`Frame`]s |
//! | [`PatternAnalyzer`] | Repetitions, repeating subsequences, hot call sequences |
//! | [`RecursionDetector`] | Direct, indirect, mutual, n-gram and deep-chain recursion |
//! | [`ShadowStack`] | Instrumented call tracking that can refuse entry |
//! | [`StackMonitor`] | Periodic state machine tying the above together |
//!
//! ## Threat Model
//!
//! - **Runaway recursion**: detected structurally, broken by tripping the
//!   shadow stack so instrumented code unwinds through `?`
//! - **Unbounded depth**: alerts at four latched levels, immediate
//!   termination at the last one
//! - **Stack growth driving heap growth**: correlated and recovered
//!
//! ## Example
//!
//! ```rust
//! use guardian_runtime::{EventBus, StackLevel};
//! use guardian_stack::{StackMonitor, StackMonitorConfig};
//!
//! let config = StackMonitorConfig::new().with_depths(10, 20, 30, 50);
//! let shadow = config.shadow_stack();
//! let monitor = StackMonitor::builder(config, EventBus::new(64))
//!     .shadow_stack(shadow.clone())
//!     .build()?;
//!
//! let guards: Vec<_> = (0..12)
//!     .map(|i| shadow.enter(format!("app::step{i}")))
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(monitor.tick()?.alert, Some(StackLevel::Warning));
//! drop(guards);
//! # Ok::<(), guardian_stack::StackError>(())
//! ```

mod cache;
mod error;
mod frame;
mod monitor;
mod pattern;
mod recursion;
mod shadow;
mod signature;
mod source;

pub use cache::{CacheStats, TtlCache};
pub use error::{MonitoringError, Result, StackError};
pub use frame::{Frame, FrameParser, StackSample};
pub use monitor::{
    MonitorStats, MonitorStatus, NoopHooks, StackMonitor, StackMonitorBuilder, StackMonitorConfig,
    StackRecoveryHooks, TickReport, REASON_CRITICAL_DEPTH, REASON_MEMORY_CORRELATION,
    REASON_RECURSION,
};
pub use pattern::{
    FunctionCorrelation, HotSequence, PatternAnalysis, PatternAnalyzer, PatternConfig,
    RepeatingPattern,
};
pub use recursion::{
    DetectorStats, RecursionConfig, RecursionDetector, RecursionEvidence, RecursionVerdict,
    RecursionWeights, SuspiciousPattern,
};
pub use shadow::{FrameGuard, ShadowStack, SHADOW_FILE};
pub use signature::{rolling_hash, StackSignature};
pub use source::{BacktraceSource, ManualSource, StackSource};
