//! # Stack Monitor
//!
//! Periodic call-stack depth monitoring with pattern analysis, recursion
//! detection, memory correlation and bounded recovery.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    StackMonitor                      │
//! │  StackSource ─► FrameParser ─► thresholds (latched)  │
//! │                     │                                │
//! │         ┌───────────┴────────────┐                   │
//! │  PatternAnalyzer        RecursionDetector            │
//! │         └───────────┬────────────┘                   │
//! │            recovery (reason-keyed, capped)           │
//! │                     │                                │
//! │             ShutdownEngine (escalation)              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Tick Order
//!
//! 1. Capture and parse a sample (the monitor's own frames are dropped).
//! 2. Walk thresholds from shutdown down to warning; fire at most the
//!    highest one not already latched. Firing latches it and every lower level.
//! 3. Depth below warning clears every latch. Leaving emergency emits one
//!    `stack:recovered`.
//! 4. Pattern analysis and recursion detection on the same frames.
//! 5. Every `memory_check_every` ticks, correlate heap growth with depth growth.
//!
//! ## Thresholds
//!
//! | Level | Default depth | Action |
//! |-------|---------------|--------|
//! | Warning | 100 | alert |
//! | Critical | 200 | alert |
//! | Emergency | 300 | alert + `critical_depth` recovery |
//! | Shutdown | 500 | alert + immediate termination |
//!
//! ## Security Notes
//!
//! - Recovery attempts are capped per reason; exhaustion escalates to a
//!   coordinated shutdown exactly once
//! - Tick failures and panics are contained and counted
//! - Capture and analysis are synchronous; no lock is held across `.await`
//!
//! ## Example
//!
//! ```rust
//! use guardian_runtime::{EventBus, ManualClock};
//! use guardian_stack::{ManualSource, StackMonitor, StackMonitorConfig};
//!
//! let source = ManualSource::new();
//! let monitor = StackMonitor::builder(StackMonitorConfig::new(), EventBus::new(64))
//!     .source(source.clone())
//!     .clock(ManualClock::new(0).shared())
//!     .build()?;
//!
//! source.set_depth(150, "app::walk");
//! let report = monitor.tick()?;
//! assert_eq!(report.alert, Some(guardian_runtime::StackLevel::Warning));
//! # Ok::<(), guardian_stack::StackError>(())
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use guardian_runtime::{
    ConfigError, EventBus, GuardianEvent, MemoryProbe, PeriodicTask, Reclaimer, ServiceError,
    SharedClock, StackLevel, SystemClock,
};
use guardian_shutdown::ShutdownEngine;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::CacheStats;
use crate::error::{MonitoringError, Result};
use crate::frame::{Frame, FrameParser};
use crate::pattern::{PatternAnalyzer, PatternConfig};
use crate::recursion::{DetectorStats, RecursionConfig, RecursionDetector, RecursionVerdict};
use crate::shadow::ShadowStack;
use crate::source::{BacktraceSource, StackSource};

/// Recovery reason for emergency depth.
pub const REASON_CRITICAL_DEPTH: &str = "critical_depth";
/// Recovery reason for recursion found at critical depth or deeper.
pub const REASON_RECURSION: &str = "recursion";
/// Recovery reason for correlated heap and depth growth.
pub const REASON_MEMORY_CORRELATION: &str = "memory_correlation";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Configuration for [`StackMonitor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackMonitorConfig {
    /// Tick period.
    pub check_interval_ms: u64,
    /// Warning depth.
    pub warning_depth: usize,
    /// Critical depth.
    pub critical_depth: usize,
    /// Emergency depth; triggers recovery.
    pub emergency_depth: usize,
    /// Shutdown depth; triggers immediate termination.
    pub shutdown_depth: usize,
    /// Caller→callee frequency above which a sequence is excessive.
    pub pattern_frequency_threshold: u64,
    /// Run memory correlation every this many ticks (0 disables).
    pub memory_check_every: u64,
    /// Heap growth between correlation checks that counts as growth.
    pub heap_growth_threshold: u64,
    /// Depth growth between correlation checks that counts as growth.
    pub depth_growth_threshold: usize,
    /// Recovery attempts per reason before escalating.
    pub max_recovery_attempts: u32,
    /// Ticks slower than this emit a performance warning.
    pub tick_budget_ms: u64,
    /// Purge detector and analyzer caches every this many ticks (0 disables).
    pub cleanup_every: u64,
    /// Run the pattern analyzer each tick.
    pub enable_pattern_analysis: bool,
    /// Run the recursion detector each tick.
    pub enable_recursion_detection: bool,
    /// Run memory correlation.
    pub enable_memory_correlation: bool,
    /// Pattern analyzer settings.
    pub pattern: PatternConfig,
    /// Recursion detector settings.
    pub recursion: RecursionConfig,
}

impl StackMonitorConfig {
    /// Creates a new config with default values.
    ///
    /// Defaults:
    /// - Interval: 1s
    /// - Depths: 100 / 200 / 300 / 500
    /// - Pattern frequency threshold: 50
    /// - Memory correlation every 10 ticks, 50 MiB heap and 50 frames growth
    /// - 3 recovery attempts per reason
    /// - Tick budget: 50ms
    #[must_use]
    pub const fn new() -> Self {
        Self {
            check_interval_ms: 1_000,
            warning_depth: 100,
            critical_depth: 200,
            emergency_depth: 300,
            shutdown_depth: 500,
            pattern_frequency_threshold: 50,
            memory_check_every: 10,
            heap_growth_threshold: 50 * 1024 * 1024,
            depth_growth_threshold: 50,
            max_recovery_attempts: 3,
            tick_budget_ms: 50,
            cleanup_every: 60,
            enable_pattern_analysis: true,
            enable_recursion_detection: true,
            enable_memory_correlation: true,
            pattern: PatternConfig::new(),
            recursion: RecursionConfig::new(),
        }
    }

    /// Sets the four depth thresholds.
    #[must_use]
    pub fn with_depths(mut self, warning: usize, critical: usize, emergency: usize, shutdown: usize) -> Self {
        self.warning_depth = warning;
        self.critical_depth = critical;
        self.emergency_depth = emergency;
        self.shutdown_depth = shutdown;
        self
    }

    /// Sets the tick period.
    #[must_use]
    pub fn with_check_interval(mut self, interval_ms: u64) -> Self {
        self.check_interval_ms = interval_ms;
        self
    }

    /// Sets the excessive-pattern frequency threshold.
    #[must_use]
    pub fn with_pattern_frequency_threshold(mut self, threshold: u64) -> Self {
        self.pattern_frequency_threshold = threshold;
        self
    }

    /// Sets the memory correlation cadence and growth thresholds.
    #[must_use]
    pub fn with_memory_correlation(mut self, every: u64, heap_growth: u64, depth_growth: usize) -> Self {
        self.memory_check_every = every;
        self.heap_growth_threshold = heap_growth;
        self.depth_growth_threshold = depth_growth;
        self
    }

    /// Sets the recovery cap per reason.
    #[must_use]
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Sets the tick budget.
    #[must_use]
    pub fn with_tick_budget(mut self, budget_ms: u64) -> Self {
        self.tick_budget_ms = budget_ms;
        self
    }

    /// Sets the pattern analyzer config.
    #[must_use]
    pub fn with_pattern(mut self, pattern: PatternConfig) -> Self {
        self.pattern = pattern;
        self
    }

    /// Sets the recursion detector config.
    #[must_use]
    pub fn with_recursion(mut self, recursion: RecursionConfig) -> Self {
        self.recursion = recursion;
        self
    }

    /// Threshold for `level`.
    #[must_use]
    pub const fn threshold(&self, level: StackLevel) -> usize {
        match level {
            StackLevel::Warning => self.warning_depth,
            StackLevel::Critical => self.critical_depth,
            StackLevel::Emergency => self.emergency_depth,
            StackLevel::Shutdown => self.shutdown_depth,
        }
    }

    /// Tick period as a [`Duration`].
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// A shadow stack whose trip clears below the warning depth.
    #[must_use]
    pub fn shadow_stack(&self) -> ShadowStack {
        ShadowStack::new(self.warning_depth)
    }

    /// Checks the ordering invariants.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.warning_depth == 0 {
            return Err(ConfigError::new("warning_depth", "must be positive"));
        }
        if self.critical_depth <= self.warning_depth {
            return Err(ConfigError::new("critical_depth", "must exceed warning_depth"));
        }
        if self.emergency_depth <= self.critical_depth {
            return Err(ConfigError::new("emergency_depth", "must exceed critical_depth"));
        }
        if self.shutdown_depth <= self.emergency_depth {
            return Err(ConfigError::new("shutdown_depth", "must exceed emergency_depth"));
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::new("check_interval_ms", "must be positive"));
        }
        if self.pattern.min_pattern_length < 2
            || self.pattern.max_pattern_length < self.pattern.min_pattern_length
        {
            return Err(ConfigError::new(
                "pattern.max_pattern_length",
                "pattern lengths must satisfy 2 <= min <= max",
            ));
        }
        Ok(())
    }
}

impl Default for StackMonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Host callbacks used by recovery. Every method defaults to a no-op.
pub trait StackRecoveryHooks: Send + Sync {
    /// Cancel timers that would re-enter deep call paths.
    fn clear_pending_timers(&self) -> std::result::Result<(), ServiceError> {
        Ok(())
    }

    /// Drop queued work that would deepen the stack further.
    fn drain_backlog(&self) -> std::result::Result<(), ServiceError> {
        Ok(())
    }

    /// Clear host caches.
    fn clear_caches(&self) -> std::result::Result<(), ServiceError> {
        Ok(())
    }

    /// Generic reset for reasons without a dedicated routine.
    fn reset(&self) -> std::result::Result<(), ServiceError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl StackRecoveryHooks for NoopHooks {}

/// Counters since the monitor was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Successful ticks.
    pub ticks: u64,
    /// Failed ticks.
    pub errors: u64,
    /// Alerts fired per level.
    pub alerts: BTreeMap<StackLevel, u64>,
    /// `stack:recovered` events.
    pub recoveries_from_emergency: u64,
    /// Recursion detections reported.
    pub recursions_detected: u64,
    /// Excessive patterns reported.
    pub excessive_patterns: u64,
    /// Memory correlations reported.
    pub memory_correlations: u64,
    /// Recovery attempts started.
    pub recovery_attempts: u64,
    /// Recovery attempts that succeeded.
    pub recovery_successes: u64,
    /// Escalations to the shutdown engine.
    pub escalations: u64,
    /// Ticks over budget.
    pub slow_ticks: u64,
    /// Deepest sample seen.
    pub max_depth: usize,
    /// Most recent depth.
    pub last_depth: usize,
    /// Mean tick duration.
    pub avg_tick_ms: f64,
}

/// What one tick observed and did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Sample depth.
    pub depth: usize,
    /// Innermost function.
    pub top_function: Option<String>,
    /// Alert fired this tick.
    pub alert: Option<StackLevel>,
    /// Depth dropped below warning and latches were cleared.
    pub cleared: bool,
    /// Left emergency this tick.
    pub recovered: bool,
    /// Recursion verdict, when detection ran.
    pub recursion: Option<RecursionVerdict>,
    /// Newly reported excessive sequences.
    pub excessive_patterns: Vec<String>,
    /// Memory correlation fired.
    pub memory_correlated: bool,
    /// Recovery runs: `(reason, succeeded)`.
    pub recoveries: Vec<(String, bool)>,
    /// Immediate termination requested.
    pub terminated: bool,
}

/// Point-in-time monitor status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Periodic task running.
    pub enabled: bool,
    /// Highest level the latest sample exceeded.
    pub active_alert: Option<StackLevel>,
    /// Emergency latch.
    pub in_emergency: bool,
    /// Recovery attempts per reason.
    pub recovery_attempts: BTreeMap<String, u32>,
    /// Counters.
    pub stats: MonitorStats,
    /// Detector counters.
    pub detector: DetectorStats,
    /// Pattern cache counters.
    pub pattern_cache: CacheStats,
}

#[derive(Debug)]
enum Action {
    Terminate(String),
    Recover(&'static str),
}

struct MonitorState {
    analyzer: PatternAnalyzer,
    detector: RecursionDetector,
    latched: Vec<StackLevel>,
    current: Option<StackLevel>,
    in_emergency: bool,
    reported_patterns: HashSet<String>,
    recovery_attempts: HashMap<String, u32>,
    exhausted: HashSet<String>,
    last_memory: Option<(u64, usize)>,
    stats: MonitorStats,
}

impl MonitorState {
    fn active(&self) -> Option<StackLevel> {
        self.current
    }
}

struct Inner {
    config: StackMonitorConfig,
    events: EventBus,
    clock: SharedClock,
    parser: FrameParser,
    source: Arc<dyn StackSource>,
    shadow: Option<ShadowStack>,
    engine: Option<ShutdownEngine>,
    reclaimer: Option<Reclaimer>,
    probe: Option<Arc<dyn MemoryProbe>>,
    hooks: Arc<dyn StackRecoveryHooks>,
    state: Mutex<MonitorState>,
    task: Mutex<Option<PeriodicTask>>,
    enabled: AtomicBool,
}

/// Builder for [`StackMonitor`].
pub struct StackMonitorBuilder {
    config: StackMonitorConfig,
    events: EventBus,
    clock: Option<SharedClock>,
    source: Option<Arc<dyn StackSource>>,
    shadow: Option<ShadowStack>,
    engine: Option<ShutdownEngine>,
    reclaimer: Option<Reclaimer>,
    probe: Option<Arc<dyn MemoryProbe>>,
    hooks: Option<Arc<dyn StackRecoveryHooks>>,
}

impl StackMonitorBuilder {
    /// Captures from `source`. Defaults to the shadow stack when one is set,
    /// otherwise the native backtrace.
    #[must_use]
    pub fn source(mut self, source: impl StackSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Shadow stack tripped by recursion recovery.
    #[must_use]
    pub fn shadow_stack(mut self, shadow: ShadowStack) -> Self {
        self.shadow = Some(shadow);
        self
    }

    /// Engine used for immediate termination and escalation.
    #[must_use]
    pub fn shutdown_engine(mut self, engine: ShutdownEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Reclaimer used for forced collection during recovery.
    #[must_use]
    pub fn reclaimer(mut self, reclaimer: Reclaimer) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// Probe read by memory correlation.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Host recovery callbacks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn StackRecoveryHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Clock for timestamps and cache ages.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the config and builds the monitor.
    ///
    /// # Errors
    ///
    /// [`crate::StackError::Config`] when the config is invalid.
    pub fn build(self) -> Result<StackMonitor> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let source: Arc<dyn StackSource> = match (self.source, &self.shadow) {
            (Some(source), _) => source,
            (None, Some(shadow)) => Arc::new(shadow.clone()),
            (None, None) => Arc::new(BacktraceSource),
        };
        let parser = FrameParser::new().with_library_prefixes(self.config.pattern.library_prefixes.clone());
        let state = MonitorState {
            analyzer: PatternAnalyzer::new(self.config.pattern.clone(), Arc::clone(&clock)),
            detector: RecursionDetector::new(self.config.recursion.clone(), Arc::clone(&clock))
                .with_parser(parser.clone()),
            latched: Vec::with_capacity(StackLevel::DESCENDING.len()),
            current: None,
            in_emergency: false,
            reported_patterns: HashSet::new(),
            recovery_attempts: HashMap::new(),
            exhausted: HashSet::new(),
            last_memory: None,
            stats: MonitorStats::default(),
        };

        Ok(StackMonitor {
            inner: Arc::new(Inner {
                config: self.config,
                events: self.events,
                clock,
                parser,
                source,
                shadow: self.shadow,
                engine: self.engine,
                reclaimer: self.reclaimer,
                probe: self.probe,
                hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
                state: Mutex::new(state),
                task: Mutex::new(None),
                enabled: AtomicBool::new(false),
            }),
        })
    }
}

/// Call-stack monitor. Clones share state.
#[derive(Clone)]
pub struct StackMonitor {
    inner: Arc<Inner>,
}

impl StackMonitor {
    /// Starts building a monitor.
    #[must_use]
    pub fn builder(config: StackMonitorConfig, events: EventBus) -> StackMonitorBuilder {
        StackMonitorBuilder {
            config,
            events,
            clock: None,
            source: None,
            shadow: None,
            engine: None,
            reclaimer: None,
            probe: None,
            hooks: None,
        }
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StackMonitorConfig {
        &self.inner.config
    }

    /// Shadow stack, when configured.
    #[inline]
    #[must_use]
    pub fn shadow_stack(&self) -> Option<&ShadowStack> {
        self.inner.shadow.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        lock(&self.inner.state)
    }

    /// Starts ticking every `check_interval_ms`. Returns false if already
    /// running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) -> bool {
        if self.inner.enabled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn("stack-monitor", self.inner.config.check_interval(), move || {
            if let Some(inner) = weak.upgrade() {
                // Failures are reported as events inside tick().
                let _ = StackMonitor { inner }.tick();
            }
        });
        *lock(&self.inner.task) = Some(task);
        info!(
            interval_ms = self.inner.config.check_interval_ms,
            warning = self.inner.config.warning_depth,
            shutdown = self.inner.config.shutdown_depth,
            "stack monitor started"
        );
        true
    }

    /// Cancels the periodic task. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        if !self.inner.enabled.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(task) = lock(&self.inner.task).take() {
            task.cancel();
        }
        info!("stack monitor stopped");
        true
    }

    /// Returns true while the periodic task runs.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Runs one monitoring pass.
    ///
    /// # Errors
    ///
    /// [`MonitoringError`] when capture fails or the pass panics. The error
    /// is also counted and emitted as `stack:monitoring-error`.
    pub fn tick(&self) -> std::result::Result<TickReport, MonitoringError> {
        let started = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(|| self.tick_inner())) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tick panicked".to_string());
                Err(MonitoringError::new("tick", message))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut state = self.state();
            let stats = &mut state.stats;
            if result.is_err() {
                stats.errors += 1;
            }
            let n = (stats.ticks + stats.errors).max(1) as f64;
            stats.avg_tick_ms += (elapsed_ms as f64 - stats.avg_tick_ms) / n;
            if elapsed_ms > self.inner.config.tick_budget_ms {
                stats.slow_ticks += 1;
            }
        }

        if let Err(err) = &result {
            warn!(stage = err.stage, error = %err.message, "stack monitoring tick failed");
            self.inner.events.emit(GuardianEvent::MonitoringError {
                source: "stack".to_string(),
                message: err.to_string(),
            });
        }
        if elapsed_ms > self.inner.config.tick_budget_ms {
            warn!(tick_ms = elapsed_ms, budget_ms = self.inner.config.tick_budget_ms, "stack monitor tick over budget");
            self.inner.events.emit(GuardianEvent::PerformanceWarning {
                tick_ms: elapsed_ms,
                budget_ms: self.inner.config.tick_budget_ms,
            });
        }
        result
    }

    fn tick_inner(&self) -> std::result::Result<TickReport, MonitoringError> {
        let raw = self.inner.source.capture()?;
        let now = self.inner.clock.now_ms();
        let sample = self.inner.parser.sample(&raw, now);
        let frames = sample.frames;
        let depth = sample.depth;

        let mut report = TickReport {
            depth,
            top_function: frames.first().map(|f| f.function.clone()),
            alert: None,
            cleared: false,
            recovered: false,
            recursion: None,
            excessive_patterns: Vec::new(),
            memory_correlated: false,
            recoveries: Vec::new(),
            terminated: false,
        };
        let mut actions = Vec::new();

        {
            let mut state = self.state();
            state.stats.ticks += 1;
            state.stats.last_depth = depth;
            state.stats.max_depth = state.stats.max_depth.max(depth);

            self.evaluate_thresholds(&mut state, &mut report, &mut actions);
            self.analyze(&mut state, &frames, &mut report, &mut actions);

            let ticks = state.stats.ticks;
            let every = self.inner.config.cleanup_every;
            if every > 0 && ticks % every == 0 {
                let horizon = self.inner.config.recursion.pattern_window_ms.saturating_mul(10);
                let (cached, patterns) = state.detector.cleanup(now);
                let analyses = state.analyzer.purge_older_than(now.saturating_sub(horizon));
                debug!(cached, patterns, analyses, "stack analysis caches purged");
            }
        }

        self.correlate_memory(depth, &mut report, &mut actions);

        for action in actions {
            match action {
                Action::Terminate(reason) => {
                    report.terminated = true;
                    match &self.inner.engine {
                        Some(engine) => engine.terminate_immediately(&reason),
                        None => error!(%reason, depth, "shutdown depth reached with no shutdown engine"),
                    }
                }
                Action::Recover(reason) => {
                    if let Some(success) = self.recover(reason) {
                        report.recoveries.push((reason.to_string(), success));
                    }
                }
            }
        }
        Ok(report)
    }

    fn evaluate_thresholds(
        &self,
        state: &mut MonitorState,
        report: &mut TickReport,
        actions: &mut Vec<Action>,
    ) {
        let config = &self.inner.config;
        let depth = report.depth;
        let highest = StackLevel::DESCENDING
            .into_iter()
            .find(|level| depth >= config.threshold(*level));
        state.current = highest;

        let Some(level) = highest else {
            if !state.latched.is_empty() {
                state.latched.clear();
                report.cleared = true;
                debug!(depth, "stack depth back below warning");
            }
            // Each incident ends here; recovery budgets are per incident.
            state.recovery_attempts.clear();
            state.exhausted.clear();
            if state.in_emergency {
                state.in_emergency = false;
                state.stats.recoveries_from_emergency += 1;
                report.recovered = true;
                info!(depth, "stack recovered from emergency");
                self.inner.events.emit(GuardianEvent::StackRecovered { depth });
            }
            return;
        };

        if state.latched.contains(&level) {
            return;
        }
        for lower in StackLevel::DESCENDING {
            if lower <= level && !state.latched.contains(&lower) {
                state.latched.push(lower);
            }
        }
        *state.stats.alerts.entry(level).or_insert(0) += 1;
        report.alert = Some(level);

        let threshold = config.threshold(level);
        match level {
            StackLevel::Warning | StackLevel::Critical => {
                warn!(%level, depth, threshold, top = ?report.top_function, "stack depth alert");
            }
            StackLevel::Emergency | StackLevel::Shutdown => {
                error!(%level, depth, threshold, top = ?report.top_function, "stack depth alert");
            }
        }
        self.inner.events.emit(GuardianEvent::StackAlert {
            level,
            depth,
            threshold,
            top_function: report.top_function.clone(),
        });

        match level {
            StackLevel::Shutdown => actions.push(Action::Terminate(format!("stack_depth_{depth}"))),
            StackLevel::Emergency => {
                state.in_emergency = true;
                actions.push(Action::Recover(REASON_CRITICAL_DEPTH));
            }
            StackLevel::Warning | StackLevel::Critical => {}
        }
    }

    fn analyze(
        &self,
        state: &mut MonitorState,
        frames: &[Frame],
        report: &mut TickReport,
        actions: &mut Vec<Action>,
    ) {
        let config = &self.inner.config;

        if config.enable_pattern_analysis {
            let analysis = state.analyzer.analyze_frames(frames);
            if !analysis.is_valid {
                debug!(error = ?analysis.error, "pattern analysis produced no result");
            }
            for hot in analysis.hot_sequences {
                if hot.frequency <= config.pattern_frequency_threshold {
                    continue;
                }
                let label = hot.label();
                if !state.reported_patterns.insert(label.clone()) {
                    continue;
                }
                state.stats.excessive_patterns += 1;
                warn!(sequence = %label, frequency = hot.frequency, "excessive call pattern");
                self.inner.events.emit(GuardianEvent::ExcessivePattern {
                    sequence: label.clone(),
                    frequency: u32::try_from(hot.frequency).unwrap_or(u32::MAX),
                });
                report.excessive_patterns.push(label);
            }
        }

        if config.enable_recursion_detection {
            let verdict = state.detector.analyze_frames(frames);
            if verdict.is_recursive {
                if !verdict.from_cache {
                    state.stats.recursions_detected += 1;
                    warn!(
                        types = ?verdict.recursion_types,
                        confidence = verdict.confidence,
                        depth = verdict.depth,
                        "recursion detected"
                    );
                    self.inner.events.emit(GuardianEvent::RecursionDetected {
                        types: verdict.recursion_types.clone(),
                        confidence: verdict.confidence,
                        depth: verdict.depth,
                    });
                }
                if report.depth >= config.critical_depth {
                    actions.push(Action::Recover(REASON_RECURSION));
                }
            }
            report.recursion = Some(verdict);
        }
    }

    fn correlate_memory(&self, depth: usize, report: &mut TickReport, actions: &mut Vec<Action>) {
        let config = &self.inner.config;
        if !config.enable_memory_correlation || config.memory_check_every == 0 {
            return;
        }
        let Some(probe) = &self.inner.probe else {
            return;
        };
        if self.state().stats.ticks % config.memory_check_every != 0 {
            return;
        }

        let heap = probe.read().heap_used;
        let mut state = self.state();
        let previous = state.last_memory.replace((heap, depth));
        let Some((prev_heap, prev_depth)) = previous else {
            return;
        };
        let heap_growth = heap.saturating_sub(prev_heap);
        let depth_growth = depth.saturating_sub(prev_depth);
        if heap_growth > config.heap_growth_threshold && depth_growth > config.depth_growth_threshold {
            state.stats.memory_correlations += 1;
            warn!(heap_growth, depth_growth, "heap growth correlated with stack growth");
            self.inner.events.emit(GuardianEvent::MemoryCorrelation {
                heap_growth,
                depth_growth,
            });
            report.memory_correlated = true;
            actions.push(Action::Recover(REASON_MEMORY_CORRELATION));
        }
    }

    /// Runs the recovery routine for `reason`.
    ///
    /// Returns `None` when the attempt cap for `reason` is already reached
    /// (the first such call escalates to the shutdown engine), otherwise
    /// whether the routine succeeded.
    pub fn recover(&self, reason: &str) -> Option<bool> {
        let max = self.inner.config.max_recovery_attempts;
        let attempt = {
            let mut state = self.state();
            let used = state.recovery_attempts.get(reason).copied().unwrap_or(0);
            if used >= max {
                let first = state.exhausted.insert(reason.to_string());
                if first {
                    state.stats.escalations += 1;
                }
                drop(state);
                if first {
                    error!(%reason, attempts = used, "stack recovery attempts exhausted");
                    self.inner.events.emit(GuardianEvent::RecoveryMaxAttempts { attempts: used });
                    self.escalate(reason);
                }
                return None;
            }
            state.recovery_attempts.insert(reason.to_string(), used + 1);
            state.stats.recovery_attempts += 1;
            used + 1
        };

        info!(%reason, attempt, "stack recovery attempt");
        self.inner.events.emit(GuardianEvent::RecoveryAttempt {
            reason: reason.to_string(),
            attempt,
        });

        let outcome = match reason {
            REASON_CRITICAL_DEPTH => self.recover_critical_depth(),
            REASON_RECURSION => self.recover_recursion(),
            REASON_MEMORY_CORRELATION => self.recover_memory_correlation(),
            _ => self.recover_generic(),
        };

        match outcome {
            Ok(()) => {
                self.state().stats.recovery_successes += 1;
                info!(%reason, attempt, "stack recovery succeeded");
                self.inner.events.emit(GuardianEvent::RecoverySuccess {
                    reason: reason.to_string(),
                    attempt,
                });
                Some(true)
            }
            Err(err) => {
                warn!(%reason, attempt, error = %err, "stack recovery failed");
                self.inner.events.emit(GuardianEvent::RecoveryFailed {
                    reason: reason.to_string(),
                    attempt,
                    error: err.to_string(),
                });
                Some(false)
            }
        }
    }

    fn recover_critical_depth(&self) -> std::result::Result<(), ServiceError> {
        if let Some(engine) = &self.inner.engine {
            let cleared = engine.resources().clear_timers();
            debug!(cleared, "tracked timers cleared");
        }
        let timers = self.inner.hooks.clear_pending_timers();
        if let Some(reclaimer) = &self.inner.reclaimer {
            let record = reclaimer.force_collect();
            debug!(efficiency = record.efficiency(), "forced collection");
        }
        let backlog = self.inner.hooks.drain_backlog();
        timers.and(backlog)
    }

    fn recover_recursion(&self) -> std::result::Result<(), ServiceError> {
        if let Some(shadow) = &self.inner.shadow {
            shadow.trip();
        }
        let mut state = self.state();
        let purged = state.detector.purge_suspicious();
        state.analyzer.clear_cache();
        debug!(purged, "recursion state purged");
        Ok(())
    }

    fn recover_memory_correlation(&self) -> std::result::Result<(), ServiceError> {
        if let Some(reclaimer) = &self.inner.reclaimer {
            reclaimer.force_collect();
        }
        self.state().analyzer.clear_cache();
        self.inner.hooks.clear_caches()
    }

    fn recover_generic(&self) -> std::result::Result<(), ServiceError> {
        self.state().analyzer.reset();
        self.inner.hooks.reset()
    }

    fn escalate(&self, reason: &str) {
        let Some(engine) = self.inner.engine.clone() else {
            warn!(%reason, "no shutdown engine to escalate to");
            return;
        };
        let shutdown_reason = format!("stack_recovery_exhausted:{reason}");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = engine.initiate_shutdown(shutdown_reason).await {
                        warn!(error = %err, "escalated shutdown did not complete");
                    }
                });
            }
            Err(_) => error!(%reason, "escalation needs a tokio runtime; shutdown not started"),
        }
    }

    /// Clears recovery counters and the escalation record.
    pub fn reset_recovery_attempts(&self) {
        let mut state = self.state();
        state.recovery_attempts.clear();
        state.exhausted.clear();
    }

    /// Records one execution of `function` for pattern correlation.
    pub fn record_function_metrics(&self, function: &str, duration_ms: f64, memory_delta: i64) {
        self.state()
            .analyzer
            .record_function_metrics(function, duration_ms, memory_delta);
    }

    /// Highest level the latest sample exceeded.
    #[must_use]
    pub fn active_alert(&self) -> Option<StackLevel> {
        self.state().active()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        self.state().stats.clone()
    }

    /// Point-in-time status.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        let state = self.state();
        MonitorStatus {
            enabled: self.is_enabled(),
            active_alert: state.active(),
            in_emergency: state.in_emergency,
            recovery_attempts: state
                .recovery_attempts
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            stats: state.stats.clone(),
            detector: state.detector.stats(),
            pattern_cache: state.analyzer.cache_stats(),
        }
    }
}

impl std::fmt::Debug for StackMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackMonitor")
            .field("enabled", &self.is_enabled())
            .field("source", &self.inner.source)
            .field("warning_depth", &self.inner.config.warning_depth)
            .field("shutdown_depth", &self.inner.config.shutdown_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ManualSource;
    use guardian_runtime::{drain_events, ManualClock, ManualProbe, RawMemoryStats};

    fn monitor(config: StackMonitorConfig) -> (StackMonitor, ManualSource, EventBus) {
        let bus = EventBus::new(256);
        let source = ManualSource::new();
        let monitor = StackMonitor::builder(config, bus.clone())
            .source(source.clone())
            .clock(ManualClock::new(1_000).shared())
            .build()
            .unwrap();
        (monitor, source, bus)
    }

    fn quiet() -> StackMonitorConfig {
        let mut config = StackMonitorConfig::new();
        config.enable_pattern_analysis = false;
        config.enable_recursion_detection = false;
        config.tick_budget_ms = u64::MAX;
        config
    }

    #[test]
    fn test_config_validation() {
        assert!(StackMonitorConfig::new().validate().is_ok());
        let bad = StackMonitorConfig::new().with_depths(100, 100, 300, 500);
        assert_eq!(bad.validate().unwrap_err().field, "critical_depth");
        let bad = StackMonitorConfig::new().with_depths(100, 200, 300, 250);
        assert_eq!(bad.validate().unwrap_err().field, "shutdown_depth");
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = StackMonitorConfig::new().with_depths(0, 1, 2, 3);
        assert!(StackMonitor::builder(config, EventBus::new(4)).build().is_err());
    }

    #[test]
    fn test_single_highest_alert_fires() {
        let (monitor, source, bus) = monitor(quiet());
        let mut rx = bus.subscribe();

        source.set_depth(250, "f");
        let report = monitor.tick().unwrap();
        assert_eq!(report.alert, Some(StackLevel::Critical));
        assert_eq!(monitor.active_alert(), Some(StackLevel::Critical));

        // Warning is latched by the critical alert and never fires.
        source.set_depth(150, "f");
        assert_eq!(monitor.tick().unwrap().alert, None);
        assert_eq!(monitor.active_alert(), Some(StackLevel::Warning));

        let names: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["stack:critical"]);
    }

    #[test]
    fn test_latches_clear_below_warning() {
        let (monitor, source, _bus) = monitor(quiet());
        source.set_depth(150, "f");
        monitor.tick().unwrap();
        source.set_depth(10, "f");
        let report = monitor.tick().unwrap();
        assert!(report.cleared);
        assert!(!report.recovered);
        assert_eq!(monitor.active_alert(), None);

        source.set_depth(150, "f");
        assert_eq!(monitor.tick().unwrap().alert, Some(StackLevel::Warning));
    }

    #[test]
    fn test_emergency_runs_critical_depth_recovery() {
        let (monitor, source, bus) = monitor(quiet());
        let mut rx = bus.subscribe();
        source.set_depth(320, "f");
        let report = monitor.tick().unwrap();
        assert_eq!(report.alert, Some(StackLevel::Emergency));
        assert_eq!(report.recoveries, vec![(REASON_CRITICAL_DEPTH.to_string(), true)]);
        assert!(monitor.status().in_emergency);

        let names: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["stack:emergency", "recovery:attempt", "recovery:success"]);
    }

    #[test]
    fn test_capture_failure_is_counted() {
        let (monitor, source, bus) = monitor(quiet());
        let mut rx = bus.subscribe();
        source.fail();
        let err = monitor.tick().unwrap_err();
        assert_eq!(err.stage, "capture");
        assert_eq!(monitor.stats().errors, 1);
        assert_eq!(drain_events(&mut rx)[0].name(), "stack:monitoring-error");
    }

    #[test]
    fn test_recovery_cap_per_reason() {
        let (monitor, _source, bus) = monitor(quiet().with_max_recovery_attempts(2));
        let mut rx = bus.subscribe();
        assert_eq!(monitor.recover("other"), Some(true));
        assert_eq!(monitor.recover("other"), Some(true));
        assert_eq!(monitor.recover("other"), None);
        assert_eq!(monitor.recover("other"), None);
        // Other reasons have their own budget.
        assert_eq!(monitor.recover(REASON_MEMORY_CORRELATION), Some(true));

        let max_events = drain_events(&mut rx)
            .iter()
            .filter(|e| e.name() == "recovery:max-attempts")
            .count();
        assert_eq!(max_events, 1);
        assert_eq!(monitor.stats().escalations, 1);
    }

    #[test]
    fn test_resolved_incidents_do_not_exhaust_recovery() {
        let mut config = StackMonitorConfig::new();
        config.tick_budget_ms = u64::MAX;
        let (monitor, source, bus) = monitor(config);
        let mut rx = bus.subscribe();

        for _ in 0..5 {
            source.set_depth(250, "app::f");
            let report = monitor.tick().unwrap();
            assert_eq!(report.alert, Some(StackLevel::Critical));
            assert!(report.recoveries.contains(&(REASON_RECURSION.to_string(), true)));
            source.set_depth(10, "app::g");
            monitor.tick().unwrap();
        }

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| e.name() == "recovery:success"));
        assert!(!events.iter().any(|e| e.name() == "recovery:max-attempts"));
        assert_eq!(monitor.stats().escalations, 0);
        assert!(monitor.status().recovery_attempts.is_empty());
    }

    #[test]
    fn test_failing_hook_reports_failure() {
        struct Failing;
        impl StackRecoveryHooks for Failing {
            fn drain_backlog(&self) -> std::result::Result<(), ServiceError> {
                Err(ServiceError::failed("queue locked"))
            }
        }

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let monitor = StackMonitor::builder(quiet(), bus)
            .source(ManualSource::new())
            .hooks(Arc::new(Failing))
            .build()
            .unwrap();
        assert_eq!(monitor.recover(REASON_CRITICAL_DEPTH), Some(false));
        let events = drain_events(&mut rx);
        assert!(matches!(
            events.last(),
            Some(GuardianEvent::RecoveryFailed { error, .. }) if error == "queue locked"
        ));
    }

    #[test]
    fn test_memory_correlation() {
        let probe = ManualProbe::new(RawMemoryStats {
            heap_used: 10 * 1024 * 1024,
            ..RawMemoryStats::default()
        });
        let bus = EventBus::new(64);
        let source = ManualSource::new();
        let config = quiet().with_memory_correlation(2, 1024 * 1024, 20);
        let monitor = StackMonitor::builder(config, bus.clone())
            .source(source.clone())
            .probe(Arc::new(probe.clone()))
            .build()
            .unwrap();

        source.set_depth(10, "f");
        monitor.tick().unwrap();
        assert!(!monitor.tick().unwrap().memory_correlated); // baseline

        probe.update(|s| s.heap_used += 8 * 1024 * 1024);
        source.set_depth(60, "f");
        monitor.tick().unwrap();
        let report = monitor.tick().unwrap();
        assert!(report.memory_correlated);
        assert_eq!(report.recoveries, vec![(REASON_MEMORY_CORRELATION.to_string(), true)]);
    }

    #[test]
    fn test_excessive_pattern_reported_once() {
        let mut config = quiet().with_pattern_frequency_threshold(3);
        config.enable_pattern_analysis = true;
        config.pattern = PatternConfig::new().with_hot_sequence_threshold(1);
        let (monitor, source, _bus) = monitor(config);
        source.set_functions(["app::leaf", "app::root"]);

        let mut reported = Vec::new();
        for _ in 0..6 {
            reported.extend(monitor.tick().unwrap().excessive_patterns);
        }
        assert_eq!(reported, vec!["app::root -> app::leaf".to_string()]);
        assert_eq!(monitor.stats().excessive_patterns, 1);
    }

    #[test]
    fn test_slow_tick_emits_performance_warning() {
        struct Slow;
        impl StackRecoveryHooks for Slow {
            fn drain_backlog(&self) -> std::result::Result<(), ServiceError> {
                std::thread::sleep(Duration::from_millis(10));
                Ok(())
            }
        }

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let source = ManualSource::new();
        let monitor = StackMonitor::builder(quiet().with_tick_budget(1), bus)
            .source(source.clone())
            .hooks(Arc::new(Slow))
            .build()
            .unwrap();
        source.set_depth(320, "f");
        monitor.tick().unwrap();
        assert!(drain_events(&mut rx).iter().any(|e| e.name() == "stack:performance"));
        assert_eq!(monitor.stats().slow_ticks, 1);
    }

    // Security-focused tests

    #[test]
    fn test_recursion_recovery_trips_shadow_stack() {
        let mut config = quiet();
        config.enable_recursion_detection = true;
        config.recursion = RecursionConfig::new().with_direct_threshold(5);
        let shadow = config.shadow_stack();
        let monitor = StackMonitor::builder(config, EventBus::new(64))
            .shadow_stack(shadow.clone())
            .build()
            .unwrap();

        let guards: Vec<_> = (0..210).map(|_| shadow.enter("app::walk").unwrap()).collect();
        let report = monitor.tick().unwrap();
        assert!(report.recursion.as_ref().is_some_and(|v| v.is_recursive));
        assert!(report.recoveries.contains(&(REASON_RECURSION.to_string(), true)));
        assert!(shadow.is_tripped());
        assert!(shadow.enter("app::walk").is_err());
        drop(guards);
        assert!(!shadow.is_tripped());
    }

    #[test]
    fn test_shutdown_depth_without_engine_is_logged_not_fatal() {
        let (monitor, source, _bus) = monitor(quiet());
        source.set_depth(600, "f");
        let report = monitor.tick().unwrap();
        assert_eq!(report.alert, Some(StackLevel::Shutdown));
        assert!(report.terminated);
        assert!(!monitor.status().in_emergency);
    }
}
