//! # Memory Pressure Sampler
//!
//! Periodically combines probe figures with component-reported sizes into a
//! [`PressureSample`], classifies it, and derives trend, leak and
//! emergency-condition signals from a bounded history.
//!
//! ## Classification
//!
//! | Level | Condition |
//! |-------|-----------|
//! | Emergency | heap ≥ emergency, or RSS over `rss_limit`, or external over `external_limit` |
//! | Critical | heap ≥ critical |
//! | Warning | heap ≥ warning |
//! | Normal | otherwise |
//!
//! ## Leak Scoring
//!
//! Over the last `leak_detection_window` samples, one point each for:
//!
//! 1. consistent growth (at least 80% of steps grow, and net growth)
//! 2. mean growth rate above `leak_growth_threshold` bytes/s
//! 3. collection efficiency below `gc_efficiency_threshold`, or external
//!    memory above `external_leak_threshold`
//!
//! Two or more points report a leak with confidence `score / 3`.
//!
//! ## Cooldowns
//!
//! A pressure alert for a level fires again only after that level's
//! cooldown, or after a normal sample re-arms every level. Emergency has
//! the shortest cooldown.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use guardian_runtime::{
    ComponentRegistry, ConfigError, EventBus, GuardianEvent, MemoryProbe, PeriodicTask,
    PressureLevel, RawMemoryStats, Reclaimer, SharedClock, SystemClock,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Emergency condition: heap at or above the emergency threshold.
pub const CONDITION_HEAP: &str = "heap_emergency";
/// Emergency condition: RSS above `rss_limit`.
pub const CONDITION_RSS: &str = "rss_over_limit";
/// Emergency condition: external memory above `external_limit`.
pub const CONDITION_EXTERNAL: &str = "external_over_limit";
/// Emergency condition: system memory above `system_emergency_threshold`.
pub const CONDITION_SYSTEM: &str = "system_memory";
/// Emergency condition: a mostly unused heap reservation while usage is high.
pub const CONDITION_FRAGMENTATION: &str = "fragmentation";

/// Leak indicator: steady growth across the window.
pub const INDICATOR_CONSISTENT_GROWTH: &str = "consistent_growth";
/// Leak indicator: mean growth rate above threshold.
pub const INDICATOR_GROWTH_RATE: &str = "growth_rate";
/// Leak indicator: forced collections recover little.
pub const INDICATOR_LOW_EFFICIENCY: &str = "low_collection_efficiency";
/// Leak indicator: external memory above threshold.
pub const INDICATOR_EXTERNAL: &str = "external_memory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Configuration for [`MemorySampler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Sampling period.
    pub sample_interval_ms: u64,
    /// Heap fraction classified as warning.
    pub warning_threshold: f64,
    /// Heap fraction classified as critical.
    pub critical_threshold: f64,
    /// Heap fraction classified as emergency.
    pub emergency_threshold: f64,
    /// RSS above this is an emergency.
    pub rss_limit: Option<u64>,
    /// External memory above this is an emergency.
    pub external_limit: Option<u64>,
    /// External memory above this counts toward the leak score.
    pub external_leak_threshold: u64,
    /// Samples kept.
    pub history_size: usize,
    /// Samples older than this are dropped.
    pub max_sample_age_ms: u64,
    /// Samples used for the trend.
    pub trend_window: usize,
    /// Samples used for leak scoring.
    pub leak_detection_window: usize,
    /// Mean growth (bytes/s) that counts toward the leak score.
    pub leak_growth_threshold: f64,
    /// Collection efficiency below which collections count as ineffective.
    pub gc_efficiency_threshold: f64,
    /// System memory fraction that is an emergency condition.
    pub system_emergency_threshold: f64,
    /// Unused fraction of the heap reservation that counts as fragmented.
    pub fragmentation_unused: f64,
    /// Heap fraction above which fragmentation matters.
    pub fragmentation_used: f64,
    /// Warning alert cooldown.
    pub warning_cooldown_ms: u64,
    /// Critical alert cooldown.
    pub critical_cooldown_ms: u64,
    /// Emergency alert cooldown.
    pub emergency_cooldown_ms: u64,
    /// Leak report cooldown.
    pub leak_cooldown_ms: u64,
    /// Score leaks at all.
    pub enable_leak_detection: bool,
}

impl SamplerConfig {
    /// Creates a new config with default values.
    ///
    /// Defaults:
    /// - Interval: 5s
    /// - Thresholds: 0.70 / 0.85 / 0.95 of the heap limit
    /// - History: 100 samples, 1h max age
    /// - Trend over 5 samples, leak scoring over 10
    /// - Cooldowns: 5min warning, 1min critical, 30s emergency
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sample_interval_ms: 5_000,
            warning_threshold: 0.70,
            critical_threshold: 0.85,
            emergency_threshold: 0.95,
            rss_limit: None,
            external_limit: None,
            external_leak_threshold: 100 * 1024 * 1024,
            history_size: 100,
            max_sample_age_ms: 3_600_000,
            trend_window: 5,
            leak_detection_window: 10,
            leak_growth_threshold: 17_476.0,
            gc_efficiency_threshold: 0.1,
            system_emergency_threshold: 0.95,
            fragmentation_unused: 0.30,
            fragmentation_used: 0.70,
            warning_cooldown_ms: 300_000,
            critical_cooldown_ms: 60_000,
            emergency_cooldown_ms: 30_000,
            leak_cooldown_ms: 300_000,
            enable_leak_detection: true,
        }
    }

    /// Sets the three heap thresholds.
    #[must_use]
    pub const fn with_thresholds(mut self, warning: f64, critical: f64, emergency: f64) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self.emergency_threshold = emergency;
        self
    }

    /// Sets the RSS and external limits.
    #[must_use]
    pub const fn with_limits(mut self, rss: Option<u64>, external: Option<u64>) -> Self {
        self.rss_limit = rss;
        self.external_limit = external;
        self
    }

    /// Sets the per-level alert cooldowns.
    #[must_use]
    pub const fn with_cooldowns(mut self, warning_ms: u64, critical_ms: u64, emergency_ms: u64) -> Self {
        self.warning_cooldown_ms = warning_ms;
        self.critical_cooldown_ms = critical_ms;
        self.emergency_cooldown_ms = emergency_ms;
        self
    }

    /// Sets the leak window and thresholds.
    #[must_use]
    pub const fn with_leak_detection(mut self, window: usize, growth_threshold: f64, gc_efficiency: f64) -> Self {
        self.leak_detection_window = window;
        self.leak_growth_threshold = growth_threshold;
        self.gc_efficiency_threshold = gc_efficiency;
        self
    }

    /// Sets the sampling period.
    #[must_use]
    pub const fn with_sample_interval(mut self, interval_ms: u64) -> Self {
        self.sample_interval_ms = interval_ms;
        self
    }

    /// Sampling period as a [`Duration`].
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Alert cooldown for `level` (0 for normal).
    #[must_use]
    pub const fn cooldown(&self, level: PressureLevel) -> u64 {
        match level {
            PressureLevel::Normal => 0,
            PressureLevel::Warning => self.warning_cooldown_ms,
            PressureLevel::Critical => self.critical_cooldown_ms,
            PressureLevel::Emergency => self.emergency_cooldown_ms,
        }
    }

    /// Classifies raw figures.
    #[must_use]
    pub fn classify(&self, raw: &RawMemoryStats) -> PressureLevel {
        let heap = raw.heap_percent();
        let rss_over = self.rss_limit.is_some_and(|limit| raw.rss > limit);
        let external_over = self.external_limit.is_some_and(|limit| raw.external > limit);
        if heap >= self.emergency_threshold || rss_over || external_over {
            PressureLevel::Emergency
        } else if heap >= self.critical_threshold {
            PressureLevel::Critical
        } else if heap >= self.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Emergency conditions that currently hold.
    #[must_use]
    pub fn emergency_conditions(&self, raw: &RawMemoryStats) -> Vec<&'static str> {
        let heap = raw.heap_percent();
        let mut conditions = Vec::new();
        if heap >= self.emergency_threshold {
            conditions.push(CONDITION_HEAP);
        }
        if self.rss_limit.is_some_and(|limit| raw.rss > limit) {
            conditions.push(CONDITION_RSS);
        }
        if self.external_limit.is_some_and(|limit| raw.external > limit) {
            conditions.push(CONDITION_EXTERNAL);
        }
        if raw.system_percent() > self.system_emergency_threshold {
            conditions.push(CONDITION_SYSTEM);
        }
        if raw.heap_total > 0 && heap > self.fragmentation_used {
            let unused = raw.heap_total.saturating_sub(raw.heap_used) as f64 / raw.heap_total as f64;
            if unused > self.fragmentation_unused {
                conditions.push(CONDITION_FRAGMENTATION);
            }
        }
        conditions
    }

    /// Checks threshold ordering and window sizes.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(self.warning_threshold > 0.0 && self.warning_threshold < 1.0) {
            return Err(ConfigError::new("warning_threshold", "must be in (0, 1)"));
        }
        if self.critical_threshold <= self.warning_threshold {
            return Err(ConfigError::new("critical_threshold", "must exceed warning_threshold"));
        }
        if self.emergency_threshold <= self.critical_threshold || self.emergency_threshold >= 1.0 {
            return Err(ConfigError::new(
                "emergency_threshold",
                "must exceed critical_threshold and stay below 1",
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::new("sample_interval_ms", "must be positive"));
        }
        if self.trend_window < 2 {
            return Err(ConfigError::new("trend_window", "must be at least 2"));
        }
        if self.leak_detection_window < 3 {
            return Err(ConfigError::new("leak_detection_window", "must be at least 3"));
        }
        if self.history_size < self.trend_window.max(self.leak_detection_window) {
            return Err(ConfigError::new(
                "history_size",
                "must hold the trend and leak windows",
            ));
        }
        Ok(())
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One classified memory reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    /// When the sample was taken (epoch ms).
    pub timestamp_ms: u64,
    /// Heap bytes in use.
    pub heap_used: u64,
    /// Heap bytes reserved.
    pub heap_total: u64,
    /// Heap budget.
    pub heap_limit: u64,
    /// `heap_used / heap_limit`.
    pub heap_percent: f64,
    /// Resident set size.
    pub rss: u64,
    /// External memory.
    pub external: u64,
    /// I/O buffers.
    pub buffers: u64,
    /// System memory in use, as a fraction.
    pub system_percent: f64,
    /// Sizes reported by registered components.
    pub component_sizes: BTreeMap<String, u64>,
    /// Forced collection passes so far.
    pub collections: u64,
    /// Classified level.
    pub level: PressureLevel,
}

impl PressureSample {
    fn new(
        timestamp_ms: u64,
        raw: &RawMemoryStats,
        level: PressureLevel,
        component_sizes: BTreeMap<String, u64>,
        collections: u64,
    ) -> Self {
        Self {
            timestamp_ms,
            heap_used: raw.heap_used,
            heap_total: raw.heap_total,
            heap_limit: raw.heap_limit,
            heap_percent: raw.heap_percent(),
            rss: raw.rss,
            external: raw.external,
            buffers: raw.buffers,
            system_percent: raw.system_percent(),
            component_sizes,
            collections,
            level,
        }
    }
}

/// Categorical heap trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// More than 10% growth across the window.
    IncreasingFast,
    /// More than 2% growth.
    Increasing,
    /// Within ±2%.
    Stable,
    /// More than 2% shrinkage.
    Decreasing,
}

/// Heap trend over the last few samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTrend {
    /// Heap growth in bytes per second (negative when shrinking).
    pub growth_rate: f64,
    /// Categorical direction.
    pub direction: TrendDirection,
    /// Milliseconds until the heap limit at the current rate, if growing.
    pub time_to_limit_ms: Option<u64>,
    /// Mean efficiency of forced collections in the window (0 when none ran).
    pub gc_efficiency: f64,
    /// Samples the trend was computed from.
    pub samples: usize,
}

/// A leak report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    /// Indicators that fired (2 or 3).
    pub score: u8,
    /// `score / 3`.
    pub confidence: f64,
    /// Mean growth in bytes per second over the window.
    pub growth_rate: f64,
    /// Names of the indicators that fired.
    pub indicators: Vec<String>,
}

/// Everything one call to [`MemorySampler::take_sample`] produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    /// The recorded sample.
    pub sample: PressureSample,
    /// Trend, once enough samples exist.
    pub trend: Option<MemoryTrend>,
    /// Pressure alert emitted by this sample, if any.
    pub alert: Option<PressureLevel>,
    /// Leak reported by this sample, if any.
    pub leak: Option<LeakReport>,
    /// Emergency conditions that hold.
    pub emergency_conditions: Vec<String>,
    /// True when "emergency action needed" was emitted.
    pub emergency_action: bool,
}

/// Sampler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerStats {
    /// Samples taken.
    pub samples: u64,
    /// Alerts emitted per level.
    pub alerts: BTreeMap<PressureLevel, u64>,
    /// Leak reports emitted.
    pub leaks_detected: u64,
    /// Emergency-action events emitted.
    pub emergency_actions: u64,
    /// Samples dropped for age.
    pub aged_out: u64,
}

#[derive(Default)]
struct SamplerState {
    history: VecDeque<PressureSample>,
    last_alert: HashMap<PressureLevel, u64>,
    last_leak_ms: Option<u64>,
    last_emergency_action_ms: Option<u64>,
    stats: SamplerStats,
}

struct Inner {
    config: SamplerConfig,
    probe: Arc<dyn MemoryProbe>,
    clock: SharedClock,
    events: EventBus,
    registry: Option<ComponentRegistry>,
    reclaimer: Option<Reclaimer>,
    state: Mutex<SamplerState>,
    task: Mutex<Option<PeriodicTask>>,
    enabled: AtomicBool,
}

/// Builder for [`MemorySampler`].
pub struct MemorySamplerBuilder {
    config: SamplerConfig,
    probe: Arc<dyn MemoryProbe>,
    events: EventBus,
    clock: Option<SharedClock>,
    registry: Option<ComponentRegistry>,
    reclaimer: Option<Reclaimer>,
}

impl MemorySamplerBuilder {
    /// Uses `clock` for timestamps and cooldowns.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds component-reported sizes to each sample.
    #[must_use]
    pub fn registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Reads collection efficiency from `reclaimer`.
    #[must_use]
    pub fn reclaimer(mut self, reclaimer: Reclaimer) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// Validates the config and builds the sampler.
    ///
    /// # Errors
    ///
    /// [`crate::MemoryError::Config`] when the config is invalid.
    pub fn build(self) -> Result<MemorySampler> {
        self.config.validate()?;
        Ok(MemorySampler {
            inner: Arc::new(Inner {
                config: self.config,
                probe: self.probe,
                clock: self.clock.unwrap_or_else(SystemClock::shared),
                events: self.events,
                registry: self.registry,
                reclaimer: self.reclaimer,
                state: Mutex::new(SamplerState::default()),
                task: Mutex::new(None),
                enabled: AtomicBool::new(false),
            }),
        })
    }
}

/// Memory pressure sampler. Clones share state.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use guardian_memory::{MemorySampler, SamplerConfig};
/// use guardian_runtime::{EventBus, ManualProbe, PressureLevel, RawMemoryStats};
///
/// let probe = ManualProbe::new(RawMemoryStats {
///     heap_used: 80,
///     heap_limit: 100,
///     ..RawMemoryStats::default()
/// });
/// let sampler = MemorySampler::builder(SamplerConfig::new(), Arc::new(probe), EventBus::new(16))
///     .build()?;
///
/// let outcome = sampler.take_sample();
/// assert_eq!(outcome.sample.level, PressureLevel::Warning);
/// assert_eq!(outcome.alert, Some(PressureLevel::Warning));
/// # Ok::<(), guardian_memory::MemoryError>(())
/// ```
#[derive(Clone)]
pub struct MemorySampler {
    inner: Arc<Inner>,
}

impl MemorySampler {
    /// Starts building a sampler reading `probe`.
    pub fn builder(
        config: SamplerConfig,
        probe: Arc<dyn MemoryProbe>,
        events: EventBus,
    ) -> MemorySamplerBuilder {
        MemorySamplerBuilder {
            config,
            probe,
            events,
            clock: None,
            registry: None,
            reclaimer: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, SamplerState> {
        lock(&self.inner.state)
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SamplerConfig {
        &self.inner.config
    }

    /// Reads the probe without recording a sample.
    #[must_use]
    pub fn read_raw(&self) -> RawMemoryStats {
        self.inner.probe.read()
    }

    /// Classifies the current probe reading without recording it.
    #[must_use]
    pub fn current_level(&self) -> PressureLevel {
        self.inner.config.classify(&self.read_raw())
    }

    /// Takes, records and evaluates one sample, emitting any events due.
    pub fn take_sample(&self) -> SampleOutcome {
        let config = &self.inner.config;
        let raw = self.inner.probe.read();
        let now = self.inner.clock.now_ms();
        let component_sizes = self
            .inner
            .registry
            .as_ref()
            .map(ComponentRegistry::component_sizes)
            .unwrap_or_default();
        let collections = self
            .inner
            .reclaimer
            .as_ref()
            .map_or(0, |r| r.stats().passes);
        let level = config.classify(&raw);
        let sample = PressureSample::new(now, &raw, level, component_sizes, collections);
        let conditions = config.emergency_conditions(&raw);

        let mut state = self.state();
        state.stats.samples += 1;
        self.record(&mut state, sample.clone(), now);

        let trend = self.trend_of(&state.history);
        let alert = Self::due_alert(config, &mut state, level, now);
        let leak = if config.enable_leak_detection {
            self.detect_leak(&state.history)
                .filter(|_| Self::cooldown_elapsed(state.last_leak_ms, config.leak_cooldown_ms, now))
        } else {
            None
        };
        if leak.is_some() {
            state.last_leak_ms = Some(now);
            state.stats.leaks_detected += 1;
        }
        let emergency_action = conditions.len() >= 2
            && Self::cooldown_elapsed(state.last_emergency_action_ms, config.emergency_cooldown_ms, now);
        if emergency_action {
            state.last_emergency_action_ms = Some(now);
            state.stats.emergency_actions += 1;
        }
        if let Some(level) = alert {
            *state.stats.alerts.entry(level).or_insert(0) += 1;
        }
        drop(state);

        let emergency_conditions: Vec<String> = conditions.iter().map(|c| (*c).to_string()).collect();
        self.report(&sample, alert, leak.as_ref(), emergency_action, &emergency_conditions);

        SampleOutcome {
            sample,
            trend,
            alert,
            leak,
            emergency_conditions,
            emergency_action,
        }
    }

    fn record(&self, state: &mut SamplerState, sample: PressureSample, now: u64) {
        let max_age = self.inner.config.max_sample_age_ms;
        while state
            .history
            .front()
            .is_some_and(|s| now.saturating_sub(s.timestamp_ms) > max_age)
        {
            state.history.pop_front();
            state.stats.aged_out += 1;
        }
        while state.history.len() >= self.inner.config.history_size {
            state.history.pop_front();
        }
        state.history.push_back(sample);
    }

    fn cooldown_elapsed(last: Option<u64>, cooldown_ms: u64, now: u64) -> bool {
        last.map_or(true, |at| now.saturating_sub(at) >= cooldown_ms)
    }

    fn due_alert(
        config: &SamplerConfig,
        state: &mut SamplerState,
        level: PressureLevel,
        now: u64,
    ) -> Option<PressureLevel> {
        if level == PressureLevel::Normal {
            state.last_alert.clear();
            return None;
        }
        let last = state.last_alert.get(&level).copied();
        if !Self::cooldown_elapsed(last, config.cooldown(level), now) {
            return None;
        }
        state.last_alert.insert(level, now);
        Some(level)
    }

    fn report(
        &self,
        sample: &PressureSample,
        alert: Option<PressureLevel>,
        leak: Option<&LeakReport>,
        emergency_action: bool,
        conditions: &[String],
    ) {
        let events = &self.inner.events;
        if let Some(level) = alert {
            match level {
                PressureLevel::Emergency => error!(
                    heap_percent = sample.heap_percent,
                    heap_used = sample.heap_used,
                    rss = sample.rss,
                    "memory pressure emergency"
                ),
                PressureLevel::Critical => warn!(
                    heap_percent = sample.heap_percent,
                    heap_used = sample.heap_used,
                    "memory pressure critical"
                ),
                _ => info!(heap_percent = sample.heap_percent, level = %level, "memory pressure"),
            }
            events.emit(GuardianEvent::MemoryPressure {
                level,
                heap_percent: sample.heap_percent,
                heap_used: sample.heap_used,
                rss: sample.rss,
            });
        }
        if let Some(leak) = leak {
            warn!(
                confidence = leak.confidence,
                growth_rate = leak.growth_rate,
                indicators = ?leak.indicators,
                "possible memory leak"
            );
            events.emit(GuardianEvent::LeakDetected {
                confidence: leak.confidence,
                growth_rate: leak.growth_rate,
                indicators: leak.indicators.clone(),
            });
        }
        if emergency_action {
            error!(conditions = ?conditions, "memory emergency action needed");
            events.emit(GuardianEvent::EmergencyActionNeeded {
                conditions: conditions.to_vec(),
            });
        }
    }

    fn collection_efficiency(&self, since_ms: u64) -> f64 {
        let Some(reclaimer) = &self.inner.reclaimer else {
            return 0.0;
        };
        let records = reclaimer.records_since(since_ms);
        if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.efficiency()).sum::<f64>() / records.len() as f64
        }
    }

    fn growth_rate(window: &[&PressureSample]) -> f64 {
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            return 0.0;
        };
        let seconds = last.timestamp_ms.saturating_sub(first.timestamp_ms) as f64 / 1000.0;
        if seconds <= 0.0 {
            return 0.0;
        }
        (last.heap_used as f64 - first.heap_used as f64) / seconds
    }

    fn trend_of(&self, history: &VecDeque<PressureSample>) -> Option<MemoryTrend> {
        let n = self.inner.config.trend_window;
        if history.len() < n {
            return None;
        }
        let window: Vec<&PressureSample> = history.iter().skip(history.len() - n).collect();
        let first = window[0];
        let last = window[n - 1];

        let growth_rate = Self::growth_rate(&window);
        let relative = if first.heap_used == 0 {
            0.0
        } else {
            (last.heap_used as f64 - first.heap_used as f64) / first.heap_used as f64
        };
        let direction = if relative > 0.10 {
            TrendDirection::IncreasingFast
        } else if relative > 0.02 {
            TrendDirection::Increasing
        } else if relative < -0.02 {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };
        let time_to_limit_ms = (growth_rate > 0.0 && last.heap_limit > last.heap_used).then(|| {
            let remaining = (last.heap_limit - last.heap_used) as f64;
            (remaining / growth_rate * 1000.0) as u64
        });

        Some(MemoryTrend {
            growth_rate,
            direction,
            time_to_limit_ms,
            gc_efficiency: self.collection_efficiency(first.timestamp_ms),
            samples: n,
        })
    }

    fn detect_leak(&self, history: &VecDeque<PressureSample>) -> Option<LeakReport> {
        let config = &self.inner.config;
        let n = config.leak_detection_window;
        if history.len() < n {
            return None;
        }
        let window: Vec<&PressureSample> = history.iter().skip(history.len() - n).collect();
        let first = window[0];
        let last = window[n - 1];

        let steps = n - 1;
        let growing = window
            .windows(2)
            .filter(|pair| pair[1].heap_used > pair[0].heap_used)
            .count();
        let mut indicators = Vec::new();
        if last.heap_used > first.heap_used && growing * 5 >= steps * 4 {
            indicators.push(INDICATOR_CONSISTENT_GROWTH.to_string());
        }
        let growth_rate = Self::growth_rate(&window);
        if growth_rate > config.leak_growth_threshold {
            indicators.push(INDICATOR_GROWTH_RATE.to_string());
        }
        if self.collection_efficiency(first.timestamp_ms) < config.gc_efficiency_threshold {
            indicators.push(INDICATOR_LOW_EFFICIENCY.to_string());
        } else if last.external > config.external_leak_threshold {
            indicators.push(INDICATOR_EXTERNAL.to_string());
        }

        let score = indicators.len() as u8;
        debug!(score, growth_rate, "leak score");
        (score >= 2).then(|| LeakReport {
            score,
            confidence: f64::from(score) / 3.0,
            growth_rate,
            indicators,
        })
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest_sample(&self) -> Option<PressureSample> {
        self.state().history.back().cloned()
    }

    /// Recorded samples, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PressureSample> {
        self.state().history.iter().cloned().collect()
    }

    /// Trend over the most recent samples, once enough exist.
    #[must_use]
    pub fn trend(&self) -> Option<MemoryTrend> {
        let state = self.state();
        self.trend_of(&state.history)
    }

    /// Drops recorded samples and re-arms every alert.
    pub fn clear_history(&self) -> usize {
        let mut state = self.state();
        let dropped = state.history.len();
        state.history.clear();
        state.last_alert.clear();
        state.last_leak_ms = None;
        state.last_emergency_action_ms = None;
        dropped
    }

    /// Counters since the sampler was built.
    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        self.state().stats.clone()
    }

    /// Starts sampling every `sample_interval_ms`. Returns false if already
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
        let task = PeriodicTask::spawn(
            "memory-sampler",
            self.inner.config.sample_interval(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    MemorySampler { inner }.take_sample();
                }
            },
        );
        *lock(&self.inner.task) = Some(task);
        info!(interval_ms = self.inner.config.sample_interval_ms, "memory sampler started");
        true
    }

    /// Cancels periodic sampling. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        if !self.inner.enabled.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(task) = lock(&self.inner.task).take() {
            task.cancel();
        }
        info!("memory sampler stopped");
        true
    }

    /// Returns true while periodic sampling runs.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MemorySampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySampler")
            .field("config", &self.inner.config)
            .field("enabled", &self.is_enabled())
            .field("samples", &self.state().history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_runtime::{drain_events, ManualClock, ManualProbe};

    const LIMIT: u64 = 1_000_000;

    fn raw(heap_used: u64) -> RawMemoryStats {
        RawMemoryStats {
            heap_used,
            heap_limit: LIMIT,
            ..RawMemoryStats::default()
        }
    }

    fn sampler(config: SamplerConfig) -> (MemorySampler, ManualProbe, ManualClock, EventBus) {
        let probe = ManualProbe::new(raw(0));
        let clock = ManualClock::new(1_000_000);
        let bus = EventBus::new(64);
        let sampler = MemorySampler::builder(config, Arc::new(probe.clone()), bus.clone())
            .clock(clock.shared())
            .build()
            .unwrap();
        (sampler, probe, clock, bus)
    }

    #[test]
    fn test_classify_by_heap() {
        let config = SamplerConfig::new();
        assert_eq!(config.classify(&raw(100_000)), PressureLevel::Normal);
        assert_eq!(config.classify(&raw(700_000)), PressureLevel::Warning);
        assert_eq!(config.classify(&raw(850_000)), PressureLevel::Critical);
        assert_eq!(config.classify(&raw(950_000)), PressureLevel::Emergency);
    }

    #[test]
    fn test_classify_rss_and_external_limits() {
        let config = SamplerConfig::new().with_limits(Some(500), Some(1_000));
        let mut stats = raw(10);
        stats.rss = 501;
        assert_eq!(config.classify(&stats), PressureLevel::Emergency);
        stats.rss = 0;
        stats.external = 1_001;
        assert_eq!(config.classify(&stats), PressureLevel::Emergency);
    }

    #[test]
    fn test_validate_rejects_misordered_thresholds() {
        assert!(SamplerConfig::new().validate().is_ok());
        let err = SamplerConfig::new()
            .with_thresholds(0.8, 0.7, 0.9)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "critical_threshold");
        assert!(SamplerConfig::new()
            .with_thresholds(0.7, 0.8, 1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_emergency_conditions_composite() {
        let config = SamplerConfig::new().with_limits(Some(100), None);
        let stats = RawMemoryStats {
            heap_used: 960,
            heap_total: 2_000,
            heap_limit: 1_000,
            rss: 200,
            system_total: 100,
            system_available: 1,
            ..RawMemoryStats::default()
        };
        let conditions = config.emergency_conditions(&stats);
        assert!(conditions.contains(&CONDITION_HEAP));
        assert!(conditions.contains(&CONDITION_RSS));
        assert!(conditions.contains(&CONDITION_SYSTEM));
        assert!(conditions.contains(&CONDITION_FRAGMENTATION));
    }

    #[test]
    fn test_alert_cooldown_and_rearm() {
        let (sampler, probe, clock, _bus) =
            sampler(SamplerConfig::new().with_cooldowns(10_000, 10_000, 10_000));

        probe.set(raw(750_000));
        assert_eq!(sampler.take_sample().alert, Some(PressureLevel::Warning));
        clock.advance(1_000);
        assert_eq!(sampler.take_sample().alert, None);

        // A normal sample re-arms.
        probe.set(raw(10_000));
        clock.advance(1_000);
        assert_eq!(sampler.take_sample().alert, None);
        probe.set(raw(750_000));
        clock.advance(1_000);
        assert_eq!(sampler.take_sample().alert, Some(PressureLevel::Warning));

        // Cooldown elapsing re-fires without re-arming.
        clock.advance(10_000);
        assert_eq!(sampler.take_sample().alert, Some(PressureLevel::Warning));
    }

    #[test]
    fn test_trend_categories() {
        let (sampler, probe, clock, _bus) = sampler(SamplerConfig::new());
        assert!(sampler.trend().is_none());

        for heap in [100_000, 104_000, 108_000, 112_000, 116_000] {
            probe.set(raw(heap));
            sampler.take_sample();
            clock.advance(1_000);
        }
        let trend = sampler.trend().unwrap();
        assert_eq!(trend.direction, TrendDirection::IncreasingFast);
        assert!((trend.growth_rate - 4_000.0).abs() < 1e-6);
        assert_eq!(trend.time_to_limit_ms, Some(221_000));
        assert_eq!(trend.gc_efficiency, 0.0);

        for _ in 0..5 {
            sampler.take_sample();
            clock.advance(1_000);
        }
        assert_eq!(sampler.trend().unwrap().direction, TrendDirection::Stable);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = SamplerConfig::new();
        config.history_size = 10;
        let (sampler, _probe, clock, _bus) = sampler(config);
        for _ in 0..25 {
            sampler.take_sample();
            clock.advance(10);
        }
        assert_eq!(sampler.history().len(), 10);
        assert_eq!(sampler.stats().samples, 25);
    }

    #[test]
    fn test_old_samples_age_out() {
        let mut config = SamplerConfig::new();
        config.max_sample_age_ms = 5_000;
        let (sampler, _probe, clock, _bus) = sampler(config);
        sampler.take_sample();
        clock.advance(6_000);
        sampler.take_sample();
        assert_eq!(sampler.history().len(), 1);
        assert_eq!(sampler.stats().aged_out, 1);
    }

    #[test]
    fn test_flat_heap_is_not_a_leak() {
        let (sampler, probe, clock, _bus) = sampler(SamplerConfig::new());
        probe.set(raw(200_000));
        for _ in 0..20 {
            assert!(sampler.take_sample().leak.is_none());
            clock.advance(5_000);
        }
    }

    #[test]
    fn test_events_emitted() {
        let (sampler, probe, _clock, bus) = sampler(SamplerConfig::new());
        let mut rx = bus.subscribe();
        probe.set(raw(900_000));
        sampler.take_sample();
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "memory:pressure:critical");
    }

    #[test]
    fn test_sample_carries_component_sizes() {
        let registry = ComponentRegistry::new();
        registry.register(
            guardian_runtime::ComponentRegistration::new("cache").with_memory_reporter(|| 4096u64),
        );
        let sampler = MemorySampler::builder(
            SamplerConfig::new(),
            Arc::new(ManualProbe::new(raw(1))),
            EventBus::new(4),
        )
        .registry(registry)
        .build()
        .unwrap();
        let sample = sampler.take_sample().sample;
        assert_eq!(sample.component_sizes.get("cache"), Some(&4096));
    }

    // Security-focused tests

    #[test]
    fn test_emergency_action_needs_two_conditions() {
        let config = SamplerConfig::new().with_limits(Some(100), None);
        let (sampler, probe, _clock, _bus) = sampler(config);

        probe.set(raw(960_000));
        assert!(!sampler.take_sample().emergency_action);

        probe.update(|s| s.rss = 1_000);
        let outcome = sampler.take_sample();
        assert!(outcome.emergency_action);
        assert_eq!(outcome.emergency_conditions.len(), 2);
    }

    #[test]
    fn test_zero_limit_never_classifies_above_normal() {
        let config = SamplerConfig::new();
        let stats = RawMemoryStats {
            heap_used: u64::MAX,
            ..RawMemoryStats::default()
        };
        assert_eq!(config.classify(&stats), PressureLevel::Normal);
    }
}
