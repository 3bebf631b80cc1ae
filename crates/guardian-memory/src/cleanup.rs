//! # Cleanup Manager
//!
//! Runs escalating cleanup strategies over registered collections,
//! services and reclaim hooks.
//!
//! ## Strategies
//!
//! Each level repeats the data actions of the level below before adding its
//! own, so a stronger strategy never leaves more live entries than a weaker
//! one on the same collections.
//!
//! | Level | Adds |
//! |-------|------|
//! | Gentle | evict expired entries, trim histories to `history_cap` |
//! | Moderate | halve bounded collections, drain queues, prune job history |
//! | Aggressive | clear collections above `aggressive_size_ceiling`, reset transient state, clear media, one collection pass |
//! | Emergency | stop non-essential services, clear caches, reset counters, `emergency_collection_passes` passes |
//!
//! A failing action is recorded as a [`StrategyExecutionError`] and the
//! remaining actions still run.
//!
//! ## Security Notes
//!
//! - Only one cleanup runs at a time; overlapping requests are rejected
//! - Panicking collections are contained per collection
//! - Service stops are raced against `service_stop_timeout_ms`

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use guardian_runtime::{
    CleanupLevel, ComponentRegistry, ConfigError, EventBus, GuardianEvent, MemoryProbe,
    PressureLevel, Reclaimer, ServiceError, SharedClock, SystemClock,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collection::{CollectionKind, ManagedCollection};
use crate::error::{MemoryError, Result, StrategyExecutionError};
use crate::sampler::PressureSample;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Configuration for [`CleanupManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Entries histories are trimmed to.
    pub history_cap: usize,
    /// Job-history entries kept by the moderate strategy.
    pub job_history_keep: usize,
    /// Collections larger than this are cleared by the aggressive strategy.
    pub aggressive_size_ceiling: usize,
    /// Registered components the emergency strategy may stop.
    pub non_essential_services: Vec<String>,
    /// Time allowed for one service to stop.
    pub service_stop_timeout_ms: u64,
    /// Collection passes run by the emergency strategy.
    pub emergency_collection_passes: u32,
    /// Pause between collection passes.
    pub collection_pause_ms: u64,
    /// Results kept in history.
    pub result_history_size: usize,
}

impl CleanupConfig {
    /// Creates a new config with default values.
    ///
    /// Defaults:
    /// - Histories trimmed to 100, job history pruned to 10
    /// - Aggressive size ceiling: 1000 entries
    /// - 5s per service stop
    /// - 3 emergency collection passes, 100ms apart
    #[must_use]
    pub const fn new() -> Self {
        Self {
            history_cap: 100,
            job_history_keep: 10,
            aggressive_size_ceiling: 1_000,
            non_essential_services: Vec::new(),
            service_stop_timeout_ms: 5_000,
            emergency_collection_passes: 3,
            collection_pause_ms: 100,
            result_history_size: 50,
        }
    }

    /// Sets the services the emergency strategy may stop.
    #[must_use]
    pub fn with_non_essential_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_essential_services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the history and job-history caps.
    #[must_use]
    pub fn with_caps(mut self, history_cap: usize, job_history_keep: usize) -> Self {
        self.history_cap = history_cap;
        self.job_history_keep = job_history_keep;
        self
    }

    /// Sets the aggressive size ceiling.
    #[must_use]
    pub fn with_size_ceiling(mut self, ceiling: usize) -> Self {
        self.aggressive_size_ceiling = ceiling;
        self
    }

    /// Sets the emergency collection passes and the pause between them.
    #[must_use]
    pub fn with_collection_passes(mut self, passes: u32, pause_ms: u64) -> Self {
        self.emergency_collection_passes = passes;
        self.collection_pause_ms = pause_ms;
        self
    }

    /// Checks the config.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.result_history_size == 0 {
            return Err(ConfigError::new("result_history_size", "must be positive"));
        }
        if self.aggressive_size_ceiling == 0 {
            return Err(ConfigError::new("aggressive_size_ceiling", "must be positive"));
        }
        if self.service_stop_timeout_ms == 0 {
            return Err(ConfigError::new("service_stop_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A built-in cleanup action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    /// Drop expired entries everywhere.
    EvictExpired,
    /// Trim histories to `history_cap`.
    TrimHistories,
    /// Halve caches, histories, transient and media collections.
    HalveCollections,
    /// Empty queues.
    DrainQueues,
    /// Trim job history to `job_history_keep`.
    PruneJobHistory,
    /// Clear collections above `aggressive_size_ceiling`.
    ClearOversized,
    /// Clear transient state.
    ResetTransient,
    /// Clear media collections.
    ClearMedia,
    /// Stop non-essential services.
    StopServices,
    /// Clear every cache.
    ClearCaches,
    /// Reset counters.
    ResetCounters,
    /// Run forced collection passes.
    ForceCollection,
}

const GENTLE: &[CleanupAction] = &[CleanupAction::EvictExpired, CleanupAction::TrimHistories];

const MODERATE: &[CleanupAction] = &[
    CleanupAction::EvictExpired,
    CleanupAction::TrimHistories,
    CleanupAction::HalveCollections,
    CleanupAction::DrainQueues,
    CleanupAction::PruneJobHistory,
];

// Oversized collections are measured before halving, so anything above the
// ceiling at the start of the run is cleared outright.
const AGGRESSIVE: &[CleanupAction] = &[
    CleanupAction::ClearOversized,
    CleanupAction::EvictExpired,
    CleanupAction::TrimHistories,
    CleanupAction::HalveCollections,
    CleanupAction::DrainQueues,
    CleanupAction::PruneJobHistory,
    CleanupAction::ResetTransient,
    CleanupAction::ClearMedia,
    CleanupAction::ForceCollection,
];

const EMERGENCY: &[CleanupAction] = &[
    CleanupAction::StopServices,
    CleanupAction::ClearOversized,
    CleanupAction::EvictExpired,
    CleanupAction::TrimHistories,
    CleanupAction::HalveCollections,
    CleanupAction::DrainQueues,
    CleanupAction::PruneJobHistory,
    CleanupAction::ResetTransient,
    CleanupAction::ClearMedia,
    CleanupAction::ClearCaches,
    CleanupAction::ResetCounters,
    CleanupAction::ForceCollection,
];

impl CleanupAction {
    /// Built-in actions run by `level`, in order.
    #[must_use]
    pub const fn for_level(level: CleanupLevel) -> &'static [CleanupAction] {
        match level {
            CleanupLevel::Gentle => GENTLE,
            CleanupLevel::Moderate => MODERATE,
            CleanupLevel::Aggressive => AGGRESSIVE,
            CleanupLevel::Emergency => EMERGENCY,
        }
    }

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EvictExpired => "evict_expired",
            Self::TrimHistories => "trim_histories",
            Self::HalveCollections => "halve_collections",
            Self::DrainQueues => "drain_queues",
            Self::PruneJobHistory => "prune_job_history",
            Self::ClearOversized => "clear_oversized",
            Self::ResetTransient => "reset_transient",
            Self::ClearMedia => "clear_media",
            Self::StopServices => "stop_services",
            Self::ClearCaches => "clear_caches",
            Self::ResetCounters => "reset_counters",
            Self::ForceCollection => "force_collection",
        }
    }
}

/// Outcome of one action within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Action name (built-in or registered).
    pub action: String,
    /// Entries removed, services stopped or passes run.
    pub affected: usize,
    /// False when the action failed in whole or in part.
    pub success: bool,
}

/// Record of one cleanup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// Run number, starting at 1.
    pub id: u64,
    /// Strategy that ran.
    pub level: CleanupLevel,
    /// Pressure level of the triggering sample, if any.
    pub trigger: Option<PressureLevel>,
    /// Start time (epoch ms).
    pub started_at_ms: u64,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Heap bytes before the run.
    pub heap_before: u64,
    /// Heap bytes after the run.
    pub heap_after: u64,
    /// `heap_before - heap_after` (negative if the heap grew).
    pub freed_bytes: i64,
    /// Collection entries removed.
    pub entries_removed: usize,
    /// Per-action outcomes, in run order.
    pub actions: Vec<ActionOutcome>,
    /// Failures, in run order.
    pub errors: Vec<StrategyExecutionError>,
    /// Services the run stopped.
    pub stopped_services: Vec<String>,
}

impl CleanupResult {
    /// Returns true when every action succeeded.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Actions that failed.
    #[must_use]
    pub fn failed_actions(&self) -> usize {
        self.actions.iter().filter(|a| !a.success).count()
    }
}

/// Aggregate cleanup counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Completed runs per level.
    pub runs: BTreeMap<CleanupLevel, u64>,
    /// Requests rejected because a run was in progress.
    pub rejected: u64,
    /// Actions that failed across all runs.
    pub failed_actions: u64,
    /// Collection entries removed across all runs.
    pub entries_removed: u64,
    /// Sum of `freed_bytes` across all runs.
    pub bytes_freed: i64,
    /// When the last run finished (epoch ms).
    pub last_run_ms: Option<u64>,
}

type ActionFn = Arc<dyn Fn() -> std::result::Result<usize, ServiceError> + Send + Sync>;

struct RegisteredCollection {
    name: String,
    kind: CollectionKind,
    collection: Arc<dyn ManagedCollection>,
}

struct CustomAction {
    name: String,
    min_level: CleanupLevel,
    run: ActionFn,
}

struct Inner {
    config: CleanupConfig,
    probe: Arc<dyn MemoryProbe>,
    clock: SharedClock,
    events: EventBus,
    registry: Option<ComponentRegistry>,
    reclaimer: Option<Reclaimer>,
    collections: Mutex<Vec<RegisteredCollection>>,
    custom: Mutex<Vec<CustomAction>>,
    history: Mutex<VecDeque<CleanupResult>>,
    stats: Mutex<CleanupStats>,
    in_progress: AtomicBool,
    next_id: AtomicU64,
}

/// Builder for [`CleanupManager`].
pub struct CleanupManagerBuilder {
    config: CleanupConfig,
    probe: Arc<dyn MemoryProbe>,
    events: EventBus,
    clock: Option<SharedClock>,
    registry: Option<ComponentRegistry>,
    reclaimer: Option<Reclaimer>,
}

impl CleanupManagerBuilder {
    /// Uses `clock` for timestamps.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Looks up non-essential services in `registry`.
    #[must_use]
    pub fn registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Runs collection passes through `reclaimer`.
    #[must_use]
    pub fn reclaimer(mut self, reclaimer: Reclaimer) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// Validates the config and builds the manager.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Config`] when the config is invalid.
    pub fn build(self) -> Result<CleanupManager> {
        self.config.validate()?;
        Ok(CleanupManager {
            inner: Arc::new(Inner {
                config: self.config,
                probe: self.probe,
                clock: self.clock.unwrap_or_else(SystemClock::shared),
                events: self.events,
                registry: self.registry,
                reclaimer: self.reclaimer,
                collections: Mutex::new(Vec::new()),
                custom: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                stats: Mutex::new(CleanupStats::default()),
                in_progress: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Clears an "in progress" latch on drop.
pub(crate) struct RunGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Escalating cleanup executor. Clones share state.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), guardian_memory::MemoryError> {
/// use std::collections::VecDeque;
/// use std::sync::{Arc, Mutex};
/// use guardian_memory::{CleanupConfig, CleanupManager, CollectionKind};
/// use guardian_runtime::{CleanupLevel, EventBus, ManualProbe};
///
/// let cleanup = CleanupManager::builder(
///     CleanupConfig::new(),
///     Arc::new(ManualProbe::default()),
///     EventBus::new(16),
/// )
/// .build()?;
///
/// let jobs: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new((0..8).collect()));
/// cleanup.register_collection("pending-jobs", CollectionKind::Queue, jobs.clone());
///
/// let result = cleanup.execute_cleanup(CleanupLevel::Moderate, None).await?;
/// assert_eq!(result.entries_removed, 8);
/// assert!(jobs.lock().unwrap().is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CleanupManager {
    inner: Arc<Inner>,
}

impl CleanupManager {
    /// Starts building a manager measuring heap through `probe`.
    pub fn builder(
        config: CleanupConfig,
        probe: Arc<dyn MemoryProbe>,
        events: EventBus,
    ) -> CleanupManagerBuilder {
        CleanupManagerBuilder {
            config,
            probe,
            events,
            clock: None,
            registry: None,
            reclaimer: None,
        }
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CleanupConfig {
        &self.inner.config
    }

    /// Registers a collection, replacing any previous one with the same name.
    pub fn register_collection(
        &self,
        name: impl Into<String>,
        kind: CollectionKind,
        collection: Arc<dyn ManagedCollection>,
    ) {
        let name = name.into();
        let mut collections = lock(&self.inner.collections);
        collections.retain(|c| c.name != name);
        debug!(collection = %name, %kind, "collection registered");
        collections.push(RegisteredCollection {
            name,
            kind,
            collection,
        });
    }

    /// Removes a collection. Returns true if it was registered.
    pub fn unregister_collection(&self, name: &str) -> bool {
        let mut collections = lock(&self.inner.collections);
        let before = collections.len();
        collections.retain(|c| c.name != name);
        collections.len() != before
    }

    /// Number of registered collections.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        lock(&self.inner.collections).len()
    }

    /// Live entries across every registered collection.
    #[must_use]
    pub fn live_entries(&self) -> usize {
        self.collections().iter().map(|(_, _, c)| c.len()).sum()
    }

    /// Live entries per collection.
    #[must_use]
    pub fn collection_sizes(&self) -> BTreeMap<String, usize> {
        self.collections()
            .into_iter()
            .map(|(name, _, c)| (name, c.len()))
            .collect()
    }

    /// Registers a host action run by `min_level` and every stronger level,
    /// after the built-in actions. It returns how many entries it removed.
    pub fn register_action(
        &self,
        name: impl Into<String>,
        min_level: CleanupLevel,
        action: impl Fn() -> std::result::Result<usize, ServiceError> + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!(action = %name, %min_level, "cleanup action registered");
        lock(&self.inner.custom).push(CustomAction {
            name,
            min_level,
            run: Arc::new(action),
        });
    }

    fn collections(&self) -> Vec<(String, CollectionKind, Arc<dyn ManagedCollection>)> {
        lock(&self.inner.collections)
            .iter()
            .map(|c| (c.name.clone(), c.kind, Arc::clone(&c.collection)))
            .collect()
    }

    /// Returns true while a run is in progress.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// Runs the `level` strategy.
    ///
    /// # Errors
    ///
    /// [`MemoryError::CleanupInProgress`] if another run has not finished.
    /// Action failures are reported in the result, not as errors.
    pub async fn execute_cleanup(
        &self,
        level: CleanupLevel,
        sample: Option<&PressureSample>,
    ) -> Result<CleanupResult> {
        if self
            .inner
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            lock(&self.inner.stats).rejected += 1;
            debug!(%level, "cleanup rejected, another run in progress");
            self.inner.events.emit(GuardianEvent::CleanupFailed {
                level,
                error: "cleanup already in progress".into(),
            });
            return Err(MemoryError::CleanupInProgress { requested: level });
        }
        let _guard = RunGuard(&self.inner.in_progress);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let started_at_ms = self.inner.clock.now_ms();
        let started = Instant::now();
        let heap_before = self.inner.probe.read().heap_used;
        info!(id, %level, trigger = ?sample.map(|s| s.level), heap_before, "cleanup started");

        let mut run = Run::new(level);
        for &action in CleanupAction::for_level(level) {
            self.run_action(action, &mut run).await;
        }
        self.run_custom(&mut run);

        let heap_after = self.inner.probe.read().heap_used;
        let result = CleanupResult {
            id,
            level,
            trigger: sample.map(|s| s.level),
            started_at_ms,
            duration_ms: started.elapsed().as_millis() as u64,
            heap_before,
            heap_after,
            freed_bytes: heap_before as i64 - heap_after as i64,
            entries_removed: run.entries_removed,
            actions: run.actions,
            errors: run.errors,
            stopped_services: run.stopped_services,
        };
        self.finish(&result);
        Ok(result)
    }

    fn finish(&self, result: &CleanupResult) {
        let failed = result.failed_actions();
        {
            let mut stats = lock(&self.inner.stats);
            *stats.runs.entry(result.level).or_insert(0) += 1;
            stats.failed_actions += failed as u64;
            stats.entries_removed += result.entries_removed as u64;
            stats.bytes_freed += result.freed_bytes;
            stats.last_run_ms = Some(self.inner.clock.now_ms());
        }
        {
            let mut history = lock(&self.inner.history);
            while history.len() >= self.inner.config.result_history_size {
                history.pop_front();
            }
            history.push_back(result.clone());
        }

        if !result.actions.is_empty() && failed == result.actions.len() {
            warn!(id = result.id, level = %result.level, "every cleanup action failed");
            self.inner.events.emit(GuardianEvent::CleanupFailed {
                level: result.level,
                error: result
                    .errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            });
            return;
        }
        if failed > 0 {
            warn!(id = result.id, level = %result.level, failed, "cleanup finished with failures");
        }
        info!(
            id = result.id,
            level = %result.level,
            freed_bytes = result.freed_bytes,
            entries_removed = result.entries_removed,
            duration_ms = result.duration_ms,
            "cleanup completed"
        );
        self.inner.events.emit(GuardianEvent::CleanupCompleted {
            level: result.level,
            actions: result.actions.len(),
            failed,
            freed_bytes: result.freed_bytes,
            duration_ms: result.duration_ms,
        });
    }

    async fn run_action(&self, action: CleanupAction, run: &mut Run) {
        let config = &self.inner.config;
        match action {
            CleanupAction::EvictExpired => {
                self.each_collection(action, run, |_| true, |c| c.evict_expired());
            }
            CleanupAction::TrimHistories => {
                let cap = config.history_cap;
                self.each_collection(action, run, |k| k == CollectionKind::History, |c| c.truncate(cap));
            }
            CleanupAction::HalveCollections => {
                self.each_collection(
                    action,
                    run,
                    |k| {
                        matches!(
                            k,
                            CollectionKind::Cache
                                | CollectionKind::History
                                | CollectionKind::Transient
                                | CollectionKind::Media
                        )
                    },
                    |c| c.truncate(c.len() / 2),
                );
            }
            CleanupAction::DrainQueues => {
                self.each_collection(action, run, |k| k == CollectionKind::Queue, |c| c.clear());
            }
            CleanupAction::PruneJobHistory => {
                let keep = config.job_history_keep;
                self.each_collection(action, run, |k| k == CollectionKind::JobHistory, |c| c.truncate(keep));
            }
            CleanupAction::ClearOversized => {
                let ceiling = config.aggressive_size_ceiling;
                self.each_collection(
                    action,
                    run,
                    |k| k != CollectionKind::Counter,
                    |c| if c.len() > ceiling { c.clear() } else { 0 },
                );
            }
            CleanupAction::ResetTransient => {
                self.each_collection(action, run, |k| k == CollectionKind::Transient, |c| c.clear());
            }
            CleanupAction::ClearMedia => {
                self.each_collection(action, run, |k| k == CollectionKind::Media, |c| c.clear());
            }
            CleanupAction::ClearCaches => {
                self.each_collection(action, run, |k| k == CollectionKind::Cache, |c| c.clear());
            }
            CleanupAction::ResetCounters => {
                self.each_collection(action, run, |k| k == CollectionKind::Counter, |c| c.clear());
            }
            CleanupAction::StopServices => self.stop_services(run).await,
            CleanupAction::ForceCollection => self.force_collection(run).await,
        }
    }

    fn each_collection(
        &self,
        action: CleanupAction,
        run: &mut Run,
        applies: impl Fn(CollectionKind) -> bool,
        apply: impl Fn(&dyn ManagedCollection) -> usize,
    ) {
        let mut affected = 0;
        let mut success = true;
        for (name, kind, collection) in self.collections() {
            if !applies(kind) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| apply(collection.as_ref()))) {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(collection = %name, action = action.as_str(), removed, "collection shrunk");
                    }
                    affected += removed;
                }
                Err(_) => {
                    success = false;
                    warn!(collection = %name, action = action.as_str(), "collection panicked during cleanup");
                    run.errors.push(StrategyExecutionError::new(
                        run.level,
                        action.as_str(),
                        format!("collection '{name}' panicked"),
                    ));
                }
            }
        }
        run.entries_removed += affected;
        run.actions.push(ActionOutcome {
            action: action.as_str().to_string(),
            affected,
            success,
        });
    }

    async fn stop_services(&self, run: &mut Run) {
        let action = CleanupAction::StopServices.as_str();
        let timeout = Duration::from_millis(self.inner.config.service_stop_timeout_ms);
        let mut success = true;

        match &self.inner.registry {
            Some(registry) => {
                for name in &self.inner.config.non_essential_services {
                    let component = match registry.get(name) {
                        Ok(component) if component.capabilities().lifecycle => component,
                        Ok(_) => {
                            debug!(component = %name, "non-essential component has no lifecycle");
                            continue;
                        }
                        Err(_) => continue,
                    };
                    match tokio::time::timeout(timeout, component.stop()).await {
                        Ok(Ok(())) => {
                            info!(component = %name, "non-essential service stopped");
                            self.inner.events.emit(GuardianEvent::ComponentStopped { name: name.clone() });
                            run.stopped_services.push(name.clone());
                        }
                        Ok(Err(err)) => {
                            success = false;
                            warn!(component = %name, error = %err, "service failed to stop");
                            run.errors.push(StrategyExecutionError::new(run.level, action, format!("{name}: {err}")));
                        }
                        Err(_) => {
                            success = false;
                            warn!(component = %name, "service stop timed out");
                            run.errors.push(StrategyExecutionError::new(
                                run.level,
                                action,
                                format!("{name}: {}", ServiceError::Timeout(timeout.as_millis() as u64)),
                            ));
                        }
                    }
                }
            }
            None if !self.inner.config.non_essential_services.is_empty() => {
                debug!("no component registry; non-essential services left running");
            }
            None => {}
        }

        run.actions.push(ActionOutcome {
            action: action.to_string(),
            affected: run.stopped_services.len(),
            success,
        });
    }

    async fn force_collection(&self, run: &mut Run) {
        let passes = if run.level == CleanupLevel::Emergency {
            self.inner.config.emergency_collection_passes
        } else {
            1
        };
        let mut ran = 0;
        if let Some(reclaimer) = &self.inner.reclaimer {
            let pause = Duration::from_millis(self.inner.config.collection_pause_ms);
            for pass in 0..passes {
                if pass > 0 && !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                let record = reclaimer.force_collect();
                debug!(pass, efficiency = record.efficiency(), "cleanup collection pass");
                ran += 1;
            }
        }
        run.actions.push(ActionOutcome {
            action: CleanupAction::ForceCollection.as_str().to_string(),
            affected: ran,
            success: true,
        });
    }

    fn run_custom(&self, run: &mut Run) {
        let actions: Vec<(String, ActionFn)> = lock(&self.inner.custom)
            .iter()
            .filter(|a| a.min_level <= run.level)
            .map(|a| (a.name.clone(), Arc::clone(&a.run)))
            .collect();

        for (name, action) in actions {
            let outcome = catch_unwind(AssertUnwindSafe(|| action()));
            let (affected, error) = match outcome {
                Ok(Ok(removed)) => (removed, None),
                Ok(Err(err)) => (0, Some(err.to_string())),
                Err(_) => (0, Some("action panicked".to_string())),
            };
            if let Some(message) = &error {
                warn!(action = %name, error = %message, "cleanup action failed");
                run.errors.push(StrategyExecutionError::new(run.level, name.clone(), message.clone()));
            }
            run.entries_removed += affected;
            run.actions.push(ActionOutcome {
                action: name,
                affected,
                success: error.is_none(),
            });
        }
    }

    /// Recent results, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<CleanupResult> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Most recent result.
    #[must_use]
    pub fn last_result(&self) -> Option<CleanupResult> {
        lock(&self.inner.history).back().cloned()
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> CleanupStats {
        lock(&self.inner.stats).clone()
    }
}

impl fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupManager")
            .field("config", &self.inner.config)
            .field("collections", &self.collection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

struct Run {
    level: CleanupLevel,
    actions: Vec<ActionOutcome>,
    errors: Vec<StrategyExecutionError>,
    entries_removed: usize,
    stopped_services: Vec<String>,
}

impl Run {
    fn new(level: CleanupLevel) -> Self {
        Self {
            level,
            actions: Vec::new(),
            errors: Vec::new(),
            entries_removed: 0,
            stopped_services: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_runtime::{drain_events, ManualClock, ManualProbe, RawMemoryStats};
    use std::collections::VecDeque;

    fn manager(config: CleanupConfig) -> (CleanupManager, EventBus) {
        let bus = EventBus::new(64);
        let manager = CleanupManager::builder(config, Arc::new(ManualProbe::default()), bus.clone())
            .clock(ManualClock::new(0).shared())
            .build()
            .unwrap();
        (manager, bus)
    }

    fn deque(n: usize) -> Arc<Mutex<VecDeque<usize>>> {
        Arc::new(Mutex::new((0..n).collect()))
    }

    struct Exploding;

    impl ManagedCollection for Exploding {
        fn len(&self) -> usize {
            5
        }

        fn truncate(&self, _keep: usize) -> usize {
            panic!("collection poisoned")
        }
    }

    #[test]
    fn test_strategies_escalate() {
        for pair in CleanupLevel::ALL.windows(2) {
            let weaker = CleanupAction::for_level(pair[0]);
            let stronger = CleanupAction::for_level(pair[1]);
            assert!(weaker.iter().all(|a| stronger.contains(a)), "{:?}", pair);
        }
    }

    #[tokio::test]
    async fn test_gentle_trims_histories() {
        let (cleanup, _bus) = manager(CleanupConfig::new().with_caps(10, 5));
        let history = deque(25);
        let cache = deque(25);
        cleanup.register_collection("history", CollectionKind::History, history.clone());
        cleanup.register_collection("cache", CollectionKind::Cache, cache.clone());

        let result = cleanup.execute_cleanup(CleanupLevel::Gentle, None).await.unwrap();
        assert_eq!(history.lock().unwrap().len(), 10);
        assert_eq!(cache.lock().unwrap().len(), 25);
        assert_eq!(result.entries_removed, 15);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_moderate_halves_and_drains() {
        let (cleanup, _bus) = manager(CleanupConfig::new().with_caps(100, 3));
        let cache = deque(40);
        let queue = deque(7);
        let jobs = deque(20);
        cleanup.register_collection("cache", CollectionKind::Cache, cache.clone());
        cleanup.register_collection("queue", CollectionKind::Queue, queue.clone());
        cleanup.register_collection("jobs", CollectionKind::JobHistory, jobs.clone());

        cleanup.execute_cleanup(CleanupLevel::Moderate, None).await.unwrap();
        assert_eq!(cache.lock().unwrap().len(), 20);
        assert!(queue.lock().unwrap().is_empty());
        assert_eq!(jobs.lock().unwrap().len(), 3);
        // Newest entries survive.
        assert_eq!(cache.lock().unwrap().front(), Some(&20));
    }

    #[tokio::test]
    async fn test_aggressive_clears_oversized_and_transient() {
        let (cleanup, _bus) = manager(CleanupConfig::new());
        let big = deque(1500);
        let small = deque(50);
        let scratch = deque(3);
        cleanup.register_collection("big", CollectionKind::Cache, big.clone());
        cleanup.register_collection("small", CollectionKind::Cache, small.clone());
        cleanup.register_collection("scratch", CollectionKind::Transient, scratch.clone());

        cleanup.execute_cleanup(CleanupLevel::Aggressive, None).await.unwrap();
        // Between the ceiling and twice the ceiling: halving alone would leave 750.
        assert!(big.lock().unwrap().is_empty());
        assert_eq!(small.lock().unwrap().len(), 25);
        assert!(scratch.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_clears_oversized_history() {
        let (cleanup, _bus) = manager(CleanupConfig::new().with_caps(5_000, 5));
        let history = deque(1200);
        cleanup.register_collection("history", CollectionKind::History, history.clone());

        cleanup.execute_cleanup(CleanupLevel::Emergency, None).await.unwrap();
        assert!(history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_resets_counters_and_caches() {
        let (cleanup, _bus) = manager(CleanupConfig::new());
        let cache = deque(10);
        let counters = deque(4);
        cleanup.register_collection("cache", CollectionKind::Cache, cache.clone());
        cleanup.register_collection("counters", CollectionKind::Counter, counters.clone());

        let result = cleanup.execute_cleanup(CleanupLevel::Emergency, None).await.unwrap();
        assert!(cache.lock().unwrap().is_empty());
        assert!(counters.lock().unwrap().is_empty());
        assert_eq!(result.actions.len(), CleanupAction::for_level(CleanupLevel::Emergency).len());
    }

    #[tokio::test]
    async fn test_custom_action_runs_at_and_above_level() {
        let (cleanup, _bus) = manager(CleanupConfig::new());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        cleanup.register_action("drop_sessions", CleanupLevel::Moderate, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        });

        cleanup.execute_cleanup(CleanupLevel::Gentle, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let result = cleanup.execute_cleanup(CleanupLevel::Aggressive, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.entries_removed, 2);
    }

    #[tokio::test]
    async fn test_force_collection_through_reclaimer() {
        let probe = ManualProbe::new(RawMemoryStats {
            heap_used: 1_000,
            ..RawMemoryStats::default()
        });
        let clock = ManualClock::new(0);
        let reclaimer = Reclaimer::new(Arc::new(probe.clone()), clock.shared());
        let hook_probe = probe.clone();
        reclaimer.register("arena", move || {
            hook_probe.update(|s| s.heap_used = s.heap_used.saturating_sub(100));
            100
        });
        let cleanup = CleanupManager::builder(
            CleanupConfig::new().with_collection_passes(3, 0),
            Arc::new(probe),
            EventBus::new(8),
        )
        .clock(clock.shared())
        .reclaimer(reclaimer.clone())
        .build()
        .unwrap();

        let result = cleanup.execute_cleanup(CleanupLevel::Emergency, None).await.unwrap();
        assert_eq!(reclaimer.stats().passes, 3);
        assert_eq!(result.freed_bytes, 300);
    }

    #[tokio::test]
    async fn test_history_and_stats() {
        let mut config = CleanupConfig::new();
        config.result_history_size = 2;
        let (cleanup, _bus) = manager(config);
        for level in [CleanupLevel::Gentle, CleanupLevel::Gentle, CleanupLevel::Moderate] {
            cleanup.execute_cleanup(level, None).await.unwrap();
        }
        let history = cleanup.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].id, 3);
        let stats = cleanup.stats();
        assert_eq!(stats.runs.get(&CleanupLevel::Gentle), Some(&2));
        assert_eq!(stats.runs.get(&CleanupLevel::Moderate), Some(&1));
    }

    // Security-focused tests

    #[tokio::test]
    async fn test_panicking_collection_does_not_abort_run() {
        let (cleanup, bus) = manager(CleanupConfig::new());
        let mut rx = bus.subscribe();
        let queue = deque(5);
        cleanup.register_collection("bad", CollectionKind::History, Arc::new(Exploding));
        cleanup.register_collection("queue", CollectionKind::Queue, queue.clone());

        let result = cleanup.execute_cleanup(CleanupLevel::Moderate, None).await.unwrap();
        assert!(!result.is_success());
        assert!(queue.lock().unwrap().is_empty());
        assert!(result.errors.iter().all(|e| e.level == CleanupLevel::Moderate));

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| e.name() == "memory:cleanup-completed"));
    }

    #[tokio::test]
    async fn test_failing_custom_action_recorded() {
        let (cleanup, _bus) = manager(CleanupConfig::new());
        cleanup.register_action("flaky", CleanupLevel::Gentle, || {
            Err(ServiceError::failed("backend unavailable"))
        });
        let result = cleanup.execute_cleanup(CleanupLevel::Gentle, None).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].action, "flaky");
        assert_eq!(cleanup.stats().failed_actions, 1);
    }

    #[tokio::test]
    async fn test_reentrant_cleanup_rejected() {
        let (cleanup, bus) = manager(CleanupConfig::new());
        let mut rx = bus.subscribe();
        cleanup.inner.in_progress.store(true, Ordering::SeqCst);

        let err = cleanup.execute_cleanup(CleanupLevel::Gentle, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::CleanupInProgress { .. }));
        assert_eq!(cleanup.stats().rejected, 1);
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| e.name() == "memory:cleanup-failed"));

        cleanup.inner.in_progress.store(false, Ordering::SeqCst);
        assert!(cleanup.execute_cleanup(CleanupLevel::Gentle, None).await.is_ok());
        assert!(!cleanup.is_running());
    }
}
