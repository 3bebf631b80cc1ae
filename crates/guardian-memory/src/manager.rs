//! # Memory Manager
//!
//! Drives the sampler, turns its outcomes into cleanup runs, and protects
//! the process when the heap stays pinned at the absolute ceiling.
//!
//! ## Level Mapping
//!
//! | Sampler outcome | Cleanup |
//! |-----------------|---------|
//! | warning alert | gentle |
//! | critical alert | moderate |
//! | emergency alert | aggressive |
//! | leak report | aggressive |
//! | emergency action needed | emergency |
//!
//! The strongest applicable level runs once per tick.
//!
//! ## Shutdown Protection
//!
//! ```text
//!  heap ≥ absolute_ceiling on an emergency sample
//!        │
//!        ▼
//!  attempts < max? ──no──► escalate to the shutdown engine (once per window)
//!        │ yes
//!        ▼
//!  aggressive cleanup ─► wait recheck_delay ─► still ≥ ceiling?
//!                                                 │ yes
//!                                                 ▼
//!                  stop non-critical components, queue them, force collections
//!                                                 │
//!                                                 ▼
//!                     restart supervision: poll until ≤ warning, restart in
//!                     registration order
//! ```
//!
//! The attempt counter resets once `protection_cooldown_ms` has passed
//! since the last attempt.
//!
//! ## Security Notes
//!
//! - Components on the critical allow-list are never stopped
//! - Protection runs are serialised by an "in progress" latch
//! - Restart failures are logged and never block the remaining restarts

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use guardian_runtime::{
    CleanupLevel, ComponentRegistry, ConfigError, EventBus, GuardianEvent, MemoryProbe,
    PeriodicTask, PressureLevel, Reclaimer, SharedClock, SystemClock,
};
use guardian_shutdown::ShutdownEngine;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupConfig, CleanupManager, CleanupResult, RunGuard};
use crate::error::Result;
use crate::sampler::{MemorySampler, PressureSample, SampleOutcome, SamplerConfig};

/// Shutdown reason used when protection attempts are exhausted.
pub const REASON_MEMORY_CEILING: &str = "memory_ceiling_exceeded";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Configuration for [`MemoryManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagerConfig {
    /// Heap fraction that triggers shutdown protection.
    pub absolute_ceiling: f64,
    /// Protection attempts allowed within one cooldown window.
    pub max_protection_attempts: u32,
    /// Attempts reset once this long has passed since the last one.
    pub protection_cooldown_ms: u64,
    /// Wait after the last aggressive cleanup before re-checking.
    pub recheck_delay_ms: u64,
    /// Components never stopped by protection.
    pub critical_components: Vec<String>,
    /// Time allowed for one component to stop or start.
    pub component_timeout_ms: u64,
    /// Restart supervision poll period.
    pub restart_poll_interval_ms: u64,
    /// Collection passes forced after stopping components.
    pub protection_collection_passes: u32,
    /// Pause between those passes.
    pub collection_pause_ms: u64,
    /// Allow protection to stop components and escalate.
    pub enable_emergency_shutdown: bool,
    /// Sampler settings.
    pub sampler: SamplerConfig,
    /// Cleanup settings.
    pub cleanup: CleanupConfig,
}

impl MemoryManagerConfig {
    /// Creates a new config with default values.
    ///
    /// Defaults:
    /// - Absolute ceiling: 0.98
    /// - 3 protection attempts per 10 minutes
    /// - 5s re-check delay, 10s restart poll
    /// - 3 collection passes 500ms apart
    #[must_use]
    pub const fn new() -> Self {
        Self {
            absolute_ceiling: 0.98,
            max_protection_attempts: 3,
            protection_cooldown_ms: 600_000,
            recheck_delay_ms: 5_000,
            critical_components: Vec::new(),
            component_timeout_ms: 5_000,
            restart_poll_interval_ms: 10_000,
            protection_collection_passes: 3,
            collection_pause_ms: 500,
            enable_emergency_shutdown: true,
            sampler: SamplerConfig::new(),
            cleanup: CleanupConfig::new(),
        }
    }

    /// Sets the components protection must never stop.
    #[must_use]
    pub fn with_critical_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the ceiling and the protection budget.
    #[must_use]
    pub fn with_protection(mut self, ceiling: f64, max_attempts: u32, cooldown_ms: u64) -> Self {
        self.absolute_ceiling = ceiling;
        self.max_protection_attempts = max_attempts;
        self.protection_cooldown_ms = cooldown_ms;
        self
    }

    /// Sets the re-check delay and restart poll period.
    #[must_use]
    pub fn with_timings(mut self, recheck_delay_ms: u64, restart_poll_interval_ms: u64) -> Self {
        self.recheck_delay_ms = recheck_delay_ms;
        self.restart_poll_interval_ms = restart_poll_interval_ms;
        self
    }

    /// Sets the sampler config.
    #[must_use]
    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    /// Sets the cleanup config.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Checks this config and both sub-configs.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.sampler.validate()?;
        self.cleanup.validate()?;
        if self.absolute_ceiling <= self.sampler.emergency_threshold || self.absolute_ceiling > 1.0 {
            return Err(ConfigError::new(
                "absolute_ceiling",
                "must exceed the emergency threshold and be at most 1",
            ));
        }
        if self.restart_poll_interval_ms == 0 {
            return Err(ConfigError::new("restart_poll_interval_ms", "must be positive"));
        }
        if self.component_timeout_ms == 0 {
            return Err(ConfigError::new("component_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cleanup level warranted by a sampler outcome, if any.
#[must_use]
pub fn cleanup_level_for(outcome: &SampleOutcome) -> Option<CleanupLevel> {
    let from_alert = outcome.alert.and_then(|level| match level {
        PressureLevel::Normal => None,
        PressureLevel::Warning => Some(CleanupLevel::Gentle),
        PressureLevel::Critical => Some(CleanupLevel::Moderate),
        PressureLevel::Emergency => Some(CleanupLevel::Aggressive),
    });
    let from_leak = outcome.leak.as_ref().map(|_| CleanupLevel::Aggressive);
    let from_conditions = outcome.emergency_action.then_some(CleanupLevel::Emergency);
    [from_alert, from_leak, from_conditions].into_iter().flatten().max()
}

/// What a protection run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProtectionOutcome {
    /// Protection is disabled by config.
    Disabled,
    /// Another protection run is in progress.
    InProgress,
    /// The last aggressive cleanup brought the heap below the ceiling.
    Averted {
        /// Heap fraction at the re-check
        heap_percent: f64,
    },
    /// Non-critical components were stopped and queued for restart.
    ComponentsStopped {
        /// Components stopped
        stopped: Vec<String>,
        /// Heap fraction at the re-check
        heap_percent: f64,
    },
    /// Attempts ran out; a coordinated shutdown was initiated.
    Escalated {
        /// Attempts made in the window
        attempts: u32,
        /// Whether the shutdown sequence completed without error
        completed: bool,
    },
    /// Attempts ran out and escalation already happened (or had nowhere to go).
    Exhausted {
        /// Attempts made in the window
        attempts: u32,
    },
}

/// What one manager tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerTick {
    /// Level of the sample.
    pub level: PressureLevel,
    /// Cleanup run, if one was warranted and not rejected.
    pub cleanup: Option<CleanupResult>,
    /// Emergency mode was entered on this tick.
    pub entered_emergency: bool,
    /// Emergency mode was left on this tick.
    pub exited_emergency: bool,
    /// Shutdown protection, if the ceiling was reached.
    pub protection: Option<ProtectionOutcome>,
}

/// Manager counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Ticks run.
    pub ticks: u64,
    /// Cleanup runs per level.
    pub cleanups: BTreeMap<CleanupLevel, u64>,
    /// Times emergency mode was entered.
    pub emergency_entries: u64,
    /// Protection attempts started.
    pub protections: u64,
    /// Protection attempts that ended below the ceiling.
    pub averted: u64,
    /// Components stopped under pressure.
    pub components_stopped: u64,
    /// Components restarted.
    pub components_restarted: u64,
    /// Restarts that failed.
    pub restart_failures: u64,
    /// Shutdowns initiated.
    pub escalations: u64,
}

/// Point-in-time manager state.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStatus {
    /// Periodic ticking is active.
    pub enabled: bool,
    /// Emergency mode latch.
    pub emergency_mode: bool,
    /// Protection attempts in the current window.
    pub protection_attempts: u32,
    /// Components waiting for restart.
    pub restart_queue: Vec<String>,
    /// Most recent sample.
    pub latest_sample: Option<PressureSample>,
    /// Counters.
    pub stats: ManagerStats,
}

#[derive(Default)]
struct ManagerState {
    emergency_mode: bool,
    protection_attempts: u32,
    last_protection_ms: Option<u64>,
    escalated: bool,
    restart_queue: Vec<String>,
    stats: ManagerStats,
}

struct Inner {
    config: MemoryManagerConfig,
    sampler: MemorySampler,
    cleanup: CleanupManager,
    registry: ComponentRegistry,
    reclaimer: Option<Reclaimer>,
    engine: Option<ShutdownEngine>,
    events: EventBus,
    clock: SharedClock,
    state: Mutex<ManagerState>,
    task: Mutex<Option<PeriodicTask>>,
    restart_task: Mutex<Option<JoinHandle<()>>>,
    enabled: AtomicBool,
    protecting: AtomicBool,
}

/// Builder for [`MemoryManager`].
pub struct MemoryManagerBuilder {
    config: MemoryManagerConfig,
    probe: Arc<dyn MemoryProbe>,
    events: EventBus,
    clock: Option<SharedClock>,
    registry: Option<ComponentRegistry>,
    reclaimer: Option<Reclaimer>,
    engine: Option<ShutdownEngine>,
}

impl MemoryManagerBuilder {
    /// Uses `clock` for timestamps, cooldowns and protection windows.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Component registry shared with the host. A private one is created
    /// otherwise.
    #[must_use]
    pub fn registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Reclaimer used for collection passes and efficiency figures.
    #[must_use]
    pub fn reclaimer(mut self, reclaimer: Reclaimer) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// Shutdown engine to escalate to when protection is exhausted.
    #[must_use]
    pub fn shutdown_engine(mut self, engine: ShutdownEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Validates the config and builds the manager with its sampler and
    /// cleanup manager.
    ///
    /// # Errors
    ///
    /// [`crate::MemoryError::Config`] when any config is invalid.
    pub fn build(self) -> Result<MemoryManager> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let registry = self.registry.unwrap_or_default();

        let mut sampler = MemorySampler::builder(
            self.config.sampler.clone(),
            Arc::clone(&self.probe),
            self.events.clone(),
        )
        .clock(Arc::clone(&clock))
        .registry(registry.clone());
        let mut cleanup = CleanupManager::builder(
            self.config.cleanup.clone(),
            Arc::clone(&self.probe),
            self.events.clone(),
        )
        .clock(Arc::clone(&clock))
        .registry(registry.clone());
        if let Some(reclaimer) = &self.reclaimer {
            sampler = sampler.reclaimer(reclaimer.clone());
            cleanup = cleanup.reclaimer(reclaimer.clone());
        }

        Ok(MemoryManager {
            inner: Arc::new(Inner {
                sampler: sampler.build()?,
                cleanup: cleanup.build()?,
                config: self.config,
                registry,
                reclaimer: self.reclaimer,
                engine: self.engine,
                events: self.events,
                clock,
                state: Mutex::new(ManagerState::default()),
                task: Mutex::new(None),
                restart_task: Mutex::new(None),
                enabled: AtomicBool::new(false),
                protecting: AtomicBool::new(false),
            }),
        })
    }
}

/// Memory manager. Clones share state.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), guardian_memory::MemoryError> {
/// use std::sync::Arc;
/// use guardian_memory::{MemoryManager, MemoryManagerConfig};
/// use guardian_runtime::{CleanupLevel, EventBus, ManualProbe, RawMemoryStats};
///
/// let probe = ManualProbe::new(RawMemoryStats {
///     heap_used: 90,
///     heap_limit: 100,
///     ..RawMemoryStats::default()
/// });
/// let manager = MemoryManager::builder(MemoryManagerConfig::new(), Arc::new(probe), EventBus::new(64))
///     .build()?;
///
/// let tick = manager.tick().await;
/// assert_eq!(tick.cleanup.map(|r| r.level), Some(CleanupLevel::Moderate));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl MemoryManager {
    /// Starts building a manager reading `probe`.
    pub fn builder(
        config: MemoryManagerConfig,
        probe: Arc<dyn MemoryProbe>,
        events: EventBus,
    ) -> MemoryManagerBuilder {
        MemoryManagerBuilder {
            config,
            probe,
            events,
            clock: None,
            registry: None,
            reclaimer: None,
            engine: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        lock(&self.inner.state)
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &MemoryManagerConfig {
        &self.inner.config
    }

    /// The sampler driven by this manager.
    #[inline]
    #[must_use]
    pub fn sampler(&self) -> &MemorySampler {
        &self.inner.sampler
    }

    /// The cleanup manager collections register with.
    #[inline]
    #[must_use]
    pub fn cleanup(&self) -> &CleanupManager {
        &self.inner.cleanup
    }

    /// The component registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.inner.registry
    }

    /// Samples once and reacts: cleanup, emergency latch, protection.
    pub async fn tick(&self) -> ManagerTick {
        let outcome = self.inner.sampler.take_sample();
        let level = outcome.sample.level;

        let (entered_emergency, exited_emergency) = {
            let mut state = self.state();
            state.stats.ticks += 1;
            match level {
                PressureLevel::Emergency if !state.emergency_mode => {
                    state.emergency_mode = true;
                    state.stats.emergency_entries += 1;
                    (true, false)
                }
                PressureLevel::Normal if state.emergency_mode => {
                    state.emergency_mode = false;
                    (false, true)
                }
                _ => (false, false),
            }
        };
        if entered_emergency {
            error!(heap_percent = outcome.sample.heap_percent, "memory emergency mode entered");
        }
        if exited_emergency {
            info!(heap_percent = outcome.sample.heap_percent, "memory emergency mode exited");
        }

        let mut cleanup = None;
        if let Some(cleanup_level) = cleanup_level_for(&outcome) {
            match self
                .inner
                .cleanup
                .execute_cleanup(cleanup_level, Some(&outcome.sample))
                .await
            {
                Ok(result) => {
                    self.note_cleanup(&result);
                    cleanup = Some(result);
                }
                Err(err) => debug!(error = %err, "cleanup skipped"),
            }
        }

        let mut protection = None;
        if level == PressureLevel::Emergency && self.inner.config.enable_emergency_shutdown {
            let heap_percent = self.inner.sampler.read_raw().heap_percent();
            if heap_percent >= self.inner.config.absolute_ceiling {
                protection = Some(self.shutdown_protection().await);
            }
        }

        ManagerTick {
            level,
            cleanup,
            entered_emergency,
            exited_emergency,
            protection,
        }
    }

    fn note_cleanup(&self, result: &CleanupResult) {
        let queued = {
            let mut state = self.state();
            *state.stats.cleanups.entry(result.level).or_insert(0) += 1;
            state.stats.components_stopped += result.stopped_services.len() as u64;
            for name in &result.stopped_services {
                if !state.restart_queue.contains(name) {
                    state.restart_queue.push(name.clone());
                }
            }
            !state.restart_queue.is_empty()
        };
        if queued && !result.stopped_services.is_empty() {
            self.spawn_restart_supervision();
        }
    }

    /// Runs the emergency cleanup strategy directly. Stopped services are
    /// queued for restart.
    ///
    /// # Errors
    ///
    /// [`crate::MemoryError::CleanupInProgress`] if a cleanup is running.
    pub async fn emergency_cleanup(&self) -> Result<CleanupResult> {
        let sample = self.inner.sampler.latest_sample();
        let result = self
            .inner
            .cleanup
            .execute_cleanup(CleanupLevel::Emergency, sample.as_ref())
            .await?;
        self.note_cleanup(&result);
        Ok(result)
    }

    /// Protects the process from a heap pinned at the absolute ceiling.
    ///
    /// Called by [`tick`](Self::tick) on emergency samples at or above the
    /// ceiling.
    pub async fn shutdown_protection(&self) -> ProtectionOutcome {
        let config = &self.inner.config;
        if !config.enable_emergency_shutdown {
            return ProtectionOutcome::Disabled;
        }
        if self.inner.protecting.swap(true, Ordering::AcqRel) {
            return ProtectionOutcome::InProgress;
        }
        let _guard = RunGuard(&self.inner.protecting);

        let now = self.inner.clock.now_ms();
        let admitted = {
            let mut state = self.state();
            if state
                .last_protection_ms
                .is_some_and(|at| now.saturating_sub(at) >= config.protection_cooldown_ms)
            {
                state.protection_attempts = 0;
                state.escalated = false;
            }
            if state.protection_attempts >= config.max_protection_attempts {
                let first = !state.escalated;
                state.escalated = true;
                Err((state.protection_attempts, first))
            } else {
                state.protection_attempts += 1;
                state.last_protection_ms = Some(now);
                state.stats.protections += 1;
                Ok(state.protection_attempts)
            }
        };
        let attempt = match admitted {
            Ok(attempt) => attempt,
            Err((attempts, first)) => return self.escalate(attempts, first).await,
        };

        warn!(
            attempt,
            max = config.max_protection_attempts,
            ceiling = config.absolute_ceiling,
            "heap at absolute ceiling, running last aggressive cleanup"
        );
        match self.inner.cleanup.execute_cleanup(CleanupLevel::Aggressive, None).await {
            Ok(result) => self.note_cleanup(&result),
            Err(err) => debug!(error = %err, "protection cleanup skipped"),
        }
        tokio::time::sleep(Duration::from_millis(config.recheck_delay_ms)).await;

        let heap_percent = self.inner.sampler.read_raw().heap_percent();
        if heap_percent < config.absolute_ceiling {
            self.state().stats.averted += 1;
            info!(heap_percent, "heap back under the absolute ceiling");
            return ProtectionOutcome::Averted { heap_percent };
        }

        error!(heap_percent, "heap still at ceiling, stopping non-critical components");
        let stopped = self.stop_non_critical_components().await;
        self.force_collections().await;
        if !stopped.is_empty() {
            self.spawn_restart_supervision();
        }
        ProtectionOutcome::ComponentsStopped {
            stopped,
            heap_percent,
        }
    }

    async fn escalate(&self, attempts: u32, first: bool) -> ProtectionOutcome {
        if !first {
            debug!(attempts, "protection exhausted, already escalated");
            return ProtectionOutcome::Exhausted { attempts };
        }
        let Some(engine) = self.inner.engine.clone() else {
            error!(attempts, "protection exhausted and no shutdown engine to escalate to");
            return ProtectionOutcome::Exhausted { attempts };
        };
        self.state().stats.escalations += 1;
        error!(attempts, "protection exhausted, initiating shutdown");
        let completed = match engine.initiate_shutdown(REASON_MEMORY_CEILING).await {
            Ok(report) => {
                info!(incident = %report.incident_id, "escalated shutdown finished");
                true
            }
            Err(err) => {
                warn!(error = %err, "escalated shutdown did not complete");
                false
            }
        };
        ProtectionOutcome::Escalated {
            attempts,
            completed,
        }
    }

    async fn stop_non_critical_components(&self) -> Vec<String> {
        let config = &self.inner.config;
        let timeout = Duration::from_millis(config.component_timeout_ms);
        let queued = self.state().restart_queue.clone();
        let mut stopped = Vec::new();

        for component in self.inner.registry.by_priority() {
            let name = component.name().to_string();
            if config.critical_components.contains(&name)
                || !component.capabilities().lifecycle
                || queued.contains(&name)
            {
                continue;
            }
            match tokio::time::timeout(timeout, component.stop()).await {
                Ok(Ok(())) => {
                    info!(component = %name, "component stopped under memory pressure");
                    self.inner
                        .events
                        .emit(GuardianEvent::ComponentStopped { name: name.clone() });
                    stopped.push(name);
                }
                Ok(Err(err)) => warn!(component = %name, error = %err, "component failed to stop"),
                Err(_) => warn!(component = %name, timeout_ms = config.component_timeout_ms, "component stop timed out"),
            }
        }

        let mut state = self.state();
        state.stats.components_stopped += stopped.len() as u64;
        for name in &stopped {
            if !state.restart_queue.contains(name) {
                state.restart_queue.push(name.clone());
            }
        }
        stopped
    }

    async fn force_collections(&self) {
        let Some(reclaimer) = &self.inner.reclaimer else {
            return;
        };
        let pause = Duration::from_millis(self.inner.config.collection_pause_ms);
        for pass in 0..self.inner.config.protection_collection_passes {
            if pass > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let record = reclaimer.force_collect();
            debug!(pass, efficiency = record.efficiency(), "protection collection pass");
        }
    }

    fn spawn_restart_supervision(&self) {
        let mut slot = lock(&self.inner.restart_task);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("restart supervision needs a tokio runtime; call restart_queued_components manually");
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let poll = Duration::from_millis(self.inner.config.restart_poll_interval_ms);
        *slot = Some(handle.spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = MemoryManager { inner };
                let level = manager.inner.sampler.current_level();
                if level <= PressureLevel::Warning {
                    manager.restart_queued_components().await;
                    break;
                }
                debug!(%level, "restart deferred, pressure still high");
            }
        }));
        debug!("restart supervision started");
    }

    /// Restarts every queued component in registration order. Returns each
    /// name with whether its restart succeeded.
    pub async fn restart_queued_components(&self) -> Vec<(String, bool)> {
        let queued = std::mem::take(&mut self.state().restart_queue);
        let mut components: Vec<_> = queued
            .iter()
            .filter_map(|name| match self.inner.registry.get(name) {
                Ok(component) => Some(component),
                Err(_) => {
                    debug!(component = %name, "queued component no longer registered");
                    None
                }
            })
            .collect();
        components.sort_by_key(|c| c.sequence());

        let timeout = Duration::from_millis(self.inner.config.component_timeout_ms);
        let mut results = Vec::with_capacity(components.len());
        for component in components {
            let name = component.name().to_string();
            let success = match tokio::time::timeout(timeout, component.start()).await {
                Ok(Ok(())) => {
                    info!(component = %name, "component restarted");
                    true
                }
                Ok(Err(err)) => {
                    warn!(component = %name, error = %err, "component restart failed");
                    false
                }
                Err(_) => {
                    warn!(component = %name, "component restart timed out");
                    false
                }
            };
            {
                let mut state = self.state();
                if success {
                    state.stats.components_restarted += 1;
                } else {
                    state.stats.restart_failures += 1;
                }
            }
            self.inner.events.emit(GuardianEvent::ComponentRestarted {
                name: name.clone(),
                success,
            });
            results.push((name, success));
        }
        results
    }

    /// Starts ticking every `sampler.sample_interval_ms`. Returns false if
    /// already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) -> bool {
        if self.inner.enabled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn_async(
            "memory-manager",
            self.inner.config.sampler.sample_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        MemoryManager { inner }.tick().await;
                    }
                }
            },
        );
        *lock(&self.inner.task) = Some(task);
        info!(
            interval_ms = self.inner.config.sampler.sample_interval_ms,
            ceiling = self.inner.config.absolute_ceiling,
            "memory manager started"
        );
        true
    }

    /// Cancels periodic ticking and restart supervision. Returns false if
    /// the manager was not running.
    pub fn stop(&self) -> bool {
        if !self.inner.enabled.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(task) = lock(&self.inner.task).take() {
            task.cancel();
        }
        if let Some(handle) = lock(&self.inner.restart_task).take() {
            handle.abort();
        }
        info!("memory manager stopped");
        true
    }

    /// Returns true while periodic ticking runs.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Returns true while the emergency latch is set.
    #[must_use]
    pub fn in_emergency_mode(&self) -> bool {
        self.state().emergency_mode
    }

    /// Components waiting for restart.
    #[must_use]
    pub fn restart_queue(&self) -> Vec<String> {
        self.state().restart_queue.clone()
    }

    /// Counters since the manager was built.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.state().stats.clone()
    }

    /// Point-in-time status.
    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        let latest_sample = self.inner.sampler.latest_sample();
        let state = self.state();
        ManagerStatus {
            enabled: self.is_enabled(),
            emergency_mode: state.emergency_mode,
            protection_attempts: state.protection_attempts,
            restart_queue: state.restart_queue.clone(),
            latest_sample,
            stats: state.stats.clone(),
        }
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("enabled", &self.is_enabled())
            .field("emergency_mode", &self.in_emergency_mode())
            .field("sampler", &self.inner.sampler)
            .field("cleanup", &self.inner.cleanup)
            .finish()
    }
}
