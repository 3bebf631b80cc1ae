//! # Shutdown Engine
//!
//! Coordinates a staged shutdown of every registered component, persists
//! what happened, and schedules bounded automatic recovery.
//!
//! ## State Machine
//!
//! ```text
//!   idle ──initiate──▶ graceful ──ok──────────────▶ complete ──recovery ok──▶ idle
//!                          │                           ▲
//!                   fail / timeout                     │
//!                          ▼                           │
//!                        force ────ok──────────────────┘
//!                          │
//!                   fail / timeout
//!                          ▼
//!                 immediate terminate (exit)
//! ```
//!
//! ## Threat Model
//!
//! - **Hung components**: every handler is raced against a per-component
//!   timeout, and each phase against an overall timeout.
//! - **Concurrent triggers**: stack and memory monitors may both ask for a
//!   shutdown. An atomic latch lets exactly one sequence run; the other
//!   caller gets [`ShutdownError::AlreadyShuttingDown`].
//! - **Recovery loops**: recovery attempts are capped and exhaustion is
//!   reported exactly once. Exhaustion releases the latch, so a later
//!   trigger can still start a new sequence.
//!
//! ## Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use guardian_runtime::{EventBus, ServiceError, ShutdownPhase, SystemClock};
//! use guardian_shutdown::{ShutdownConfig, ShutdownEngine};
//!
//! let config = ShutdownConfig::new().with_save_state(false).with_recovery(0, 0);
//! let engine = ShutdownEngine::new(config, EventBus::default(), SystemClock::shared()).unwrap();
//! engine.register_component("cache", || async { Ok::<(), ServiceError>(()) }, 10);
//!
//! let report = engine.initiate_shutdown("maintenance").await.unwrap();
//! assert_eq!(report.finished_in, ShutdownPhase::Graceful);
//! assert_eq!(report.completed, vec!["cache".to_string()]);
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use guardian_runtime::{EventBus, GuardianEvent, ServiceError, SharedClock, ShutdownPhase};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ShutdownConfig;
use crate::error::{ComponentShutdownError, CriticalTerminationError, ShutdownError};
use crate::handler::{
    ComponentRecovery, ProcessTerminator, RecoveryStrategy, ShutdownHandler, Terminator,
};
use crate::resources::{ReleaseReport, ResourceTracker};
use crate::snapshot::{ShutdownSnapshot, SnapshotStore};
use crate::state::{EmergencyState, ShutdownStats};
use crate::Result;

/// Outcome of one shutdown sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Identifier of this sequence (also stored in the snapshot).
    pub incident_id: Uuid,
    /// Why the sequence started.
    pub reason: String,
    /// Phase that brought the sequence to completion.
    pub finished_in: ShutdownPhase,
    /// Components that stopped cleanly, sorted.
    pub completed: Vec<String>,
    /// Components that failed or timed out, sorted.
    pub failed: Vec<String>,
    /// Individual handler failures.
    pub errors: Vec<ComponentShutdownError>,
    /// Resource release outcome.
    pub resources: ReleaseReport,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Result of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Everything recovered; the engine is idle again.
    Recovered {
        /// Attempt number that succeeded
        attempt: u32,
    },
    /// Some strategy or component callback failed.
    Failed {
        /// Attempt number
        attempt: u32,
        /// Failure descriptions
        errors: Vec<String>,
    },
    /// The attempt cap was already reached; nothing ran.
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
    /// The engine is idle; there is nothing to recover.
    NotNeeded,
}

struct ComponentEntry {
    handler: Arc<dyn ShutdownHandler>,
    priority: u32,
    sequence: u64,
}

struct Inner {
    config: ShutdownConfig,
    events: EventBus,
    clock: SharedClock,
    store: Option<SnapshotStore>,
    terminator: Arc<dyn Terminator>,
    resources: ResourceTracker,
    components: Mutex<BTreeMap<String, ComponentEntry>>,
    component_recovery: Mutex<BTreeMap<String, Arc<dyn ComponentRecovery>>>,
    strategies: Mutex<Vec<(String, Arc<dyn RecoveryStrategy>)>>,
    state: Mutex<EmergencyState>,
    stats: Mutex<ShutdownStats>,
    incident: Mutex<Option<Uuid>>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
    in_progress: AtomicBool,
    exhaustion_reported: AtomicBool,
    next_sequence: AtomicU64,
}

/// Staged shutdown coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ShutdownEngine {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl ShutdownEngine {
    /// Creates an engine that terminates through [`std::process::exit`].
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid or the snapshot directory cannot be
    /// created.
    pub fn new(config: ShutdownConfig, events: EventBus, clock: SharedClock) -> Result<Self> {
        Self::with_terminator(config, events, clock, Arc::new(ProcessTerminator))
    }

    /// Creates an engine with an injected [`Terminator`].
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid or the snapshot directory cannot be
    /// created.
    pub fn with_terminator(
        config: ShutdownConfig,
        events: EventBus,
        clock: SharedClock,
        terminator: Arc<dyn Terminator>,
    ) -> Result<Self> {
        config.validate()?;
        let store = if config.save_state {
            Some(SnapshotStore::open(&config.state_dir)?)
        } else {
            None
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                events,
                clock,
                store,
                terminator,
                resources: ResourceTracker::new(),
                components: Mutex::new(BTreeMap::new()),
                component_recovery: Mutex::new(BTreeMap::new()),
                strategies: Mutex::new(Vec::new()),
                state: Mutex::new(EmergencyState::default()),
                stats: Mutex::new(ShutdownStats::default()),
                incident: Mutex::new(None),
                recovery_task: Mutex::new(None),
                in_progress: AtomicBool::new(false),
                exhaustion_reported: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
            }),
        })
    }

    /// Engine configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ShutdownConfig {
        &self.inner.config
    }

    /// Tracked resources released during shutdown.
    #[inline]
    #[must_use]
    pub fn resources(&self) -> &ResourceTracker {
        &self.inner.resources
    }

    /// Snapshot store, when snapshots are enabled.
    #[inline]
    #[must_use]
    pub fn snapshot_store(&self) -> Option<&SnapshotStore> {
        self.inner.store.as_ref()
    }

    /// Registers (or replaces) a component handler. Lower priorities stop
    /// first; ties stop in registration order.
    pub fn register_component(
        &self,
        name: impl Into<String>,
        handler: impl ShutdownHandler + 'static,
        priority: u32,
    ) {
        self.register_component_arc(name, Arc::new(handler), priority);
    }

    /// Registers an already shared handler.
    pub fn register_component_arc(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ShutdownHandler>,
        priority: u32,
    ) {
        let name = name.into();
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        debug!(component = %name, priority, "shutdown handler registered");
        lock(&self.inner.components).insert(
            name,
            ComponentEntry {
                handler,
                priority,
                sequence,
            },
        );
    }

    /// Removes a component handler. Returns whether it existed.
    pub fn unregister_component(&self, name: &str) -> bool {
        lock(&self.inner.component_recovery).remove(name);
        lock(&self.inner.components).remove(name).is_some()
    }

    /// Number of registered component handlers.
    pub fn component_count(&self) -> usize {
        lock(&self.inner.components).len()
    }

    /// Registers a callback that restores `name` if it failed to stop.
    pub fn register_component_recovery(
        &self,
        name: impl Into<String>,
        callback: impl ComponentRecovery + 'static,
    ) {
        lock(&self.inner.component_recovery).insert(name.into(), Arc::new(callback));
    }

    /// Registers a named recovery strategy. Strategies run in registration
    /// order.
    pub fn register_recovery_strategy(
        &self,
        name: impl Into<String>,
        strategy: impl RecoveryStrategy + 'static,
    ) {
        lock(&self.inner.strategies).push((name.into(), Arc::new(strategy)));
    }

    /// Copy of the current emergency state.
    pub fn state(&self) -> EmergencyState {
        lock(&self.inner.state).clone()
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        lock(&self.inner.state).phase
    }

    /// Returns true while a sequence is running or awaiting recovery.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> ShutdownStats {
        lock(&self.inner.stats).clone()
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        lock(&self.inner.state).phase = phase;
        info!(%phase, "shutdown phase changed");
        self.inner.events.emit(GuardianEvent::ShutdownPhaseChanged { phase });
    }

    fn ordered_handlers(&self) -> Vec<(String, Arc<dyn ShutdownHandler>)> {
        let components = lock(&self.inner.components);
        let mut entries: Vec<_> = components
            .iter()
            .map(|(name, e)| (e.priority, e.sequence, name.clone(), Arc::clone(&e.handler)))
            .collect();
        entries.sort_by_key(|(priority, sequence, _, _)| (*priority, *sequence));
        entries
            .into_iter()
            .map(|(_, _, name, handler)| (name, handler))
            .collect()
    }

    fn snapshot(&self) -> ShutdownSnapshot {
        let state = self.state();
        let incident_id = (*lock(&self.inner.incident)).unwrap_or_else(Uuid::nil);
        ShutdownSnapshot {
            incident_id,
            timestamp_ms: self.inner.clock.now_ms(),
            reason: state.reason.unwrap_or_default(),
            phase: state.phase,
            completed: state.completed.into_iter().collect(),
            failed: state.failed.into_iter().collect(),
            stats: self.stats(),
        }
    }

    fn save_snapshot(&self) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save(&self.snapshot()) {
                warn!(error = %e, "failed to save shutdown snapshot");
            }
        }
    }

    /// Runs the staged shutdown sequence.
    ///
    /// Component failures are recorded and do not stop the sequence. Unless
    /// `exit_on_shutdown` is set, recovery is scheduled after completion.
    ///
    /// # Errors
    ///
    /// - [`ShutdownError::AlreadyShuttingDown`] if a sequence is already
    ///   running or awaiting recovery; nothing is done.
    /// - [`ShutdownError::CriticalTermination`] if the force phase also
    ///   failed; the terminator has been invoked.
    pub async fn initiate_shutdown(&self, reason: impl Into<String>) -> Result<ShutdownReport> {
        let reason = reason.into();
        if self
            .inner
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(%reason, "shutdown already in progress, ignoring");
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        let started = self.inner.clock.now_ms();
        let incident_id = Uuid::new_v4();
        *lock(&self.inner.incident) = Some(incident_id);
        lock(&self.inner.state).begin(&reason, started);
        lock(&self.inner.stats).initiated += 1;
        self.inner.exhaustion_reported.store(false, Ordering::SeqCst);

        warn!(%reason, incident = %incident_id, "shutdown initiated");
        self.inner.events.emit(GuardianEvent::ShutdownInitiated {
            reason: reason.clone(),
            immediate: false,
        });
        self.inner.events.emit(GuardianEvent::ShutdownPhaseChanged {
            phase: ShutdownPhase::Graceful,
        });
        if self.inner.config.save_state {
            self.save_snapshot();
        }

        let graceful =
            tokio::time::timeout(self.inner.config.graceful_timeout(), self.graceful_phase()).await;
        let (finished_in, errors, resources) = match graceful {
            Ok((errors, resources)) if resources.is_clean() => {
                (ShutdownPhase::Graceful, errors, resources)
            }
            outcome => {
                match outcome {
                    Ok((_, resources)) => warn!(
                        failures = resources.failures.len(),
                        "graceful resource release failed, forcing"
                    ),
                    Err(_) => warn!(
                        timeout_ms = self.inner.config.graceful_timeout_ms,
                        "graceful shutdown timed out, forcing"
                    ),
                }
                self.set_phase(ShutdownPhase::Force);
                let forced =
                    tokio::time::timeout(self.inner.config.force_timeout(), self.force_phase()).await;
                match forced {
                    Ok((errors, resources)) if resources.is_clean() => {
                        (ShutdownPhase::Force, errors, resources)
                    }
                    Ok((_, resources)) => {
                        let detail =
                            format!("{} resources failed to release", resources.failures.len());
                        return Err(self.critical_termination(&reason, detail).into());
                    }
                    Err(_) => {
                        let detail = format!(
                            "force phase exceeded {}ms",
                            self.inner.config.force_timeout_ms
                        );
                        return Err(self.critical_termination(&reason, detail).into());
                    }
                }
            }
        };

        let duration_ms = self.inner.clock.now_ms().saturating_sub(started);
        {
            let mut stats = lock(&self.inner.stats);
            match finished_in {
                ShutdownPhase::Force => stats.force_completed += 1,
                _ => stats.graceful_completed += 1,
            }
            stats.last_duration_ms = duration_ms;
        }
        lock(&self.inner.state).phase = ShutdownPhase::Complete;
        let state = self.state();
        let report = ShutdownReport {
            incident_id,
            reason: reason.clone(),
            finished_in,
            completed: state.completed.iter().cloned().collect(),
            failed: state.failed.iter().cloned().collect(),
            errors,
            resources,
            duration_ms,
        };

        if self.inner.config.save_state {
            self.save_snapshot();
        }
        info!(
            %reason,
            phase = %finished_in,
            completed = report.completed.len(),
            failed = report.failed.len(),
            duration_ms,
            "shutdown complete"
        );
        self.inner.events.emit(GuardianEvent::ShutdownComplete {
            reason,
            completed: report.completed.clone(),
            failed: report.failed.clone(),
            finished_in,
        });

        if self.inner.config.exit_on_shutdown {
            self.inner.terminator.terminate(self.inner.config.exit_code);
        } else if self.inner.config.max_recovery_attempts > 0 {
            self.schedule_recovery();
        } else {
            self.reset_to_idle();
        }
        Ok(report)
    }

    async fn graceful_phase(&self) -> (Vec<ComponentShutdownError>, ReleaseReport) {
        let per_component = self.inner.config.component_timeout();
        let mut errors = Vec::new();
        for (name, handler) in self.ordered_handlers() {
            if let Err(e) = self.run_handler(&name, handler, per_component).await {
                errors.push(e);
            }
        }
        let resources = self.inner.resources.release_sequential(per_component).await;
        (errors, resources)
    }

    async fn force_phase(&self) -> (Vec<ComponentShutdownError>, ReleaseReport) {
        let per_component = self.inner.config.force_component_timeout();
        let completed = self.state().completed;
        let pending: Vec<_> = self
            .ordered_handlers()
            .into_iter()
            .filter(|(name, _)| !completed.contains(name))
            .map(|(name, handler)| {
                let engine = self.clone();
                async move { engine.run_handler(&name, handler, per_component).await }
            })
            .map(tokio::spawn)
            .collect();

        let mut errors = Vec::new();
        for handle in pending {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => error!(error = %e, "force-phase handler task failed"),
            }
        }
        let resources = self.inner.resources.release_concurrent(per_component).await;
        (errors, resources)
    }

    /// Runs one handler in its own task so a panic is contained, bounded by
    /// `timeout`. A timed-out handler keeps running detached.
    async fn run_handler(
        &self,
        name: &str,
        handler: Arc<dyn ShutdownHandler>,
        timeout: Duration,
    ) -> std::result::Result<(), ComponentShutdownError> {
        let task = tokio::spawn(async move { handler.shutdown().await });
        let outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ServiceError::failed(format!("handler panicked: {join}"))),
            Err(_) => Err(ServiceError::Timeout(timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(()) => {
                debug!(component = %name, "component stopped");
                lock(&self.inner.state).mark_completed(name);
                lock(&self.inner.stats).components_stopped += 1;
                Ok(())
            }
            Err(source) => {
                warn!(component = %name, error = %source, "component shutdown failed");
                lock(&self.inner.state).mark_failed(name);
                lock(&self.inner.stats).components_failed += 1;
                Err(ComponentShutdownError::new(name, source))
            }
        }
    }

    fn critical_termination(&self, reason: &str, detail: String) -> CriticalTerminationError {
        error!(%reason, %detail, "force shutdown failed, terminating immediately");
        if self.inner.config.save_state {
            self.save_snapshot();
        }
        self.terminate_immediately(reason);
        CriticalTerminationError {
            reason: reason.to_string(),
            detail,
        }
    }

    /// Immediate path: synchronous teardown of tracked resources and process
    /// termination with the configured exit code. Bypasses the emergency
    /// state bookkeeping entirely.
    pub fn terminate_immediately(&self, reason: &str) {
        error!(%reason, "immediate termination");
        lock(&self.inner.stats).immediate_terminations += 1;
        self.inner.events.emit(GuardianEvent::ShutdownInitiated {
            reason: reason.to_string(),
            immediate: true,
        });
        let touched = self.inner.resources.terminate_now();
        debug!(touched, "tracked resources torn down");
        self.inner.terminator.terminate(self.inner.config.exit_code);
    }

    fn schedule_recovery(&self) {
        let engine = self.clone();
        let delay = self.inner.config.recovery_delay();
        let max = self.inner.config.max_recovery_attempts;
        info!(delay_ms = self.inner.config.recovery_delay_ms, max_attempts = max, "recovery scheduled");
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match engine.attempt_recovery().await {
                    RecoveryOutcome::Failed { attempt, .. } if attempt < max => continue,
                    _ => break,
                }
            }
        });
        if let Some(previous) = lock(&self.inner.recovery_task).replace(handle) {
            previous.abort();
        }
    }

    /// Cancels a scheduled recovery, if any.
    pub fn cancel_recovery(&self) {
        if let Some(handle) = lock(&self.inner.recovery_task).take() {
            handle.abort();
        }
    }

    /// Runs one recovery attempt now.
    ///
    /// Strategies run in registration order, then per-component callbacks
    /// for components that failed to stop. Each is isolated: one failure
    /// does not prevent the rest from running, but any failure fails the
    /// attempt.
    pub async fn attempt_recovery(&self) -> RecoveryOutcome {
        let max = self.inner.config.max_recovery_attempts;
        let (attempt, reason, failed) = {
            let mut state = lock(&self.inner.state);
            if !state.is_active() {
                return RecoveryOutcome::NotNeeded;
            }
            if state.recovery_attempts >= max {
                drop(state);
                self.report_exhaustion(max);
                return RecoveryOutcome::Exhausted { attempts: max };
            }
            state.recovery_attempts += 1;
            (
                state.recovery_attempts,
                state.reason.clone().unwrap_or_default(),
                state.failed.clone(),
            )
        };
        lock(&self.inner.stats).recovery_attempts += 1;

        info!(%reason, attempt, max, "recovery attempt");
        self.inner.events.emit(GuardianEvent::RecoveryAttempt {
            reason: reason.clone(),
            attempt,
        });

        let snapshot = match &self.inner.store {
            Some(store) => store.load().unwrap_or_else(|e| {
                warn!(error = %e, "could not reload shutdown snapshot");
                None
            }),
            None => None,
        };

        let mut errors = Vec::new();
        let strategies: Vec<_> = lock(&self.inner.strategies).clone();
        for (name, strategy) in strategies {
            if let Err(e) = strategy.recover(snapshot.as_ref()).await {
                warn!(strategy = %name, error = %e, "recovery strategy failed");
                errors.push(format!("{name}: {e}"));
            }
        }

        for name in failed {
            let callback = lock(&self.inner.component_recovery).get(&name).cloned();
            let Some(callback) = callback else {
                continue;
            };
            match callback.recover_component().await {
                Ok(()) => {
                    debug!(component = %name, "component recovered");
                    lock(&self.inner.state).mark_completed(&name);
                }
                Err(e) => {
                    warn!(component = %name, error = %e, "component recovery failed");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        if errors.is_empty() {
            info!(attempt, "recovery succeeded");
            lock(&self.inner.stats).recoveries_succeeded += 1;
            self.inner.events.emit(GuardianEvent::RecoverySuccess { reason, attempt });
            self.reset_to_idle();
            return RecoveryOutcome::Recovered { attempt };
        }

        let error = errors.join("; ");
        self.inner.events.emit(GuardianEvent::RecoveryFailed {
            reason,
            attempt,
            error,
        });
        if attempt >= max {
            self.report_exhaustion(max);
        }
        RecoveryOutcome::Failed { attempt, errors }
    }

    /// Keeps the exhausted state as a record but releases the latch.
    fn report_exhaustion(&self, attempts: u32) {
        if !self.inner.exhaustion_reported.swap(true, Ordering::SeqCst) {
            error!(attempts, "recovery attempts exhausted");
            self.inner.events.emit(GuardianEvent::RecoveryMaxAttempts { attempts });
            self.inner.in_progress.store(false, Ordering::SeqCst);
        }
    }

    fn reset_to_idle(&self) {
        *lock(&self.inner.state) = EmergencyState::default();
        *lock(&self.inner.incident) = None;
        self.inner.exhaustion_reported.store(false, Ordering::SeqCst);
        self.inner.in_progress.store(false, Ordering::SeqCst);
        debug!("shutdown engine reset to idle");
    }
}

impl std::fmt::Debug for ShutdownEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownEngine")
            .field("phase", &self.phase())
            .field("components", &self.component_count())
            .field("in_progress", &self.is_shutting_down())
            .finish()
    }
}
