//! # Integration Tests
//!
//! End-to-end shutdown sequences: concurrency, phase escalation, snapshot
//! persistence and bounded recovery.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use guardian_runtime::{
    drain_events, EventBus, GuardianEvent, ManualClock, ServiceError, ShutdownPhase,
};
use guardian_shutdown::{
    Closeable, RecoveryOutcome, ResourceKind, ShutdownConfig, ShutdownEngine, ShutdownError,
    ShutdownSnapshot, Terminator,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingTerminator {
    code: AtomicI32,
    calls: AtomicU32,
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.code.store(code, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn build(config: ShutdownConfig) -> (ShutdownEngine, EventBus, Arc<RecordingTerminator>) {
    let bus = EventBus::new(128);
    let terminator = Arc::new(RecordingTerminator::default());
    let engine = ShutdownEngine::with_terminator(
        config,
        bus.clone(),
        ManualClock::new(1_700_000_000_000).shared(),
        terminator.clone(),
    )
    .unwrap();
    (engine, bus, terminator)
}

fn quiet_config() -> ShutdownConfig {
    ShutdownConfig::new()
        .with_save_state(false)
        .with_graceful_timeouts(1_000, 200)
        .with_force_timeouts(500, 100)
        .with_recovery(100, 0)
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_initiate_runs_sequence_once() {
    let (engine, _bus, _) = build(quiet_config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    engine.register_component(
        "worker",
        move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ServiceError>(())
            }
        },
        1,
    );

    let (first, second) = tokio::join!(
        engine.initiate_shutdown("stack emergency"),
        engine.initiate_shutdown("memory emergency"),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(ShutdownError::AlreadyShuttingDown)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().initiated, 1);
}

// ============================================================================
// Phase escalation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_graceful_timeout_escalates_to_force() {
    let config = quiet_config()
        .with_graceful_timeouts(100, 100)
        .with_force_timeouts(200, 50);
    let (engine, bus, _) = build(config);
    let mut rx = bus.subscribe();

    engine.register_component(
        "quick",
        || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok::<(), ServiceError>(())
        },
        1,
    );
    engine.register_component(
        "sluggish",
        || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok::<(), ServiceError>(())
        },
        2,
    );

    let report = engine.initiate_shutdown("overload").await.unwrap();

    assert_eq!(report.finished_in, ShutdownPhase::Force);
    assert_eq!(report.completed, vec!["quick".to_string()]);
    assert_eq!(report.failed, vec!["sluggish".to_string()]);

    let phases: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            guardian_runtime::GuardianEvent::ShutdownPhaseChanged { phase } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![ShutdownPhase::Graceful, ShutdownPhase::Force]);
}

struct HangingSocket;

#[async_trait]
impl Closeable for HangingSocket {
    async fn close(&self) -> Result<(), ServiceError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_force_timeout_terminates_immediately() {
    let config = quiet_config()
        .with_graceful_timeouts(150, 100)
        .with_force_timeouts(60, 50);
    let (engine, _bus, terminator) = build(config);

    for name in ["a", "b"] {
        engine.register_component(
            name,
            || async {
                std::future::pending::<()>().await;
                Ok::<(), ServiceError>(())
            },
            1,
        );
    }
    engine
        .resources()
        .track_closeable("socket", ResourceKind::Socket, Arc::new(HangingSocket));

    let result = engine.initiate_shutdown("deadlock").await;

    assert!(matches!(result, Err(ShutdownError::CriticalTermination(_))));
    assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(terminator.code.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().immediate_terminations, 1);
}

// ============================================================================
// Snapshot persistence
// ============================================================================

#[tokio::test]
async fn test_snapshot_round_trips_component_sets() {
    let dir = TempDir::new().unwrap();
    let config = quiet_config()
        .with_save_state(true)
        .with_state_dir(dir.path())
        .with_recovery(60_000, 1);
    let (engine, _bus, _) = build(config);

    engine.register_component("cache", || async { Ok::<(), ServiceError>(()) }, 1);
    engine.register_component("http", || async { Ok::<(), ServiceError>(()) }, 2);
    engine.register_component(
        "db",
        || async { Err::<(), _>(ServiceError::failed("connection stuck")) },
        3,
    );

    let seen: Arc<Mutex<Option<ShutdownSnapshot>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    engine.register_recovery_strategy("inspect", move |snapshot: Option<ShutdownSnapshot>| {
        *sink.lock().unwrap() = snapshot;
        async { Ok::<(), ServiceError>(()) }
    });

    let report = engine.initiate_shutdown("maintenance").await.unwrap();
    engine.cancel_recovery();

    let stored = engine.snapshot_store().unwrap().load().unwrap().unwrap();
    assert_eq!(stored.incident_id, report.incident_id);
    assert_eq!(stored.phase, ShutdownPhase::Complete);
    assert_eq!(stored.completed, vec!["cache".to_string(), "http".to_string()]);
    assert_eq!(stored.failed, vec!["db".to_string()]);

    let outcome = engine.attempt_recovery().await;
    assert_eq!(outcome, RecoveryOutcome::Recovered { attempt: 1 });

    let reloaded = seen.lock().unwrap().clone().unwrap();
    assert_eq!(reloaded.completed, stored.completed);
    assert_eq!(reloaded.failed, stored.failed);
}

// ============================================================================
// Bounded recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recovery_stops_after_max_attempts() {
    let (engine, bus, _) = build(quiet_config().with_recovery(100, 3));
    let mut rx = bus.subscribe();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    engine.register_recovery_strategy("always-fails", move |_snapshot: Option<ShutdownSnapshot>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(ServiceError::failed("still broken")) }
    });

    engine.initiate_shutdown("test").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(engine.state().recovery_attempts, 3);

    // A manual attempt past the cap runs nothing and reports nothing new.
    assert_eq!(
        engine.attempt_recovery().await,
        RecoveryOutcome::Exhausted { attempts: 3 }
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let events = drain_events(&mut rx);
    let count = |name: &str| events.iter().filter(|e| e.name() == name).count();
    assert_eq!(count("recovery:attempt"), 3);
    assert_eq!(count("recovery:failed"), 3);
    assert_eq!(count("recovery:max-attempts"), 1);
    assert!(!engine.is_shutting_down());
    assert_eq!(engine.phase(), ShutdownPhase::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_again_after_recovery_exhausted() {
    let (engine, bus, _) = build(quiet_config().with_recovery(100, 1));
    engine.register_recovery_strategy("always-fails", |_snapshot: Option<ShutdownSnapshot>| async {
        Err::<(), _>(ServiceError::failed("still broken"))
    });

    engine.initiate_shutdown("first incident").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.state().recovery_attempts, 1);

    let mut rx = bus.subscribe();
    let report = engine.initiate_shutdown("second incident").await.unwrap();
    assert_eq!(report.reason, "second incident");
    assert_eq!(engine.stats().initiated, 2);
    assert_eq!(engine.state().recovery_attempts, 0);

    // The new sequence gets its own recovery budget and exhaustion report.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GuardianEvent::ShutdownInitiated { immediate: false, .. })));
    assert_eq!(
        events.iter().filter(|e| e.name() == "recovery:max-attempts").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_recovery_returns_to_idle() {
    let (engine, _bus, _) = build(quiet_config().with_recovery(100, 2));
    engine.register_recovery_strategy("noop", |_snapshot: Option<ShutdownSnapshot>| async {
        Ok::<(), ServiceError>(())
    });

    engine.initiate_shutdown("test").await.unwrap();
    assert_eq!(engine.phase(), ShutdownPhase::Complete);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.phase(), ShutdownPhase::Idle);
    assert!(!engine.is_shutting_down());
    assert_eq!(engine.stats().recoveries_succeeded, 1);

    // A fresh sequence can start once idle.
    assert!(engine.initiate_shutdown("again").await.is_ok());
}
