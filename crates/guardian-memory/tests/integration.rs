//! # Integration Tests
//!
//! Sampler classification and leak scoring over scripted heaps, strategy
//! containment across identical collection sets, and the manager's
//! protection path: stopping, restarting and escalating.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use guardian_memory::{
    CleanupConfig, CleanupManager, CollectionKind, MemoryManager, MemoryManagerConfig,
    MemorySampler, ProtectionOutcome, SamplerConfig, TimedQueue,
};
use guardian_runtime::{
    drain_events, CleanupLevel, ComponentRegistration, ComponentRegistry, EventBus,
    GuardianEvent, Lifecycle, ManualClock, ManualProbe, PressureLevel, RawMemoryStats,
    ServiceError,
};
use guardian_shutdown::{ShutdownConfig, ShutdownEngine, Terminator};

const START_MS: u64 = 1_700_000_000_000;

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

struct TestService {
    running: AtomicBool,
    starts: AtomicU32,
}

impl TestService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            starts: AtomicU32::new(0),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lifecycle for TestService {
    async fn start(&self) -> Result<(), ServiceError> {
        self.running.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn heap(used: u64, limit: u64) -> RawMemoryStats {
    RawMemoryStats {
        heap_used: used,
        heap_total: used,
        heap_limit: limit,
        ..RawMemoryStats::default()
    }
}

fn engine(bus: &EventBus) -> (ShutdownEngine, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::default());
    let config = ShutdownConfig::new()
        .with_save_state(false)
        .with_graceful_timeouts(1_000, 200)
        .with_force_timeouts(500, 100)
        .with_recovery(100, 0);
    let engine = ShutdownEngine::with_terminator(
        config,
        bus.clone(),
        ManualClock::new(START_MS).shared(),
        terminator.clone(),
    )
    .unwrap();
    (engine, terminator)
}

fn populate(cleanup: &CleanupManager, clock: &ManualClock) {
    let history: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new((0..500).collect()));
    let cache: Arc<Mutex<HashMap<u32, String>>> =
        Arc::new(Mutex::new((0..300).map(|i| (i, format!("v{i}"))).collect()));
    let queue: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new((0..50).collect()));
    let jobs: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new((0..40).collect()));
    let sessions = Arc::new(TimedQueue::new(60_000, clock.shared()));
    for i in 0..20 {
        sessions.push(i);
    }
    cleanup.register_collection("history", CollectionKind::History, history);
    cleanup.register_collection("cache", CollectionKind::Cache, cache);
    cleanup.register_collection("queue", CollectionKind::Queue, queue);
    cleanup.register_collection("jobs", CollectionKind::JobHistory, jobs);
    cleanup.register_collection("sessions", CollectionKind::Transient, sessions);
}

// ============================================================================
// Sampling
// ============================================================================

#[test]
fn test_emergency_heap_alerts_once_per_cooldown() {
    let clock = ManualClock::new(START_MS);
    let probe = ManualProbe::new(heap(97, 100));
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let sampler = MemorySampler::builder(SamplerConfig::new(), Arc::new(probe), bus.clone())
        .clock(clock.shared())
        .build()
        .unwrap();

    let first = sampler.take_sample();
    assert_eq!(first.sample.level, PressureLevel::Emergency);
    assert_eq!(first.alert, Some(PressureLevel::Emergency));

    clock.advance(10_000);
    let second = sampler.take_sample();
    assert_eq!(second.sample.level, PressureLevel::Emergency);
    assert_eq!(second.alert, None);

    clock.advance(sampler.config().emergency_cooldown_ms);
    assert_eq!(sampler.take_sample().alert, Some(PressureLevel::Emergency));

    let names: Vec<_> = drain_events(&mut rx)
        .iter()
        .filter(|e| matches!(e, GuardianEvent::MemoryPressure { .. }))
        .map(GuardianEvent::name)
        .collect();
    assert_eq!(names, vec!["memory:pressure:emergency"; 2]);
}

#[test]
fn test_steady_growth_reports_leak() {
    let clock = ManualClock::new(START_MS);
    let probe = ManualProbe::new(heap(1 << 20, 1 << 40));
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let sampler = MemorySampler::builder(SamplerConfig::new(), Arc::new(probe.clone()), bus.clone())
        .clock(clock.shared())
        .build()
        .unwrap();

    let mut leaks = Vec::new();
    for _ in 0..15 {
        if let Some(leak) = sampler.take_sample().leak {
            leaks.push(leak);
        }
        clock.advance(5_000);
        probe.update(|s| {
            s.heap_used += s.heap_used / 25;
            s.heap_total = s.heap_used;
        });
    }

    // Reported once, then held back by the leak cooldown.
    assert_eq!(leaks.len(), 1);
    assert!(leaks[0].confidence >= 2.0 / 3.0 - f64::EPSILON);
    assert!(leaks[0]
        .indicators
        .iter()
        .any(|i| i == guardian_memory::INDICATOR_CONSISTENT_GROWTH));
    assert_eq!(sampler.stats().leaks_detected, 1);

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GuardianEvent::LeakDetected { .. })));
    assert!(sampler.trend().is_some());
}

#[test]
fn test_flat_heap_is_not_a_leak() {
    let clock = ManualClock::new(START_MS);
    let probe = ManualProbe::new(heap(1 << 20, 1 << 40));
    let sampler = MemorySampler::builder(SamplerConfig::new(), Arc::new(probe), EventBus::new(16))
        .clock(clock.shared())
        .build()
        .unwrap();

    for _ in 0..15 {
        assert!(sampler.take_sample().leak.is_none());
        clock.advance(5_000);
    }
}

// ============================================================================
// Cleanup containment
// ============================================================================

#[tokio::test]
async fn test_moderate_never_leaves_more_than_gentle() {
    let clock = ManualClock::new(START_MS);
    let build = || {
        CleanupManager::builder(
            CleanupConfig::new(),
            Arc::new(ManualProbe::new(heap(80, 100))),
            EventBus::new(64),
        )
        .clock(clock.shared())
        .build()
        .unwrap()
    };
    let gentle = build();
    let moderate = build();
    populate(&gentle, &clock);
    populate(&moderate, &clock);
    assert_eq!(gentle.live_entries(), moderate.live_entries());

    let gentle_run = gentle.execute_cleanup(CleanupLevel::Gentle, None).await.unwrap();
    let moderate_run = moderate.execute_cleanup(CleanupLevel::Moderate, None).await.unwrap();

    assert!(moderate.live_entries() <= gentle.live_entries());
    assert!(moderate_run.entries_removed >= gentle_run.entries_removed);
    assert_eq!(gentle.collection_sizes().get("history"), Some(&100));
    assert_eq!(moderate.collection_sizes().get("queue"), Some(&0));
}

#[tokio::test]
async fn test_emergency_strategy_empties_caches() {
    let clock = ManualClock::new(START_MS);
    let cleanup = CleanupManager::builder(
        CleanupConfig::new(),
        Arc::new(ManualProbe::new(heap(99, 100))),
        EventBus::new(64),
    )
    .clock(clock.shared())
    .build()
    .unwrap();
    populate(&cleanup, &clock);

    let result = cleanup
        .execute_cleanup(CleanupLevel::Emergency, None)
        .await
        .unwrap();
    assert_eq!(result.level, CleanupLevel::Emergency);
    assert_eq!(cleanup.collection_sizes().get("cache"), Some(&0));
    assert_eq!(cleanup.collection_sizes().get("sessions"), Some(&0));
}

// ============================================================================
// Manager reactions
// ============================================================================

#[tokio::test]
async fn test_manager_warning_runs_gentle() {
    let probe = ManualProbe::new(heap(72, 100));
    let manager = MemoryManager::builder(
        MemoryManagerConfig::new(),
        Arc::new(probe),
        EventBus::new(64),
    )
    .clock(ManualClock::new(START_MS).shared())
    .build()
    .unwrap();

    let tick = manager.tick().await;
    assert_eq!(tick.level, PressureLevel::Warning);
    assert_eq!(tick.cleanup.map(|r| r.level), Some(CleanupLevel::Gentle));
    assert!(tick.protection.is_none());
}

#[tokio::test]
async fn test_manager_leak_runs_aggressive() {
    let clock = ManualClock::new(START_MS);
    let probe = ManualProbe::new(heap(1 << 20, 1 << 40));
    let manager = MemoryManager::builder(
        MemoryManagerConfig::new(),
        Arc::new(probe.clone()),
        EventBus::new(64),
    )
    .clock(clock.shared())
    .build()
    .unwrap();

    let mut levels = Vec::new();
    for _ in 0..12 {
        let tick = manager.tick().await;
        assert_eq!(tick.level, PressureLevel::Normal);
        if let Some(result) = tick.cleanup {
            levels.push(result.level);
        }
        clock.advance(5_000);
        probe.update(|s| s.heap_used += s.heap_used / 25);
    }
    assert_eq!(levels, vec![CleanupLevel::Aggressive]);
}

// ============================================================================
// Shutdown protection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_protection_stops_non_critical_and_restarts() {
    let probe = ManualProbe::new(heap(99, 100));
    let bus = EventBus::new(256);
    let mut rx = bus.subscribe();
    let registry = ComponentRegistry::new();
    let db = TestService::new();
    let worker = TestService::new();
    registry.register(
        ComponentRegistration::new("db")
            .with_priority(0)
            .with_lifecycle(db.clone()),
    );
    registry.register(
        ComponentRegistration::new("worker")
            .with_priority(10)
            .with_lifecycle(worker.clone()),
    );

    let config = MemoryManagerConfig::new()
        .with_critical_components(["db"])
        .with_timings(100, 1_000);
    let manager = MemoryManager::builder(config, Arc::new(probe.clone()), bus.clone())
        .clock(ManualClock::new(START_MS).shared())
        .registry(registry)
        .build()
        .unwrap();

    let tick = manager.tick().await;
    assert!(tick.entered_emergency);
    assert_eq!(
        tick.protection,
        Some(ProtectionOutcome::ComponentsStopped {
            stopped: vec!["worker".to_string()],
            heap_percent: 0.99,
        })
    );
    assert!(db.is_running());
    assert!(!worker.is_running());
    assert_eq!(manager.restart_queue(), vec!["worker".to_string()]);

    // Pressure stays high: supervision keeps waiting.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!worker.is_running());

    probe.set(heap(10, 100));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(worker.is_running());
    assert_eq!(worker.starts.load(Ordering::SeqCst), 1);
    assert_eq!(db.starts.load(Ordering::SeqCst), 0);
    assert!(manager.restart_queue().is_empty());
    assert_eq!(manager.stats().components_restarted, 1);

    let events = drain_events(&mut rx);
    assert!(events.contains(&GuardianEvent::ComponentStopped {
        name: "worker".to_string()
    }));
    assert!(events.contains(&GuardianEvent::ComponentRestarted {
        name: "worker".to_string(),
        success: true,
    }));
    assert!(!events.iter().any(|e| matches!(
        e,
        GuardianEvent::ComponentStopped { name } if name == "db"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_protection_escalates_once() {
    let clock = ManualClock::new(START_MS);
    let bus = EventBus::new(256);
    let (engine, _terminator) = engine(&bus);
    let config = MemoryManagerConfig::new()
        .with_protection(0.98, 1, 600_000)
        .with_timings(10, 1_000);
    let manager = MemoryManager::builder(config, Arc::new(ManualProbe::new(heap(99, 100))), bus)
        .clock(clock.shared())
        .shutdown_engine(engine.clone())
        .build()
        .unwrap();

    assert!(matches!(
        manager.shutdown_protection().await,
        ProtectionOutcome::ComponentsStopped { .. }
    ));
    assert!(matches!(
        manager.shutdown_protection().await,
        ProtectionOutcome::Escalated { attempts: 1, .. }
    ));
    assert_eq!(
        manager.shutdown_protection().await,
        ProtectionOutcome::Exhausted { attempts: 1 }
    );
    assert_eq!(engine.stats().initiated, 1);
    assert_eq!(manager.stats().escalations, 1);

    // A fresh window allows another attempt.
    clock.advance(600_000);
    assert!(matches!(
        manager.shutdown_protection().await,
        ProtectionOutcome::ComponentsStopped { .. }
    ));
    assert_eq!(manager.status().protection_attempts, 1);
}

#[tokio::test]
async fn test_protection_averted_when_heap_drops() {
    let probe = ManualProbe::new(heap(99, 100));
    let cleanup_probe = probe.clone();
    let manager = MemoryManager::builder(
        MemoryManagerConfig::new().with_timings(1, 1_000),
        Arc::new(probe),
        EventBus::new(64),
    )
    .clock(ManualClock::new(START_MS).shared())
    .build()
    .unwrap();
    manager
        .cleanup()
        .register_action("drop-buffers", CleanupLevel::Aggressive, move || {
            cleanup_probe.set(heap(50, 100));
            Ok(1)
        });

    assert_eq!(
        manager.shutdown_protection().await,
        ProtectionOutcome::Averted { heap_percent: 0.5 }
    );
    assert_eq!(manager.stats().averted, 1);
}
