//! Typed guardian events and the broadcast bus that carries them.
//!
//! Event kinds form a closed enum, so a consumer cannot subscribe to a
//! misspelled name. [`GuardianEvent::name`] returns the canonical
//! `area:kind` string for log correlation.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::level::{CleanupLevel, PressureLevel, RecursionType, ShutdownPhase, StackLevel};

/// Every alert and lifecycle notification the guardian can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardianEvent {
    /// Stack depth crossed a threshold.
    StackAlert {
        /// Highest threshold crossed
        level: StackLevel,
        /// Observed depth
        depth: usize,
        /// Threshold value that was crossed
        threshold: usize,
        /// Innermost function of the sample, if known
        top_function: Option<String>,
    },
    /// Depth returned below warning after an emergency.
    StackRecovered {
        /// Depth at the time of recovery
        depth: usize,
    },
    /// A caller→callee sequence became excessively hot.
    ExcessivePattern {
        /// `caller->callee` label
        sequence: String,
        /// Observed frequency
        frequency: u32,
    },
    /// A monitor tick overran its time budget.
    PerformanceWarning {
        /// Tick duration
        tick_ms: u64,
        /// Allowed budget
        budget_ms: u64,
    },
    /// A monitoring tick failed; monitoring continues.
    MonitoringError {
        /// Which monitor reported it
        source: String,
        /// Failure description
        message: String,
    },
    /// The recursion detector flagged the current stack.
    RecursionDetected {
        /// Which algorithms fired
        types: Vec<RecursionType>,
        /// Aggregated confidence
        confidence: f64,
        /// Stack depth of the sample
        depth: usize,
    },
    /// Memory pressure crossed a level.
    MemoryPressure {
        /// Classified level
        level: PressureLevel,
        /// Heap usage relative to the limit
        heap_percent: f64,
        /// Heap bytes in use
        heap_used: u64,
        /// Resident set size
        rss: u64,
    },
    /// Sustained growth consistent with a leak.
    LeakDetected {
        /// score / 3
        confidence: f64,
        /// Mean growth in bytes per second
        growth_rate: f64,
        /// Indicators that fired
        indicators: Vec<String>,
    },
    /// Two or more emergency conditions hold at once.
    EmergencyActionNeeded {
        /// Conditions that hold
        conditions: Vec<String>,
    },
    /// Heap growth and stack growth moved together.
    MemoryCorrelation {
        /// Heap growth in bytes over the interval
        heap_growth: u64,
        /// Depth growth over the interval
        depth_growth: usize,
    },
    /// A cleanup strategy finished.
    CleanupCompleted {
        /// Strategy level
        level: CleanupLevel,
        /// Actions that ran
        actions: usize,
        /// Actions that failed
        failed: usize,
        /// Heap before minus heap after (may be negative)
        freed_bytes: i64,
        /// Wall-clock duration
        duration_ms: u64,
    },
    /// A cleanup strategy could not run.
    CleanupFailed {
        /// Strategy level
        level: CleanupLevel,
        /// Why it failed
        error: String,
    },
    /// A recovery attempt started.
    RecoveryAttempt {
        /// Reason key
        reason: String,
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// A recovery attempt succeeded.
    RecoverySuccess {
        /// Reason key
        reason: String,
        /// Attempt number
        attempt: u32,
    },
    /// A recovery attempt failed.
    RecoveryFailed {
        /// Reason key
        reason: String,
        /// Attempt number
        attempt: u32,
        /// Failure description
        error: String,
    },
    /// Recovery gave up after the configured number of attempts.
    RecoveryMaxAttempts {
        /// Attempts made
        attempts: u32,
    },
    /// A shutdown sequence started.
    ShutdownInitiated {
        /// Why
        reason: String,
        /// True for the immediate (no bookkeeping) path
        immediate: bool,
    },
    /// The shutdown state machine entered a new phase.
    ShutdownPhaseChanged {
        /// New phase
        phase: ShutdownPhase,
    },
    /// A shutdown sequence finished.
    ShutdownComplete {
        /// Why it started
        reason: String,
        /// Components that stopped cleanly
        completed: Vec<String>,
        /// Components that failed or timed out
        failed: Vec<String>,
        /// Phase in which the sequence finished
        finished_in: ShutdownPhase,
    },
    /// A managed component was stopped under memory pressure.
    ComponentStopped {
        /// Component name
        name: String,
    },
    /// A stopped component was restarted.
    ComponentRestarted {
        /// Component name
        name: String,
        /// Whether the restart succeeded
        success: bool,
    },
}

impl GuardianEvent {
    /// Canonical `area:kind` name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StackAlert { level, .. } => match level {
                StackLevel::Warning => "stack:warning",
                StackLevel::Critical => "stack:critical",
                StackLevel::Emergency => "stack:emergency",
                StackLevel::Shutdown => "stack:shutdown",
            },
            Self::StackRecovered { .. } => "stack:recovered",
            Self::ExcessivePattern { .. } => "stack:excessive-pattern",
            Self::PerformanceWarning { .. } => "stack:performance",
            Self::MonitoringError { .. } => "stack:monitoring-error",
            Self::RecursionDetected { .. } => "recursion:detected",
            Self::MemoryPressure { level, .. } => match level {
                PressureLevel::Normal => "memory:pressure:normal",
                PressureLevel::Warning => "memory:pressure:warning",
                PressureLevel::Critical => "memory:pressure:critical",
                PressureLevel::Emergency => "memory:pressure:emergency",
            },
            Self::LeakDetected { .. } => "memory:leak-detected",
            Self::EmergencyActionNeeded { .. } => "memory:emergency-action-needed",
            Self::MemoryCorrelation { .. } => "memory:correlation",
            Self::CleanupCompleted { .. } => "memory:cleanup-completed",
            Self::CleanupFailed { .. } => "memory:cleanup-failed",
            Self::RecoveryAttempt { .. } => "recovery:attempt",
            Self::RecoverySuccess { .. } => "recovery:success",
            Self::RecoveryFailed { .. } => "recovery:failed",
            Self::RecoveryMaxAttempts { .. } => "recovery:max-attempts",
            Self::ShutdownInitiated { .. } => "shutdown:initiated",
            Self::ShutdownPhaseChanged { .. } => "shutdown:phase",
            Self::ShutdownComplete { .. } => "shutdown:complete",
            Self::ComponentStopped { .. } => "component:stopped",
            Self::ComponentRestarted { .. } => "component:restarted",
        }
    }
}

/// Broadcast channel for guardian events.
///
/// Cloning the bus shares the underlying channel. Emitting with no
/// subscribers is not an error: the event is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GuardianEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emits an event, returning the number of subscribers that received it.
    pub fn emit(&self, event: GuardianEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(event = name, "no subscribers for guardian event");
                0
            }
        }
    }

    /// Subscribes to all events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GuardianEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drains every event currently buffered in `rx` without waiting.
///
/// Lagged notifications are skipped; the remaining events are returned in
/// emission order.
pub fn drain_events(rx: &mut broadcast::Receiver<GuardianEvent>) -> Vec<GuardianEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        let delivered = bus.emit(GuardianEvent::StackRecovered { depth: 3 });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_emit_and_drain_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(GuardianEvent::RecoveryAttempt {
            reason: "recursion".to_string(),
            attempt: 1,
        });
        bus.emit(GuardianEvent::RecoverySuccess {
            reason: "recursion".to_string(),
            attempt: 1,
        });

        let names: Vec<_> = drain_events(&mut rx).iter().map(GuardianEvent::name).collect();
        assert_eq!(names, vec!["recovery:attempt", "recovery:success"]);
    }

    #[test]
    fn test_event_names_follow_levels() {
        let event = GuardianEvent::MemoryPressure {
            level: PressureLevel::Critical,
            heap_percent: 0.9,
            heap_used: 900,
            rss: 1000,
        };
        assert_eq!(event.name(), "memory:pressure:critical");

        let event = GuardianEvent::StackAlert {
            level: StackLevel::Shutdown,
            depth: 600,
            threshold: 500,
            top_function: Some("f".to_string()),
        };
        assert_eq!(event.name(), "stack:shutdown");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = GuardianEvent::RecoveryMaxAttempts { attempts: 3 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"recovery_max_attempts\""));
        let back: GuardianEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_lagging_subscriber_keeps_latest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for depth in 0..5 {
            bus.emit(GuardianEvent::StackRecovered { depth });
        }
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], GuardianEvent::StackRecovered { depth: 4 });
    }
}
