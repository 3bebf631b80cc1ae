//! Emergency state and shutdown counters.

use std::collections::BTreeSet;

use guardian_runtime::ShutdownPhase;
use serde::{Deserialize, Serialize};

/// Bookkeeping for the current (or last) shutdown sequence.
///
/// There is at most one of these per engine; `phase != Idle` means a
/// sequence is in progress or awaiting recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    /// Current phase.
    pub phase: ShutdownPhase,
    /// Why the sequence started.
    pub reason: Option<String>,
    /// When the sequence started (epoch ms).
    pub started_at_ms: Option<u64>,
    /// Components that stopped cleanly.
    pub completed: BTreeSet<String>,
    /// Components that failed or timed out.
    pub failed: BTreeSet<String>,
    /// Recovery attempts made so far.
    pub recovery_attempts: u32,
}

impl EmergencyState {
    /// Returns true unless the engine is idle.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase != ShutdownPhase::Idle
    }

    pub(crate) fn begin(&mut self, reason: &str, now_ms: u64) {
        *self = Self {
            phase: ShutdownPhase::Graceful,
            reason: Some(reason.to_string()),
            started_at_ms: Some(now_ms),
            ..Self::default()
        };
    }

    pub(crate) fn mark_completed(&mut self, name: &str) {
        self.failed.remove(name);
        self.completed.insert(name.to_string());
    }

    pub(crate) fn mark_failed(&mut self, name: &str) {
        self.completed.remove(name);
        self.failed.insert(name.to_string());
    }
}

/// Aggregate counters kept across shutdown sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownStats {
    /// Sequences started.
    pub initiated: u64,
    /// Sequences finished in the graceful phase.
    pub graceful_completed: u64,
    /// Sequences finished in the force phase.
    pub force_completed: u64,
    /// Immediate terminations requested.
    pub immediate_terminations: u64,
    /// Component handlers that succeeded.
    pub components_stopped: u64,
    /// Component handlers that failed or timed out.
    pub components_failed: u64,
    /// Recovery attempts across all sequences.
    pub recovery_attempts: u64,
    /// Recovery attempts that returned the engine to idle.
    pub recoveries_succeeded: u64,
    /// Duration of the last finished sequence.
    pub last_duration_ms: u64,
}
