//! Severity ladders shared by the monitors, the cleanup manager and the
//! shutdown engine.
//!
//! Every ladder derives `Ord` so escalation checks read as plain
//! comparisons (`level >= PressureLevel::Critical`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call-stack depth severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackLevel {
    /// Depth crossed the warning threshold.
    Warning,
    /// Depth crossed the critical threshold.
    Critical,
    /// Depth crossed the emergency threshold; recovery is attempted.
    Emergency,
    /// Depth crossed the shutdown threshold; the process is torn down.
    Shutdown,
}

impl StackLevel {
    /// All levels, most severe first. Threshold evaluation walks this order.
    pub const DESCENDING: [StackLevel; 4] = [
        StackLevel::Shutdown,
        StackLevel::Emergency,
        StackLevel::Critical,
        StackLevel::Warning,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for StackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory pressure classification.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    /// Below every threshold.
    #[default]
    Normal,
    /// Heap usage at or above the warning threshold.
    Warning,
    /// Heap usage at or above the critical threshold.
    Critical,
    /// Heap, RSS or external memory at emergency level.
    Emergency,
}

impl PressureLevel {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalating cleanup strategy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupLevel {
    /// Evict expired entries, trim histories.
    Gentle,
    /// Halve bounded collections, drain queues.
    Moderate,
    /// Clear oversized collections, reset transient state.
    Aggressive,
    /// Stop non-essential services, clear everything, force collection.
    Emergency,
}

impl CleanupLevel {
    /// All levels in escalation order.
    pub const ALL: [CleanupLevel; 4] = [
        CleanupLevel::Gentle,
        CleanupLevel::Moderate,
        CleanupLevel::Aggressive,
        CleanupLevel::Emergency,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gentle => "gentle",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for CleanupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of recursion reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecursionType {
    /// One function appears many times.
    Direct,
    /// A window of frames repeats back to back.
    Indirect,
    /// Two functions call each other.
    Mutual,
    /// A generic n-gram repeats.
    Pattern,
    /// The chain is long relative to its distinct functions.
    DeepChain,
}

impl RecursionType {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Indirect => "indirect",
            Self::Mutual => "mutual",
            Self::Pattern => "pattern",
            Self::DeepChain => "deep_chain",
        }
    }
}

impl fmt::Display for RecursionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the shutdown state machine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    /// No shutdown in progress.
    #[default]
    Idle,
    /// Sequential, priority-ordered shutdown.
    Graceful,
    /// Concurrent, timeout-raced shutdown.
    Force,
    /// Shutdown finished.
    Complete,
}

impl ShutdownPhase {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Graceful => "graceful",
            Self::Force => "force",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
