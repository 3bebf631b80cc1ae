//! # Shutdown Snapshot Store
//!
//! Persists the guardian's own bookkeeping across a shutdown so recovery can
//! tell which components stopped cleanly and which need repair.
//!
//! ## Storage Layout
//!
//! ```text
//! <state_dir>/
//! └── shutdown-snapshot.json      # last ShutdownSnapshot, pretty JSON
//! ```
//!
//! ## Security Notes
//!
//! - Writes go to a sibling temp file first and are moved into place with a
//!   rename, so a crash mid-write never leaves a truncated snapshot.
//! - A corrupt snapshot is reported as an error, never silently replaced.

use std::fs;
use std::path::{Path, PathBuf};

use guardian_runtime::ShutdownPhase;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::state::ShutdownStats;
use crate::Result;

/// File name of the snapshot inside the state directory.
pub const SNAPSHOT_FILE: &str = "shutdown-snapshot.json";

/// What the engine knew at the moment of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSnapshot {
    /// Identifier shared by every snapshot of one shutdown sequence.
    pub incident_id: Uuid,
    /// When the snapshot was taken (epoch ms).
    pub timestamp_ms: u64,
    /// Why the shutdown started.
    pub reason: String,
    /// Phase reached when the snapshot was written.
    pub phase: ShutdownPhase,
    /// Components that stopped cleanly.
    pub completed: Vec<String>,
    /// Components that failed or timed out.
    pub failed: Vec<String>,
    /// Engine counters at snapshot time.
    pub stats: ShutdownStats,
}

/// JSON-file snapshot store.
///
/// # Example
///
/// ```rust
/// use guardian_shutdown::SnapshotStore;
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = SnapshotStore::open(dir.path()).unwrap();
/// assert!(store.load().unwrap().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Io`](crate::ShutdownError::Io) if the
    /// directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Full path of the snapshot file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Writes `snapshot`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Fails on serialization or I/O errors.
    pub fn save(&self, snapshot: &ShutdownSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path())?;
        debug!(
            incident = %snapshot.incident_id,
            phase = %snapshot.phase,
            "shutdown snapshot saved"
        );
        Ok(())
    }

    /// Reads the last snapshot, if one exists.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<ShutdownSnapshot>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Removes the snapshot. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<bool> {
        let path = self.path();
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
