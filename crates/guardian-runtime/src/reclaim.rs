//! Forced collection.
//!
//! Rust has no garbage collector to poke, so "force a collection" means
//! running every reclaim hook the host registered (arena resets,
//! `shrink_to_fit` passes, allocator trims) and measuring heap before and
//! after through the probe. The recorded passes feed the sampler's
//! collection-efficiency metric.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::probe::MemoryProbe;

const HISTORY_LIMIT: usize = 64;

type ReclaimFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// One forced collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    /// When the pass ran (epoch ms).
    pub at_ms: u64,
    /// Heap bytes before the pass.
    pub heap_before: u64,
    /// Heap bytes after the pass.
    pub heap_after: u64,
    /// Bytes the hooks reported releasing.
    pub reported_released: u64,
}

impl CollectionRecord {
    /// Fraction of the pre-pass heap that was freed, in `[0, 1]`.
    #[must_use]
    pub fn efficiency(&self) -> f64 {
        if self.heap_before == 0 {
            0.0
        } else {
            self.heap_before.saturating_sub(self.heap_after) as f64 / self.heap_before as f64
        }
    }
}

/// Aggregate collection counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Passes run since creation.
    pub passes: u64,
    /// Sum of heap bytes freed across passes.
    pub freed_total: u64,
    /// Most recent passes, oldest first.
    pub recent: Vec<CollectionRecord>,
}

#[derive(Default)]
struct ReclaimerInner {
    hooks: Vec<(String, ReclaimFn)>,
    history: VecDeque<CollectionRecord>,
    passes: u64,
    freed_total: u64,
}

/// Registry of reclaim hooks plus a history of forced passes.
#[derive(Clone)]
pub struct Reclaimer {
    inner: Arc<Mutex<ReclaimerInner>>,
    probe: Arc<dyn MemoryProbe>,
    clock: SharedClock,
}

impl Reclaimer {
    /// Creates a reclaimer measuring through `probe`.
    pub fn new(probe: Arc<dyn MemoryProbe>, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReclaimerInner::default())),
            probe,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReclaimerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a hook. The hook returns the bytes it believes it released.
    pub fn register(&self, name: impl Into<String>, hook: impl Fn() -> u64 + Send + Sync + 'static) {
        let name = name.into();
        debug!(hook = %name, "reclaim hook registered");
        self.lock().hooks.push((name, Arc::new(hook)));
    }

    /// Number of registered hooks.
    pub fn hook_count(&self) -> usize {
        self.lock().hooks.len()
    }

    /// Runs every hook once and records the pass.
    ///
    /// A panicking hook is logged and skipped; the remaining hooks still run.
    pub fn force_collect(&self) -> CollectionRecord {
        let hooks: Vec<_> = self.lock().hooks.clone();
        let heap_before = self.probe.read().heap_used;

        let mut reported_released = 0u64;
        for (name, hook) in hooks {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook())) {
                Ok(bytes) => reported_released = reported_released.saturating_add(bytes),
                Err(_) => warn!(hook = %name, "reclaim hook panicked"),
            }
        }

        let heap_after = self.probe.read().heap_used;
        let record = CollectionRecord {
            at_ms: self.clock.now_ms(),
            heap_before,
            heap_after,
            reported_released,
        };

        let mut inner = self.lock();
        inner.passes += 1;
        inner.freed_total += heap_before.saturating_sub(heap_after);
        if inner.history.len() >= HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(record);
        drop(inner);

        debug!(
            heap_before,
            heap_after,
            reported_released,
            "forced collection pass"
        );
        record
    }

    /// Records a pass measured elsewhere (for example by an allocator trim
    /// the host performed itself).
    pub fn record(&self, record: CollectionRecord) {
        let mut inner = self.lock();
        inner.passes += 1;
        inner.freed_total += record.heap_before.saturating_sub(record.heap_after);
        if inner.history.len() >= HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(record);
    }

    /// Passes recorded at or after `since_ms`.
    pub fn records_since(&self, since_ms: u64) -> Vec<CollectionRecord> {
        self.lock()
            .history
            .iter()
            .filter(|r| r.at_ms >= since_ms)
            .copied()
            .collect()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> CollectionStats {
        let inner = self.lock();
        CollectionStats {
            passes: inner.passes,
            freed_total: inner.freed_total,
            recent: inner.history.iter().copied().collect(),
        }
    }

    /// Clears counters and history, keeping the hooks.
    pub fn reset_counters(&self) {
        let mut inner = self.lock();
        inner.passes = 0;
        inner.freed_total = 0;
        inner.history.clear();
    }
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Reclaimer")
            .field("hooks", &inner.hooks.len())
            .field("passes", &inner.passes)
            .finish()
    }
}
