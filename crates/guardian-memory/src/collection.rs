//! Collections the cleanup manager can shrink.
//!
//! Hosts register each cache, history or queue as a [`ManagedCollection`]
//! trait object tagged with a [`CollectionKind`]. Strategies pick their
//! targets by kind, so one handler serves arbitrary collection types.
//!
//! Implementations are provided for `Mutex<Vec<T>>`, `Mutex<VecDeque<T>>`
//! and `Mutex<HashMap<K, V>>` (oldest entries are at the front of the
//! sequences), plus [`TimedQueue`], which also evicts expired entries.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use guardian_runtime::SharedClock;
use serde::{Deserialize, Serialize};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// What a registered collection holds, which decides the strategies that
/// touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Recomputable cached values.
    Cache,
    /// Capped history of past events.
    History,
    /// Pending work.
    Queue,
    /// Records of finished jobs.
    JobHistory,
    /// Per-request or per-session scratch state.
    Transient,
    /// Decoded media and other large blobs.
    Media,
    /// Statistics and counters.
    Counter,
}

impl CollectionKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::History => "history",
            Self::Queue => "queue",
            Self::JobHistory => "job_history",
            Self::Transient => "transient",
            Self::Media => "media",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collection the cleanup manager may shrink.
///
/// Every method returns the number of entries removed.
pub trait ManagedCollection: Send + Sync {
    /// Live entries.
    fn len(&self) -> usize;

    /// Returns true when empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries past their expiry. Collections without expiry do nothing.
    fn evict_expired(&self) -> usize {
        0
    }

    /// Keeps at most `keep` entries, preferring the newest.
    fn truncate(&self, keep: usize) -> usize;

    /// Drops every entry.
    fn clear(&self) -> usize {
        self.truncate(0)
    }
}

impl<T: Send> ManagedCollection for Mutex<Vec<T>> {
    fn len(&self) -> usize {
        lock(self).len()
    }

    fn truncate(&self, keep: usize) -> usize {
        let mut items = lock(self);
        let excess = items.len().saturating_sub(keep);
        items.drain(..excess);
        excess
    }
}

impl<T: Send> ManagedCollection for Mutex<VecDeque<T>> {
    fn len(&self) -> usize {
        lock(self).len()
    }

    fn truncate(&self, keep: usize) -> usize {
        let mut items = lock(self);
        let excess = items.len().saturating_sub(keep);
        items.drain(..excess);
        excess
    }
}

impl<K, V> ManagedCollection for Mutex<HashMap<K, V>>
where
    K: Eq + Hash + Send,
    V: Send,
{
    fn len(&self) -> usize {
        lock(self).len()
    }

    fn truncate(&self, keep: usize) -> usize {
        let mut map = lock(self);
        let excess = map.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }
        if keep == 0 {
            map.clear();
            return excess;
        }
        // Maps have no age order; drop arbitrary entries.
        let mut seen = 0;
        map.retain(|_, _| {
            seen += 1;
            seen > excess
        });
        excess
    }
}

/// A FIFO whose entries expire after a fixed time to live.
///
/// # Example
///
/// ```rust
/// use guardian_memory::{ManagedCollection, TimedQueue};
/// use guardian_runtime::ManualClock;
///
/// let clock = ManualClock::new(0);
/// let queue = TimedQueue::new(1_000, clock.shared());
/// queue.push("a");
/// clock.advance(1_500);
/// queue.push("b");
/// assert_eq!(queue.evict_expired(), 1);
/// assert_eq!(queue.snapshot(), vec!["b"]);
/// ```
pub struct TimedQueue<T> {
    items: Mutex<VecDeque<(u64, T)>>,
    ttl_ms: u64,
    clock: SharedClock,
}

impl<T> TimedQueue<T> {
    /// Creates an empty queue whose entries live `ttl_ms`.
    pub fn new(ttl_ms: u64, clock: SharedClock) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ttl_ms,
            clock,
        }
    }

    /// Appends `item` stamped with the current time.
    pub fn push(&self, item: T) {
        let now = self.clock.now_ms();
        lock(&self.items).push_back((now, item));
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&self) -> Option<T> {
        lock(&self.items).pop_front().map(|(_, item)| item)
    }

    /// Removes and returns every entry, oldest first.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.items).drain(..).map(|(_, item)| item).collect()
    }
}

impl<T: Clone> TimedQueue<T> {
    /// Copies of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.items).iter().map(|(_, item)| item.clone()).collect()
    }
}

impl<T: Send> ManagedCollection for TimedQueue<T> {
    fn len(&self) -> usize {
        lock(&self.items).len()
    }

    fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|(at, _)| now.saturating_sub(*at) < self.ttl_ms);
        before - items.len()
    }

    fn truncate(&self, keep: usize) -> usize {
        let mut items = lock(&self.items);
        let excess = items.len().saturating_sub(keep);
        items.drain(..excess);
        excess
    }
}

impl<T> fmt::Debug for TimedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedQueue")
            .field("len", &lock(&self.items).len())
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}
