//! Bounded TTL cache for analysis results.
//!
//! ## Eviction Policy
//!
//! | Trigger | Action |
//! |---------|--------|
//! | Entry older than TTL | Dropped on lookup or by [`TtlCache::purge_expired`] |
//! | Insert at capacity | Oldest 20% of entries evicted |
//! | Periodic cleanup | [`TtlCache::purge_older_than`] with a caller-chosen cutoff |

use std::collections::HashMap;

/// Share of entries evicted when the cache is full.
const EVICTION_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: u64,
}

/// Bounded map from signature hash to a cached value.
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    entries: HashMap<u64, Entry<V>>,
    capacity: usize,
    ttl_ms: u64,
    hits: u64,
    misses: u64,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed or found an expired entry.
    pub misses: u64,
}

impl<V: Clone> TtlCache<V> {
    /// Creates a cache holding at most `capacity` entries for `ttl_ms`.
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl_ms,
            hits: 0,
            misses: 0,
        }
    }

    /// Looks up `key`, counting a hit or a miss. Expired entries are removed.
    pub fn get(&mut self, key: u64, now_ms: u64) -> Option<V> {
        let expired = match self.entries.get(&key) {
            Some(entry) if now_ms.saturating_sub(entry.inserted_at) <= self.ttl_ms => {
                self.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&key);
        }
        self.misses += 1;
        None
    }

    /// Inserts `value`, evicting the oldest entries first if full.
    pub fn insert(&mut self, key: u64, value: V, now_ms: u64) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now_ms,
            },
        );
    }

    /// Evicts the oldest 20% of entries (at least one). Returns the count.
    pub fn evict_oldest(&mut self) -> usize {
        let count = ((self.entries.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        let mut by_age: Vec<(u64, u64)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.inserted_at, *k))
            .collect();
        by_age.sort_unstable();
        let mut evicted = 0;
        for (_, key) in by_age.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Removes entries past their TTL.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        self.purge_older_than(now_ms.saturating_sub(self.ttl_ms))
    }

    /// Removes entries inserted before `cutoff_ms`.
    pub fn purge_older_than(&mut self, cutoff_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.inserted_at >= cutoff_ms);
        before - self.entries.len()
    }

    /// Removes everything. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss_counters() {
        let mut cache = TtlCache::new(10, 1_000);
        assert_eq!(cache.get(1, 0), None);
        cache.insert(1, "one", 0);
        assert_eq!(cache.get(1, 500), Some("one"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let mut cache = TtlCache::new(10, 1_000);
        cache.insert(1, 1u32, 0);
        assert_eq!(cache.get(1, 1_001), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_full_cache_evicts_oldest_fifth() {
        let mut cache = TtlCache::new(10, u64::MAX);
        for i in 0..10 {
            cache.insert(i, i, i);
        }
        cache.insert(100, 100, 100);

        // 2 of 10 evicted, then the new entry added.
        assert_eq!(cache.len(), 9);
        assert_eq!(cache.get(0, 100), None);
        assert_eq!(cache.get(1, 100), None);
        assert_eq!(cache.get(2, 100), Some(2));
        assert_eq!(cache.get(100, 100), Some(100));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut cache = TtlCache::new(2, u64::MAX);
        cache.insert(1, 1, 0);
        cache.insert(2, 2, 1);
        cache.insert(2, 3, 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1, 2), Some(1));
    }

    #[test]
    fn test_purge_older_than() {
        let mut cache = TtlCache::new(10, u64::MAX);
        cache.insert(1, (), 10);
        cache.insert(2, (), 20);
        assert_eq!(cache.purge_older_than(15), 1);
        assert_eq!(cache.len(), 1);
    }
}
