//! Raw memory statistics.
//!
//! A [`MemoryProbe`] reports heap, resident and system memory figures.
//! [`ProcessProbe`] reads them from `/proc` on Linux and, when the host
//! installs [`TrackingAllocator`] as its global allocator, uses the exact
//! live-heap figure instead of the data-segment estimate.
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: guardian_runtime::TrackingAllocator = guardian_runtime::TrackingAllocator;
//! ```

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Memory figures in bytes, as read by a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMemoryStats {
    /// Heap bytes in use.
    pub heap_used: u64,
    /// Heap bytes reserved.
    pub heap_total: u64,
    /// Heap budget the process must stay under.
    pub heap_limit: u64,
    /// Resident set size.
    pub rss: u64,
    /// Memory held outside the heap (attributed by components).
    pub external: u64,
    /// Large I/O buffers.
    pub buffers: u64,
    /// Total system memory.
    pub system_total: u64,
    /// Available system memory.
    pub system_available: u64,
}

impl RawMemoryStats {
    /// Heap usage relative to the limit, in `[0, 1]` (0 when unknown).
    #[must_use]
    pub fn heap_percent(&self) -> f64 {
        if self.heap_limit == 0 {
            0.0
        } else {
            (self.heap_used as f64 / self.heap_limit as f64).min(1.0)
        }
    }

    /// System memory in use, in `[0, 1]` (0 when unknown).
    #[must_use]
    pub fn system_percent(&self) -> f64 {
        if self.system_total == 0 {
            0.0
        } else {
            let used = self.system_total.saturating_sub(self.system_available);
            used as f64 / self.system_total as f64
        }
    }
}

/// Source of raw memory statistics.
pub trait MemoryProbe: Send + Sync {
    /// Reads current statistics. Must be cheap and must not fail; missing
    /// figures are reported as zero.
    fn read(&self) -> RawMemoryStats;
}

static LIVE_HEAP: AtomicU64 = AtomicU64::new(0);

/// Global allocator wrapper counting live heap bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator;

impl TrackingAllocator {
    /// Live heap bytes allocated through this allocator (0 if not installed).
    #[must_use]
    pub fn live_bytes() -> u64 {
        LIVE_HEAP.load(Ordering::Relaxed)
    }
}

// SAFETY: every call is forwarded to the system allocator unchanged; the
// counter is updated only after a successful allocation.
unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            LIVE_HEAP.fetch_add(layout.size() as u64, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            LIVE_HEAP.fetch_add(layout.size() as u64, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        LIVE_HEAP.fetch_sub(layout.size() as u64, Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            let old = layout.size() as u64;
            let new = new_size as u64;
            if new > old {
                LIVE_HEAP.fetch_add(new - old, Ordering::Relaxed);
            } else {
                LIVE_HEAP.fetch_sub(old - new, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

/// Probe reading the current process from `/proc`.
///
/// On non-Linux targets every figure except the tracked heap reads as zero.
#[derive(Debug, Clone, Default)]
pub struct ProcessProbe {
    heap_limit: Option<u64>,
}

impl ProcessProbe {
    /// Creates a probe. Without an explicit heap limit, total system memory
    /// is used as the limit.
    #[must_use]
    pub fn new(heap_limit: Option<u64>) -> Self {
        Self { heap_limit }
    }
}

impl MemoryProbe for ProcessProbe {
    fn read(&self) -> RawMemoryStats {
        let status = ProcStatus::read();
        let (system_total, system_available) = read_meminfo();
        let tracked = TrackingAllocator::live_bytes();
        let heap_used = if tracked > 0 { tracked } else { status.data };
        RawMemoryStats {
            heap_used,
            heap_total: status.data.max(heap_used),
            heap_limit: self.heap_limit.unwrap_or(system_total),
            rss: status.rss,
            external: 0,
            buffers: 0,
            system_total,
            system_available,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ProcStatus {
    rss: u64,
    data: u64,
}

impl ProcStatus {
    fn read() -> Self {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string("/proc/self/status")
                .map(|s| parse_status(&s))
                .unwrap_or_default()
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::default()
        }
    }
}

fn read_meminfo() -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/meminfo")
            .map(|s| parse_meminfo(&s))
            .unwrap_or((0, 0))
    }
    #[cfg(not(target_os = "linux"))]
    {
        (0, 0)
    }
}

fn parse_status(contents: &str) -> ProcStatus {
    let mut status = ProcStatus::default();
    for line in contents.lines() {
        if let Some(v) = line.strip_prefix("VmRSS:") {
            status.rss = parse_kb(v);
        } else if let Some(v) = line.strip_prefix("VmData:") {
            status.data = parse_kb(v);
        }
    }
    status
}

fn parse_meminfo(contents: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = 0;
    for line in contents.lines() {
        if let Some(v) = line.strip_prefix("MemTotal:") {
            total = parse_kb(v);
        } else if let Some(v) = line.strip_prefix("MemAvailable:") {
            available = parse_kb(v);
        }
    }
    (total, available)
}

/// Parses a `/proc` value such as `  12345 kB` into bytes.
fn parse_kb(value: &str) -> u64 {
    value
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Probe returning whatever figures were last set. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualProbe {
    stats: Arc<Mutex<RawMemoryStats>>,
}

impl ManualProbe {
    /// Creates a probe reporting `stats`.
    #[must_use]
    pub fn new(stats: RawMemoryStats) -> Self {
        Self {
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Replaces the reported figures.
    pub fn set(&self, stats: RawMemoryStats) {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner()) = stats;
    }

    /// Adjusts the reported figures in place.
    pub fn update(&self, f: impl FnOnce(&mut RawMemoryStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }
}

impl MemoryProbe for ManualProbe {
    fn read(&self) -> RawMemoryStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_extracts_rss_and_data() {
        let contents = "Name:\tguardian\nVmData:\t  2048 kB\nVmRSS:\t    1024 kB\n";
        let status = parse_status(contents);
        assert_eq!(status.rss, 1024 * 1024);
        assert_eq!(status.data, 2048 * 1024);
    }

    #[test]
    fn test_parse_meminfo() {
        let contents = "MemTotal:       16000 kB\nMemFree:  100 kB\nMemAvailable:    4000 kB\n";
        assert_eq!(parse_meminfo(contents), (16000 * 1024, 4000 * 1024));
    }

    #[test]
    fn test_parse_kb_rejects_garbage() {
        assert_eq!(parse_kb("not a number"), 0);
    }

    #[test]
    fn test_percentages() {
        let stats = RawMemoryStats {
            heap_used: 97,
            heap_limit: 100,
            system_total: 1000,
            system_available: 250,
            ..RawMemoryStats::default()
        };
        assert!((stats.heap_percent() - 0.97).abs() < 1e-9);
        assert!((stats.system_percent() - 0.75).abs() < 1e-9);
        assert_eq!(RawMemoryStats::default().heap_percent(), 0.0);
    }

    #[test]
    fn test_manual_probe_shared_updates() {
        let probe = ManualProbe::default();
        let other = probe.clone();
        probe.update(|s| s.heap_used = 42);
        assert_eq!(other.read().heap_used, 42);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_probe_reads_self() {
        let stats = ProcessProbe::new(None).read();
        assert!(stats.rss > 0);
        assert!(stats.system_total > 0);
    }
}
