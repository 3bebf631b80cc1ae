//! # Pattern Analyzer
//!
//! Best-effort structural analysis of captured stacks: direct repetition
//! counts, repeating subsequences, hot caller→callee sequences and
//! per-function performance history.
//!
//! ## Failure Semantics
//!
//! Analysis never fails outward. Unparseable input and panics inside the
//! analysis both produce a [`PatternAnalysis`] with `is_valid == false`.
//!
//! ## Example
//!
//! ```rust
//! use guardian_runtime::ManualClock;
//! use guardian_stack::{PatternAnalyzer, PatternConfig};
//!
//! let mut analyzer = PatternAnalyzer::new(PatternConfig::new(), ManualClock::new(0).shared());
//! let trace = "a@src/x.rs:1:1\nb@src/x.rs:2:1\na@src/x.rs:1:1\nb@src/x.rs:2:1\na@src/x.rs:1:1\nb@src/x.rs:2:1\n";
//!
//! let analysis = analyzer.analyze_pattern(trace);
//! assert!(analysis.is_valid);
//! let pattern = analysis.repeating_pattern.unwrap();
//! assert_eq!(pattern.sequence, vec!["a".to_string(), "b".to_string()]);
//! assert_eq!(pattern.occurrences, 3);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use guardian_runtime::SharedClock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheStats, TtlCache};
use crate::frame::{Frame, FrameParser};
use crate::signature::StackSignature;

/// Tracked caller→callee pairs before counts are decayed.
const MAX_TRACKED_SEQUENCES: usize = 4_096;

/// Tuning for [`PatternAnalyzer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Shortest repeating subsequence searched.
    pub min_pattern_length: usize,
    /// Longest repeating subsequence searched.
    pub max_pattern_length: usize,
    /// Occurrences a subsequence needs to be reported.
    pub min_pattern_repetitions: usize,
    /// Cumulative frequency at which a caller→callee pair is "hot".
    pub hot_sequence_threshold: u64,
    /// Cached analyses kept.
    pub cache_size: usize,
    /// Lifetime of a cached analysis.
    pub cache_ttl_ms: u64,
    /// Metrics kept per function.
    pub metrics_window: usize,
    /// Extra prefixes classified as library code.
    pub library_prefixes: Vec<String>,
}

impl PatternConfig {
    /// Creates a config with the default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min_pattern_length: 2,
            max_pattern_length: 20,
            min_pattern_repetitions: 3,
            hot_sequence_threshold: 10,
            cache_size: 500,
            cache_ttl_ms: 60_000,
            metrics_window: 100,
            library_prefixes: Vec::new(),
        }
    }

    /// Sets the hot-sequence threshold.
    #[must_use]
    pub fn with_hot_sequence_threshold(mut self, threshold: u64) -> Self {
        self.hot_sequence_threshold = threshold;
        self
    }

    /// Sets the minimum repetitions for a reported subsequence.
    #[must_use]
    pub fn with_min_pattern_repetitions(mut self, repetitions: usize) -> Self {
        self.min_pattern_repetitions = repetitions;
        self
    }

    /// Sets cache capacity and TTL.
    #[must_use]
    pub fn with_cache(mut self, size: usize, ttl_ms: u64) -> Self {
        self.cache_size = size;
        self.cache_ttl_ms = ttl_ms;
        self
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A subsequence that repeats within one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatingPattern {
    /// Function names, innermost first.
    pub sequence: Vec<String>,
    /// Occurrences (overlapping windows counted once per position).
    pub occurrences: usize,
}

/// A caller→callee pair seen often across analyses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotSequence {
    /// Calling function.
    pub caller: String,
    /// Called function.
    pub callee: String,
    /// Cumulative occurrences.
    pub frequency: u64,
}

impl HotSequence {
    /// `caller -> callee`.
    pub fn label(&self) -> String {
        format!("{} -> {}", self.caller, self.callee)
    }
}

/// Historical cost of a function present in the stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCorrelation {
    /// Function name.
    pub function: String,
    /// Recorded samples.
    pub samples: usize,
    /// Mean duration.
    pub avg_duration_ms: f64,
    /// Mean memory delta (bytes, may be negative).
    pub avg_memory_delta: f64,
}

/// Result of [`PatternAnalyzer::analyze_pattern`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    /// False when the input could not be analysed.
    pub is_valid: bool,
    /// Why analysis failed.
    pub error: Option<String>,
    /// Stack signature.
    pub signature: Option<StackSignature>,
    /// Frame count.
    pub depth: usize,
    /// Functions appearing more than once, with their counts.
    pub direct_repetitions: BTreeMap<String, usize>,
    /// Most frequent repeating subsequence meeting the repetition bar.
    pub repeating_pattern: Option<RepeatingPattern>,
    /// Pairs at or above the hot threshold, most frequent first.
    pub hot_sequences: Vec<HotSequence>,
    /// History for functions in this stack that have recorded metrics.
    pub correlations: Vec<FunctionCorrelation>,
    /// Answered from the cache.
    pub from_cache: bool,
}

impl PatternAnalysis {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
            signature: None,
            depth: 0,
            direct_repetitions: BTreeMap::new(),
            repeating_pattern: None,
            hot_sequences: Vec::new(),
            correlations: Vec::new(),
            from_cache: false,
        }
    }

    /// Most frequent hot sequence, if any.
    pub fn hottest(&self) -> Option<&HotSequence> {
        self.hot_sequences.first()
    }
}

#[derive(Debug, Clone, Copy)]
struct MetricSample {
    duration_ms: f64,
    memory_delta: i64,
}

/// Analyzer with its caches and rolling tables.
#[derive(Debug)]
pub struct PatternAnalyzer {
    config: PatternConfig,
    parser: FrameParser,
    clock: SharedClock,
    cache: TtlCache<PatternAnalysis>,
    sequences: HashMap<(String, String), u64>,
    metrics: HashMap<String, VecDeque<MetricSample>>,
    analyses: u64,
    failures: u64,
}

impl PatternAnalyzer {
    /// Creates an analyzer.
    pub fn new(config: PatternConfig, clock: SharedClock) -> Self {
        let parser = FrameParser::new().with_library_prefixes(config.library_prefixes.clone());
        Self {
            cache: TtlCache::new(config.cache_size, config.cache_ttl_ms),
            config,
            parser,
            clock,
            sequences: HashMap::new(),
            metrics: HashMap::new(),
            analyses: 0,
            failures: 0,
        }
    }

    /// Parser configured for this analyzer.
    pub fn parser(&self) -> &FrameParser {
        &self.parser
    }

    /// Parses and analyses a raw capture.
    pub fn analyze_pattern(&mut self, raw_trace: &str) -> PatternAnalysis {
        let frames = self.parser.parse(raw_trace);
        if frames.is_empty() {
            self.failures += 1;
            debug!("pattern analysis skipped: no frames recognised");
            return PatternAnalysis::invalid("no frames recognised");
        }
        self.analyze_frames(&frames)
    }

    /// Analyses already parsed frames.
    pub fn analyze_frames(&mut self, frames: &[Frame]) -> PatternAnalysis {
        self.analyses += 1;
        match catch_unwind(AssertUnwindSafe(|| self.analyze_inner(frames))) {
            Ok(analysis) => analysis,
            Err(panic) => {
                self.failures += 1;
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "analysis panicked".to_string());
                warn!(error = %message, "pattern analysis failed");
                PatternAnalysis::invalid(message)
            }
        }
    }

    fn analyze_inner(&mut self, frames: &[Frame]) -> PatternAnalysis {
        if frames.is_empty() {
            return PatternAnalysis::invalid("empty stack");
        }
        let now = self.clock.now_ms();
        let signature = StackSignature::of(frames);

        // Sequence counts accumulate on every analysis, cached or not.
        self.track_sequences(frames);
        let hot_sequences = self.hot_sequences();
        let correlations = self.correlations(frames);

        if let Some(mut cached) = self.cache.get(signature.hash, now) {
            cached.hot_sequences = hot_sequences;
            cached.correlations = correlations;
            cached.from_cache = true;
            return cached;
        }

        let names: Vec<&str> = frames.iter().map(|f| f.function.as_str()).collect();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for name in &names {
            *counts.entry((*name).to_string()).or_insert(0) += 1;
        }
        counts.retain(|_, c| *c > 1);

        let analysis = PatternAnalysis {
            is_valid: true,
            error: None,
            depth: frames.len(),
            direct_repetitions: counts,
            repeating_pattern: self.find_repeating_pattern(&names),
            hot_sequences,
            correlations,
            from_cache: false,
            signature: Some(signature.clone()),
        };
        self.cache.insert(signature.hash, analysis.clone(), now);
        analysis
    }

    /// Sliding-window search for the most frequent subsequence. Ties prefer
    /// the longer pattern.
    fn find_repeating_pattern(&self, names: &[&str]) -> Option<RepeatingPattern> {
        let max_len = self.config.max_pattern_length.min(names.len() / 2);
        let mut best: Option<(usize, &[&str])> = None;

        for len in self.config.min_pattern_length.max(2)..=max_len {
            let mut windows: HashMap<&[&str], usize> = HashMap::new();
            for window in names.windows(len) {
                // Single-function runs are direct repetition, not a pattern.
                if window.iter().all(|n| *n == window[0]) {
                    continue;
                }
                *windows.entry(window).or_insert(0) += 1;
            }
            for (window, count) in windows {
                if count < self.config.min_pattern_repetitions {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_count, best_window)) => {
                        count > best_count || (count == best_count && len > best_window.len())
                    }
                };
                if better {
                    best = Some((count, window));
                }
            }
        }

        best.map(|(occurrences, window)| RepeatingPattern {
            sequence: window.iter().map(|s| (*s).to_string()).collect(),
            occurrences,
        })
    }

    fn track_sequences(&mut self, frames: &[Frame]) {
        // Frames are innermost first, so frames[i + 1] called frames[i].
        for pair in frames.windows(2) {
            let key = (pair[1].function.clone(), pair[0].function.clone());
            *self.sequences.entry(key).or_insert(0) += 1;
        }
        if self.sequences.len() > MAX_TRACKED_SEQUENCES {
            self.decay_sequences();
        }
    }

    /// Halves every tracked count and drops pairs that reach zero.
    pub fn decay_sequences(&mut self) {
        for count in self.sequences.values_mut() {
            *count /= 2;
        }
        self.sequences.retain(|_, c| *c > 0);
    }

    /// Pairs at or above the hot threshold, most frequent first.
    pub fn hot_sequences(&self) -> Vec<HotSequence> {
        let mut hot: Vec<HotSequence> = self
            .sequences
            .iter()
            .filter(|(_, count)| **count >= self.config.hot_sequence_threshold)
            .map(|((caller, callee), count)| HotSequence {
                caller: caller.clone(),
                callee: callee.clone(),
                frequency: *count,
            })
            .collect();
        hot.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.caller.cmp(&b.caller))
                .then_with(|| a.callee.cmp(&b.callee))
        });
        hot
    }

    /// Records one execution of `function` for correlation.
    pub fn record_function_metrics(&mut self, function: &str, duration_ms: f64, memory_delta: i64) {
        let window = self.config.metrics_window.max(1);
        let samples = self.metrics.entry(function.to_string()).or_default();
        if samples.len() >= window {
            samples.pop_front();
        }
        samples.push_back(MetricSample {
            duration_ms,
            memory_delta,
        });
    }

    fn correlations(&self, frames: &[Frame]) -> Vec<FunctionCorrelation> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for frame in frames {
            let name = frame.function.as_str();
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            let Some(samples) = self.metrics.get(name) else {
                continue;
            };
            if samples.is_empty() {
                continue;
            }
            let n = samples.len() as f64;
            out.push(FunctionCorrelation {
                function: name.to_string(),
                samples: samples.len(),
                avg_duration_ms: samples.iter().map(|s| s.duration_ms).sum::<f64>() / n,
                avg_memory_delta: samples.iter().map(|s| s.memory_delta as f64).sum::<f64>() / n,
            });
        }
        out
    }

    /// Drops cached analyses.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Drops cached analyses and sequence counts.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.sequences.clear();
    }

    /// Removes cached analyses inserted before `cutoff_ms`.
    pub fn purge_older_than(&mut self, cutoff_ms: u64) -> usize {
        self.cache.purge_older_than(cutoff_ms)
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// `(analyses run, analyses that failed)`.
    pub fn counters(&self) -> (u64, u64) {
        (self.analyses, self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_runtime::ManualClock;

    fn trace(names: &[&str]) -> String {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{i:4}: {n}\n             at ./src/app.rs:{}:1\n", i + 1))
            .collect()
    }

    fn analyzer() -> (PatternAnalyzer, ManualClock) {
        let clock = ManualClock::new(0);
        (PatternAnalyzer::new(PatternConfig::new(), clock.shared()), clock)
    }

    #[test]
    fn test_direct_repetition_counts() {
        let (mut analyzer, _) = analyzer();
        let analysis = analyzer.analyze_pattern(&trace(&["f", "f", "f", "main"]));
        assert!(analysis.is_valid);
        assert_eq!(analysis.direct_repetitions.get("f"), Some(&3));
        assert!(!analysis.direct_repetitions.contains_key("main"));
    }

    #[test]
    fn test_repeating_subsequence_prefers_frequency() {
        let (mut analyzer, _) = analyzer();
        let names = ["a", "b", "c", "a", "b", "c", "a", "b", "c", "main"];
        let analysis = analyzer.analyze_pattern(&trace(&names));
        let pattern = analysis.repeating_pattern.unwrap();
        // "a b" and "b c" both occur 3 times, as does "a b c"; longest wins.
        assert_eq!(pattern.occurrences, 3);
        assert_eq!(pattern.sequence, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_no_pattern_below_repetition_bar() {
        let (mut analyzer, _) = analyzer();
        let analysis = analyzer.analyze_pattern(&trace(&["a", "b", "a", "b", "main"]));
        assert!(analysis.repeating_pattern.is_none());
    }

    #[test]
    fn test_cache_hit_on_identical_stack() {
        let (mut analyzer, clock) = analyzer();
        let raw = trace(&["x", "y", "z"]);
        assert!(!analyzer.analyze_pattern(&raw).from_cache);
        clock.advance(10);
        assert!(analyzer.analyze_pattern(&raw).from_cache);
        assert_eq!(analyzer.cache_stats().hits, 1);

        clock.advance(120_000);
        assert!(!analyzer.analyze_pattern(&raw).from_cache);
    }

    #[test]
    fn test_hot_sequences_accumulate() {
        let clock = ManualClock::new(0);
        let config = PatternConfig::new().with_hot_sequence_threshold(3);
        let mut analyzer = PatternAnalyzer::new(config, clock.shared());
        let raw = trace(&["callee", "caller"]);

        assert!(analyzer.analyze_pattern(&raw).hot_sequences.is_empty());
        analyzer.analyze_pattern(&raw);
        let analysis = analyzer.analyze_pattern(&raw);
        let hot = analysis.hottest().unwrap();
        assert_eq!(hot.label(), "caller -> callee");
        assert_eq!(hot.frequency, 3);
    }

    #[test]
    fn test_decay_halves_counts() {
        let (mut analyzer, _) = analyzer();
        let raw = trace(&["b", "a"]);
        for _ in 0..3 {
            analyzer.analyze_pattern(&raw);
        }
        analyzer.decay_sequences();
        analyzer.decay_sequences();
        assert!(analyzer.sequences.is_empty());
    }

    #[test]
    fn test_function_metrics_correlate() {
        let (mut analyzer, _) = analyzer();
        analyzer.record_function_metrics("slow", 10.0, 100);
        analyzer.record_function_metrics("slow", 30.0, -50);
        let analysis = analyzer.analyze_pattern(&trace(&["slow", "main"]));
        assert_eq!(analysis.correlations.len(), 1);
        let c = &analysis.correlations[0];
        assert_eq!(c.samples, 2);
        assert!((c.avg_duration_ms - 20.0).abs() < 1e-9);
        assert!((c.avg_memory_delta - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_window_is_bounded() {
        let clock = ManualClock::new(0);
        let mut config = PatternConfig::new();
        config.metrics_window = 2;
        let mut analyzer = PatternAnalyzer::new(config, clock.shared());
        for i in 0..5 {
            analyzer.record_function_metrics("f", f64::from(i), 0);
        }
        let c = &analyzer.correlations(&[Frame::named("f")])[0];
        assert_eq!(c.samples, 2);
        assert!((c.avg_duration_ms - 3.5).abs() < 1e-9);
    }

    // Security-focused tests

    #[test]
    fn test_garbage_input_is_invalid_not_fatal() {
        let (mut analyzer, _) = analyzer();
        let analysis = analyzer.analyze_pattern("\u{0}\u{1}not a stack");
        assert!(!analysis.is_valid);
        assert!(analysis.error.is_some());
        assert_eq!(analyzer.counters().1, 1);
    }

    #[test]
    fn test_very_deep_stack_is_bounded() {
        let (mut analyzer, _) = analyzer();
        let names: Vec<String> = (0..2_000).map(|i| format!("f{}", i % 7)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let analysis = analyzer.analyze_pattern(&trace(&refs));
        assert!(analysis.is_valid);
        assert_eq!(analysis.depth, 2_000);
        assert!(analysis.repeating_pattern.is_some());
    }
}
