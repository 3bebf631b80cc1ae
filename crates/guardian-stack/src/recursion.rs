//! # Recursion Detector
//!
//! Five independent heuristics over a captured stack, each individually
//! toggleable and weighted:
//!
//! | Algorithm | Fires when | Default weight |
//! |-----------|------------|----------------|
//! | Direct | a function occurs `direct_threshold` times | 0.40 |
//! | Indirect | a 2..=5 frame window repeats back to back | 0.30 |
//! | Mutual | two functions alternate `mutual_threshold` times, or the call graph has a longer cycle | 0.35 |
//! | Pattern | a 2..=10 n-gram densely repeats | 0.25 |
//! | Deep chain | the stack is long relative to its distinct functions | 0.20 |
//!
//! Confidence is the sum of triggered weights clamped to 1.0. It is a
//! ranking heuristic, not a probability.
//!
//! ## Mutual Recursion
//!
//! Adjacent frames give caller→callee edges. For `A,B,A,B,A,B,A,B` the
//! edges are `B→A` ×4 and `A→B` ×3; the alternation count is
//! `min(A→B, B→A) + 1 = 4`. Cycles through three or more functions are
//! found with Tarjan's strongly connected components over the same graph.
//!
//! ## Example
//!
//! ```rust
//! use guardian_runtime::{ManualClock, RecursionType};
//! use guardian_stack::{Frame, RecursionConfig, RecursionDetector};
//!
//! let mut detector = RecursionDetector::new(
//!     RecursionConfig::new().with_direct_threshold(5),
//!     ManualClock::new(0).shared(),
//! );
//! let frames: Vec<Frame> = (0..6).map(|_| Frame::named("walk")).collect();
//!
//! let verdict = detector.analyze_frames(&frames);
//! assert!(verdict.is_recursive);
//! assert!(verdict.has(RecursionType::Direct));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use guardian_runtime::{RecursionType, SharedClock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheStats, TtlCache};
use crate::frame::{Frame, FrameParser};
use crate::signature::StackSignature;

/// Longest back-to-back window checked by the indirect algorithm.
const MAX_INDIRECT_WINDOW: usize = 5;
/// Back-to-back copies needed for indirect recursion.
const MIN_CONSECUTIVE_REPEATS: usize = 3;
/// Longest n-gram checked by the pattern algorithm.
const MAX_NGRAM: usize = 10;
/// Occurrences needed for an n-gram.
const MIN_NGRAM_REPEATS: usize = 3;
/// Local density an n-gram needs (occurrences × length / span).
const MIN_NGRAM_CONFIDENCE: f64 = 0.7;
/// Frames per distinct function above which a long chain is suspicious.
const DEEP_CHAIN_RATIO: f64 = 2.0;
/// Cleanup horizon as a multiple of `pattern_window_ms`.
const CLEANUP_WINDOW_FACTOR: u64 = 10;
/// Smoothing factor of the analysis-time average.
const TIMING_ALPHA: f64 = 0.1;

/// Per-algorithm weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursionWeights {
    /// Direct recursion.
    pub direct: f64,
    /// Indirect recursion.
    pub indirect: f64,
    /// Mutual recursion.
    pub mutual: f64,
    /// Repeating n-grams.
    pub pattern: f64,
    /// Deep chains.
    pub deep_chain: f64,
}

impl RecursionWeights {
    /// Default weights.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            direct: 0.4,
            indirect: 0.3,
            mutual: 0.35,
            pattern: 0.25,
            deep_chain: 0.2,
        }
    }

    fn of(&self, kind: RecursionType) -> f64 {
        match kind {
            RecursionType::Direct => self.direct,
            RecursionType::Indirect => self.indirect,
            RecursionType::Mutual => self.mutual,
            RecursionType::Pattern => self.pattern,
            RecursionType::DeepChain => self.deep_chain,
        }
    }
}

impl Default for RecursionWeights {
    fn default() -> Self {
        Self::new()
    }
}

/// Detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursionConfig {
    /// Run the direct algorithm.
    pub enable_direct: bool,
    /// Run the indirect algorithm.
    pub enable_indirect: bool,
    /// Run the mutual algorithm.
    pub enable_mutual: bool,
    /// Run the n-gram algorithm.
    pub enable_pattern: bool,
    /// Run the deep-chain algorithm.
    pub enable_deep_chain: bool,
    /// Occurrences of one function that count as direct recursion.
    pub direct_threshold: usize,
    /// Alternations that count as mutual recursion.
    pub mutual_threshold: usize,
    /// Chain length above which the deep-chain check applies.
    pub depth_threshold: usize,
    /// Retention unit for cached verdicts and suspicious patterns.
    pub pattern_window_ms: u64,
    /// Cached verdicts kept.
    pub cache_size: usize,
    /// Lifetime of a cached verdict.
    pub cache_ttl_ms: u64,
    /// Algorithm weights.
    pub weights: RecursionWeights,
}

impl RecursionConfig {
    /// Creates a config with the default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enable_direct: true,
            enable_indirect: true,
            enable_mutual: true,
            enable_pattern: true,
            enable_deep_chain: true,
            direct_threshold: 10,
            mutual_threshold: 5,
            depth_threshold: 100,
            pattern_window_ms: 60_000,
            cache_size: 500,
            cache_ttl_ms: 30_000,
            weights: RecursionWeights::new(),
        }
    }

    /// Sets the direct threshold.
    #[must_use]
    pub const fn with_direct_threshold(mut self, threshold: usize) -> Self {
        self.direct_threshold = threshold;
        self
    }

    /// Sets the mutual threshold.
    #[must_use]
    pub const fn with_mutual_threshold(mut self, threshold: usize) -> Self {
        self.mutual_threshold = threshold;
        self
    }

    /// Sets the deep-chain depth threshold.
    #[must_use]
    pub const fn with_depth_threshold(mut self, threshold: usize) -> Self {
        self.depth_threshold = threshold;
        self
    }

    /// Enables or disables one algorithm.
    #[must_use]
    pub const fn with_algorithm(mut self, kind: RecursionType, enabled: bool) -> Self {
        match kind {
            RecursionType::Direct => self.enable_direct = enabled,
            RecursionType::Indirect => self.enable_indirect = enabled,
            RecursionType::Mutual => self.enable_mutual = enabled,
            RecursionType::Pattern => self.enable_pattern = enabled,
            RecursionType::DeepChain => self.enable_deep_chain = enabled,
        }
        self
    }
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What one algorithm found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecursionEvidence {
    /// `function` occurs `count` times.
    Direct { function: String, count: usize },
    /// `window` repeats `repeats` times back to back starting at `start`.
    Indirect {
        window: Vec<String>,
        repeats: usize,
        start: usize,
    },
    /// `first` and `second` alternate `alternations` times.
    Mutual {
        first: String,
        second: String,
        alternations: usize,
    },
    /// A call-graph cycle through three or more functions.
    Cycle { functions: Vec<String> },
    /// `ngram` occurs `occurrences` times at the given density.
    Pattern {
        ngram: Vec<String>,
        occurrences: usize,
        confidence: f64,
    },
    /// `length` frames over `unique` distinct functions.
    DeepChain { length: usize, unique: usize },
}

/// Detector output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecursionVerdict {
    /// Any algorithm fired.
    pub is_recursive: bool,
    /// Algorithms that fired, in a stable order.
    pub recursion_types: Vec<RecursionType>,
    /// Per-algorithm findings.
    pub evidence: Vec<RecursionEvidence>,
    /// Sum of triggered weights, clamped to 1.0.
    pub confidence: f64,
    /// Frame count.
    pub depth: usize,
    /// Signature hash of the analysed stack.
    pub signature: u64,
    /// Answered from the cache.
    pub from_cache: bool,
}

impl RecursionVerdict {
    fn empty(depth: usize, signature: u64) -> Self {
        Self {
            is_recursive: false,
            recursion_types: Vec::new(),
            evidence: Vec::new(),
            confidence: 0.0,
            depth,
            signature,
            from_cache: false,
        }
    }

    /// Returns true when `kind` fired.
    #[inline]
    #[must_use]
    pub fn has(&self, kind: RecursionType) -> bool {
        self.recursion_types.contains(&kind)
    }
}

/// A stack shape that was flagged at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousPattern {
    /// Signature hash.
    pub signature: u64,
    /// Innermost function.
    pub top: Option<String>,
    /// Times flagged.
    pub hits: u64,
    /// First flagged (epoch ms).
    pub first_seen_ms: u64,
    /// Last flagged (epoch ms).
    pub last_seen_ms: u64,
    /// Algorithms that fired most recently.
    pub types: Vec<RecursionType>,
}

/// Detector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorStats {
    /// Analyses run, cached or not.
    pub analyses: u64,
    /// Verdicts with `is_recursive`.
    pub detections: u64,
    /// Rolling average of uncached analysis time.
    pub avg_analysis_us: f64,
    /// Suspicious patterns tracked.
    pub suspicious_patterns: usize,
    /// Verdict cache counters.
    pub cache: CacheStats,
}

/// Recursion detector with its verdict cache.
#[derive(Debug)]
pub struct RecursionDetector {
    config: RecursionConfig,
    parser: FrameParser,
    clock: SharedClock,
    cache: TtlCache<RecursionVerdict>,
    suspicious: HashMap<u64, SuspiciousPattern>,
    analyses: u64,
    detections: u64,
    avg_analysis_us: f64,
}

impl RecursionDetector {
    /// Creates a detector.
    pub fn new(config: RecursionConfig, clock: SharedClock) -> Self {
        Self {
            cache: TtlCache::new(config.cache_size, config.cache_ttl_ms),
            config,
            parser: FrameParser::new(),
            clock,
            suspicious: HashMap::new(),
            analyses: 0,
            detections: 0,
            avg_analysis_us: 0.0,
        }
    }

    /// Uses `parser` for raw captures.
    #[must_use]
    pub fn with_parser(mut self, parser: FrameParser) -> Self {
        self.parser = parser;
        self
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RecursionConfig {
        &self.config
    }

    /// Parses and analyses a raw capture.
    pub fn analyze_stack_trace(&mut self, raw_trace: &str) -> RecursionVerdict {
        let frames = self.parser.parse(raw_trace);
        self.analyze_frames(&frames)
    }

    /// Analyses already parsed frames.
    pub fn analyze_frames(&mut self, frames: &[Frame]) -> RecursionVerdict {
        self.analyses += 1;
        let now = self.clock.now_ms();
        let signature = StackSignature::of(frames);

        let verdict = if let Some(mut cached) = self.cache.get(signature.hash, now) {
            cached.from_cache = true;
            cached
        } else {
            let started = Instant::now();
            let verdict = self.evaluate(frames, signature.hash);
            let elapsed_us = started.elapsed().as_secs_f64() * 1_000_000.0;
            self.avg_analysis_us = if self.avg_analysis_us == 0.0 {
                elapsed_us
            } else {
                self.avg_analysis_us * (1.0 - TIMING_ALPHA) + elapsed_us * TIMING_ALPHA
            };
            self.cache.insert(signature.hash, verdict.clone(), now);
            verdict
        };

        if verdict.is_recursive {
            self.detections += 1;
            let entry = self
                .suspicious
                .entry(signature.hash)
                .or_insert_with(|| SuspiciousPattern {
                    signature: signature.hash,
                    top: signature.top.clone(),
                    hits: 0,
                    first_seen_ms: now,
                    last_seen_ms: now,
                    types: Vec::new(),
                });
            entry.hits += 1;
            entry.last_seen_ms = now;
            entry.types = verdict.recursion_types.clone();
            debug!(
                types = ?verdict.recursion_types,
                confidence = verdict.confidence,
                depth = verdict.depth,
                "recursion detected"
            );
        }
        verdict
    }

    fn evaluate(&self, frames: &[Frame], signature: u64) -> RecursionVerdict {
        let names: Vec<&str> = frames.iter().map(|f| f.function.as_str()).collect();
        let mut verdict = RecursionVerdict::empty(names.len(), signature);
        if names.is_empty() {
            return verdict;
        }

        let cfg = &self.config;
        let mut found: BTreeMap<RecursionType, Vec<RecursionEvidence>> = BTreeMap::new();
        if cfg.enable_direct {
            push(&mut found, RecursionType::Direct, direct(&names, cfg.direct_threshold));
        }
        if cfg.enable_indirect {
            push(&mut found, RecursionType::Indirect, indirect(&names));
        }
        if cfg.enable_mutual {
            push(&mut found, RecursionType::Mutual, mutual(&names, cfg.mutual_threshold));
        }
        if cfg.enable_pattern {
            push(&mut found, RecursionType::Pattern, ngrams(&names));
        }
        if cfg.enable_deep_chain {
            push(&mut found, RecursionType::DeepChain, deep_chain(&names, cfg.depth_threshold));
        }

        for (kind, evidence) in found {
            verdict.confidence += cfg.weights.of(kind);
            verdict.recursion_types.push(kind);
            verdict.evidence.extend(evidence);
        }
        verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
        verdict.is_recursive = !verdict.recursion_types.is_empty();
        verdict
    }

    /// Flagged stack shapes, most hits first.
    pub fn suspicious_patterns(&self) -> Vec<SuspiciousPattern> {
        let mut out: Vec<SuspiciousPattern> = self.suspicious.values().cloned().collect();
        out.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.signature.cmp(&b.signature)));
        out
    }

    /// Forgets every suspicious pattern and cached verdict. Returns the number
    /// of patterns dropped.
    pub fn purge_suspicious(&mut self) -> usize {
        let dropped = self.suspicious.len();
        self.suspicious.clear();
        self.cache.clear();
        if dropped > 0 {
            warn!(dropped, "suspicious recursion patterns purged");
        }
        dropped
    }

    /// Purges cache entries and suspicious patterns older than ten pattern
    /// windows. Returns `(cache entries, patterns)` removed.
    pub fn cleanup(&mut self, now_ms: u64) -> (usize, usize) {
        let horizon = self.config.pattern_window_ms.saturating_mul(CLEANUP_WINDOW_FACTOR);
        let cutoff = now_ms.saturating_sub(horizon);
        let cached = self.cache.purge_older_than(cutoff);
        let before = self.suspicious.len();
        self.suspicious.retain(|_, p| p.last_seen_ms >= cutoff);
        (cached, before - self.suspicious.len())
    }

    /// Current statistics.
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            analyses: self.analyses,
            detections: self.detections,
            avg_analysis_us: self.avg_analysis_us,
            suspicious_patterns: self.suspicious.len(),
            cache: self.cache.stats(),
        }
    }
}

fn push(
    found: &mut BTreeMap<RecursionType, Vec<RecursionEvidence>>,
    kind: RecursionType,
    evidence: Vec<RecursionEvidence>,
) {
    if !evidence.is_empty() {
        found.insert(kind, evidence);
    }
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

fn direct(names: &[&str], threshold: usize) -> Vec<RecursionEvidence> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &name in names {
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold.max(2))
        .map(|(function, count)| RecursionEvidence::Direct {
            function: function.to_string(),
            count,
        })
        .collect()
}

/// Longest back-to-back run of any 2..=5 frame window.
fn indirect(names: &[&str]) -> Vec<RecursionEvidence> {
    let mut best: Option<(usize, usize, usize)> = None; // (repeats, len, start)

    for len in 2..=MAX_INDIRECT_WINDOW.min(names.len() / MIN_CONSECUTIVE_REPEATS) {
        let mut start = 0;
        while start + len * MIN_CONSECUTIVE_REPEATS <= names.len() {
            let window = &names[start..start + len];
            if window.iter().all(|n| *n == window[0]) {
                start += 1;
                continue;
            }
            let mut repeats = 1;
            while start + (repeats + 1) * len <= names.len()
                && &names[start + repeats * len..start + (repeats + 1) * len] == window
            {
                repeats += 1;
            }
            if repeats >= MIN_CONSECUTIVE_REPEATS
                && best.map_or(true, |(r, l, _)| repeats * len > r * l)
            {
                best = Some((repeats, len, start));
            }
            start += if repeats > 1 { repeats * len } else { 1 };
        }
    }

    best.map(|(repeats, len, start)| RecursionEvidence::Indirect {
        window: owned(&names[start..start + len]),
        repeats,
        start,
    })
    .into_iter()
    .collect()
}

fn mutual(names: &[&str], threshold: usize) -> Vec<RecursionEvidence> {
    // Frames are innermost first: names[i + 1] called names[i].
    let mut edges: HashMap<(&str, &str), usize> = HashMap::new();
    for pair in names.windows(2) {
        if pair[0] != pair[1] {
            *edges.entry((pair[1], pair[0])).or_insert(0) += 1;
        }
    }

    let mut evidence = Vec::new();
    let mut pairs: Vec<(&str, &str)> = edges.keys().copied().filter(|(a, b)| a < b).collect();
    pairs.sort_unstable();
    for (a, b) in pairs {
        let ab = edges.get(&(a, b)).copied().unwrap_or(0);
        let ba = edges.get(&(b, a)).copied().unwrap_or(0);
        if ab == 0 || ba == 0 {
            continue;
        }
        let alternations = ab.min(ba) + 1;
        if alternations >= threshold {
            evidence.push(RecursionEvidence::Mutual {
                first: a.to_string(),
                second: b.to_string(),
                alternations,
            });
        }
    }

    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for &name in names {
        *occurrences.entry(name).or_insert(0) += 1;
    }
    for scc in strongly_connected(&edges) {
        if scc.len() > 2 && scc.iter().all(|f| occurrences.get(f).copied().unwrap_or(0) >= threshold) {
            evidence.push(RecursionEvidence::Cycle {
                functions: owned(&scc),
            });
        }
    }
    evidence
}

/// Tarjan's SCC over the caller→callee graph. Only components with more than
/// one function are returned, each sorted by name.
///
/// Iterative with an explicit call stack, so a long chain of distinct
/// functions cannot overflow the monitor's own stack.
fn strongly_connected<'a>(edges: &HashMap<(&'a str, &'a str), usize>) -> Vec<Vec<&'a str>> {
    let mut nodes: Vec<&'a str> = edges.keys().flat_map(|&(from, to)| [from, to]).collect();
    nodes.sort_unstable();
    nodes.dedup();
    let id: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &(from, to) in edges.keys() {
        if let (Some(&f), Some(&t)) = (id.get(from), id.get(to)) {
            adjacency[f].push(t);
        }
    }
    for neighbors in &mut adjacency {
        neighbors.sort_unstable();
    }

    let mut next_index = 0usize;
    let mut indices: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut lowlinks = vec![0usize; nodes.len()];
    let mut on_stack = vec![false; nodes.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut sccs = Vec::new();

    for root in 0..nodes.len() {
        if indices[root].is_some() {
            continue;
        }
        // (node, next neighbor position)
        let mut calls: Vec<(usize, usize)> = vec![(root, 0)];
        indices[root] = Some(next_index);
        lowlinks[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(&(node, pos)) = calls.last() {
            if let Some(&neighbor) = adjacency[node].get(pos) {
                if let Some(top) = calls.last_mut() {
                    top.1 += 1;
                }
                match indices[neighbor] {
                    None => {
                        indices[neighbor] = Some(next_index);
                        lowlinks[neighbor] = next_index;
                        next_index += 1;
                        stack.push(neighbor);
                        on_stack[neighbor] = true;
                        calls.push((neighbor, 0));
                    }
                    Some(index) if on_stack[neighbor] => {
                        lowlinks[node] = lowlinks[node].min(index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            calls.pop();
            if let Some(&(parent, _)) = calls.last() {
                lowlinks[parent] = lowlinks[parent].min(lowlinks[node]);
            }
            if Some(lowlinks[node]) == indices[node] {
                let mut scc = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    scc.push(nodes[w]);
                    if w == node {
                        break;
                    }
                }
                if scc.len() > 1 {
                    scc.sort_unstable();
                    sccs.push(scc);
                }
            }
        }
    }
    sccs
}

/// Densest n-gram of length 2..=10 with at least three occurrences.
fn ngrams(names: &[&str]) -> Vec<RecursionEvidence> {
    let mut best: Option<(f64, usize, &[&str])> = None;

    for len in 2..=MAX_NGRAM.min(names.len() / MIN_NGRAM_REPEATS) {
        let mut positions: HashMap<&[&str], Vec<usize>> = HashMap::new();
        for (i, window) in names.windows(len).enumerate() {
            positions.entry(window).or_default().push(i);
        }
        for (gram, pos) in positions {
            let mut unique: Vec<&str> = gram.to_vec();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() < 2 {
                continue;
            }
            // Non-overlapping occurrences only.
            let mut occurrences = 0;
            let mut next_free = 0;
            let mut first = None;
            let mut last = 0;
            for p in pos {
                if p >= next_free {
                    occurrences += 1;
                    first.get_or_insert(p);
                    last = p;
                    next_free = p + len;
                }
            }
            if occurrences < MIN_NGRAM_REPEATS {
                continue;
            }
            let span = (last + len - first.unwrap_or(0)) as f64;
            let confidence = (occurrences * len) as f64 / span;
            if confidence < MIN_NGRAM_CONFIDENCE {
                continue;
            }
            let better = best.map_or(true, |(c, o, g)| {
                occurrences > o || (occurrences == o && (confidence > c || (confidence == c && gram.len() > g.len())))
            });
            if better {
                best = Some((confidence, occurrences, gram));
            }
        }
    }

    best.map(|(confidence, occurrences, gram)| RecursionEvidence::Pattern {
        ngram: owned(gram),
        occurrences,
        confidence,
    })
    .into_iter()
    .collect()
}

fn deep_chain(names: &[&str], threshold: usize) -> Vec<RecursionEvidence> {
    let length = names.len();
    if length <= threshold {
        return Vec::new();
    }
    let mut unique: Vec<&str> = names.to_vec();
    unique.sort_unstable();
    unique.dedup();
    let ratio = length as f64 / unique.len() as f64;
    if ratio > DEEP_CHAIN_RATIO {
        vec![RecursionEvidence::DeepChain {
            length,
            unique: unique.len(),
        }]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_runtime::{Clock, ManualClock};

    fn frames(names: &[&str]) -> Vec<Frame> {
        names.iter().map(|n| Frame::named(*n)).collect()
    }

    fn detector(config: RecursionConfig) -> (RecursionDetector, ManualClock) {
        let clock = ManualClock::new(1_000);
        (RecursionDetector::new(config, clock.shared()), clock)
    }

    fn only(kind: RecursionType) -> RecursionConfig {
        let mut config = RecursionConfig::new()
            .with_algorithm(RecursionType::Direct, false)
            .with_algorithm(RecursionType::Indirect, false)
            .with_algorithm(RecursionType::Mutual, false)
            .with_algorithm(RecursionType::Pattern, false)
            .with_algorithm(RecursionType::DeepChain, false);
        config = config.with_algorithm(kind, true);
        config
    }

    #[test]
    fn test_direct_recursion() {
        let (mut d, _) = detector(RecursionConfig::new().with_direct_threshold(5));
        let verdict = d.analyze_frames(&frames(&["f"; 6]));
        assert!(verdict.is_recursive);
        assert!(verdict.has(RecursionType::Direct));
        assert!(verdict.confidence >= 0.4);
    }

    #[test]
    fn test_direct_below_threshold() {
        let (mut d, _) = detector(only(RecursionType::Direct).with_direct_threshold(5));
        let verdict = d.analyze_frames(&frames(&["f"; 4]));
        assert!(!verdict.is_recursive);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn test_mutual_recursion_alternation() {
        let (mut d, _) = detector(only(RecursionType::Mutual).with_mutual_threshold(4));
        let verdict = d.analyze_frames(&frames(&["A", "B", "A", "B", "A", "B", "A", "B"]));
        assert!(verdict.has(RecursionType::Mutual));
        assert!(verdict.evidence.iter().any(|e| matches!(
            e,
            RecursionEvidence::Mutual { alternations: 4, .. }
        )));
    }

    #[test]
    fn test_mutual_needs_enough_alternations() {
        let (mut d, _) = detector(only(RecursionType::Mutual).with_mutual_threshold(4));
        let verdict = d.analyze_frames(&frames(&["A", "B", "A", "B"]));
        assert!(!verdict.is_recursive);
    }

    #[test]
    fn test_three_function_cycle_found_by_scc() {
        let (mut d, _) = detector(only(RecursionType::Mutual).with_mutual_threshold(3));
        let names = ["a", "b", "c", "a", "b", "c", "a", "b", "c", "main"];
        let verdict = d.analyze_frames(&frames(&names));
        assert!(verdict.has(RecursionType::Mutual));
        assert!(verdict.evidence.iter().any(|e| matches!(
            e,
            RecursionEvidence::Cycle { functions } if functions == &["a", "b", "c"]
        )));
    }

    #[test]
    fn test_scc_on_long_chain_of_distinct_functions() {
        let names: Vec<String> = (0..200_000).map(|i| format!("app::step{i}")).collect();
        let mut edges: HashMap<(&str, &str), usize> = HashMap::new();
        for pair in names.windows(2) {
            edges.insert((pair[1].as_str(), pair[0].as_str()), 1);
        }
        assert!(strongly_connected(&edges).is_empty());

        // Closing the chain into a ring makes one component of every function.
        edges.insert((names[0].as_str(), names[names.len() - 1].as_str()), 1);
        let sccs = strongly_connected(&edges);
        assert_eq!(sccs.len(), 1);
        assert_eq!(sccs[0].len(), names.len());
    }

    #[test]
    fn test_indirect_back_to_back_windows() {
        let (mut d, _) = detector(only(RecursionType::Indirect));
        let names = ["x", "y", "z", "x", "y", "z", "x", "y", "z", "main"];
        let verdict = d.analyze_frames(&frames(&names));
        assert!(verdict.has(RecursionType::Indirect));
        match &verdict.evidence[0] {
            RecursionEvidence::Indirect { window, repeats, start } => {
                assert_eq!(window, &["x", "y", "z"]);
                assert_eq!(*repeats, 3);
                assert_eq!(*start, 0);
            }
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[test]
    fn test_indirect_ignores_single_function_runs() {
        let (mut d, _) = detector(only(RecursionType::Indirect));
        let verdict = d.analyze_frames(&frames(&["f"; 12]));
        assert!(!verdict.is_recursive);
    }

    #[test]
    fn test_pattern_requires_density() {
        let (mut d, _) = detector(only(RecursionType::Pattern));
        let dense = ["p", "q", "p", "q", "p", "q", "main"];
        assert!(d.analyze_frames(&frames(&dense)).has(RecursionType::Pattern));

        let sparse = [
            "p", "q", "a", "b", "c", "d", "p", "q", "e", "f", "g", "h", "p", "q",
        ];
        assert!(!d.analyze_frames(&frames(&sparse)).is_recursive);
    }

    #[test]
    fn test_deep_chain() {
        let (mut d, _) = detector(only(RecursionType::DeepChain).with_depth_threshold(10));
        let names: Vec<String> = (0..30).map(|i| format!("f{}", i % 5)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        assert!(d.analyze_frames(&frames(&refs)).has(RecursionType::DeepChain));

        let distinct: Vec<String> = (0..30).map(|i| format!("g{i}")).collect();
        let refs: Vec<&str> = distinct.iter().map(String::as_str).collect();
        assert!(!d.analyze_frames(&frames(&refs)).is_recursive);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let (mut d, _) = detector(
            RecursionConfig::new()
                .with_direct_threshold(3)
                .with_mutual_threshold(3)
                .with_depth_threshold(5),
        );
        let names = ["A", "B", "A", "B", "A", "B", "A", "B", "A", "B", "A", "B"];
        let verdict = d.analyze_frames(&frames(&names));
        assert!(verdict.recursion_types.len() >= 4);
        assert!((verdict.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_verdicts_are_cached() {
        let (mut d, _) = detector(RecursionConfig::new().with_direct_threshold(3));
        let stack = frames(&["f", "f", "f"]);
        assert!(!d.analyze_frames(&stack).from_cache);
        assert!(d.analyze_frames(&stack).from_cache);

        let stats = d.stats();
        assert_eq!(stats.analyses, 2);
        assert_eq!(stats.detections, 2);
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(d.suspicious_patterns()[0].hits, 2);
    }

    #[test]
    fn test_cleanup_purges_old_entries() {
        let (mut d, clock) = detector(RecursionConfig::new().with_direct_threshold(3));
        d.analyze_frames(&frames(&["f", "f", "f"]));
        assert_eq!(d.stats().suspicious_patterns, 1);

        clock.advance(60_000 * 10 + 1);
        let (cached, patterns) = d.cleanup(clock.now_ms());
        assert_eq!(cached, 1);
        assert_eq!(patterns, 1);
    }

    #[test]
    fn test_purge_suspicious() {
        let (mut d, _) = detector(RecursionConfig::new().with_direct_threshold(3));
        d.analyze_frames(&frames(&["f", "f", "f"]));
        assert_eq!(d.purge_suspicious(), 1);
        assert!(d.suspicious_patterns().is_empty());
        assert!(!d.analyze_frames(&frames(&["f", "f", "f"])).from_cache);
    }

    #[test]
    fn test_raw_trace_entry_point() {
        let (mut d, _) = detector(RecursionConfig::new().with_direct_threshold(5));
        let raw: String = (0..6)
            .map(|i| format!("{i:4}: app::walk\n             at ./src/walk.rs:3:5\n"))
            .collect();
        assert!(d.analyze_stack_trace(&raw).has(RecursionType::Direct));
    }

    // Security-focused tests

    #[test]
    fn test_empty_stack_is_not_recursive() {
        let (mut d, _) = detector(RecursionConfig::new());
        let verdict = d.analyze_frames(&[]);
        assert!(!verdict.is_recursive);
        assert_eq!(verdict.depth, 0);
    }

    #[test]
    fn test_huge_stack_completes() {
        let (mut d, _) = detector(RecursionConfig::new());
        let names: Vec<String> = (0..5_000).map(|i| format!("f{}", i % 3)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let verdict = d.analyze_frames(&frames(&refs));
        assert!(verdict.is_recursive);
        assert!(verdict.confidence <= 1.0);
    }
}
