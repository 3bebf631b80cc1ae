//! Frame parsing.
//!
//! Turns a textual stack capture into structured [`Frame`]s. Three line
//! formats are recognised:
//!
//! | Format | Example |
//! |--------|---------|
//! | std backtrace | `  12: app::handler::run` followed by `at ./src/handler.rs:42:9` |
//! | parenthesised | `at app::handler::run (src/handler.rs:42:9)` |
//! | at-sign | `app::handler::run@src/handler.rs:42:9` |
//!
//! Frames are listed innermost first, as captured.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Function-name prefixes that belong to the platform, not the host.
const PLATFORM_FUNCTION_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "futures::",
    "futures_util::",
    "<std::",
    "<core::",
    "<alloc::",
    "<tokio::",
    "<F as ",
    "__rust",
    "rust_begin_unwind",
    "__libc_start",
];

/// Path fragments that mark platform or third-party code.
const PLATFORM_PATH_MARKERS: &[&str] = &[
    "/rustc/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
    "/.cargo/registry/",
    "/.cargo/git/",
];

/// Frames produced by the guardian itself, dropped from samples.
const INTERNAL_PREFIXES: &[&str] = &[
    "guardian_stack::",
    "<guardian_stack::",
    "std::backtrace",
    "std::backtrace_rs",
];

/// One parsed stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    /// Normalised function name (hash suffix stripped).
    pub function: String,
    /// Source file, when known.
    pub file: Option<String>,
    /// Line number, when known.
    pub line: Option<u32>,
    /// Column number, when known.
    pub column: Option<u32>,
    /// Closure or otherwise unnamed frame.
    pub is_anonymous: bool,
    /// No source location (FFI, stripped binary).
    pub is_native: bool,
    /// Host code rather than platform or library code.
    pub is_user_code: bool,
    /// Part of an async state machine.
    pub is_async: bool,
}

impl Frame {
    /// Creates a bare frame with only a function name, classified with the
    /// default rules.
    pub fn named(function: impl Into<String>) -> Self {
        FrameParser::new().build(function.into(), None, None, None)
    }
}

/// A captured stack, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSample {
    /// Capture time (epoch ms).
    pub timestamp_ms: u64,
    /// Number of frames, excluding the guardian's own.
    pub depth: usize,
    /// Parsed frames.
    pub frames: Vec<Frame>,
}

struct Patterns {
    numbered: Regex,
    location: Regex,
    parenthesised: Regex,
    at_sign: Regex,
    hash_suffix: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        numbered: Regex::new(r"^\s*\d+:\s+(.+?)\s*$").unwrap(),
        location: Regex::new(r"^\s*at\s+(.+?):(\d+)(?::(\d+))?\s*$").unwrap(),
        parenthesised: Regex::new(r"^\s*at\s+(.+?)\s+\((.*)\)\s*$").unwrap(),
        at_sign: Regex::new(r"^\s*([^@\s]*)@(.+?):(\d+)(?::(\d+))?\s*$").unwrap(),
        hash_suffix: Regex::new(r"::h[0-9a-f]{16}$").unwrap(),
    })
}

/// Splits `file:line[:col]` into its parts.
fn split_location(location: &str) -> Option<(String, u32, Option<u32>)> {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next()?;
    let middle = parts.next()?;
    match (middle.parse::<u32>(), last.parse::<u32>(), parts.next()) {
        (Ok(line), Ok(col), Some(file)) => Some((file.to_string(), line, Some(col))),
        (Err(_), Ok(line), None) => Some((middle.to_string(), line, None)),
        (Err(_), Ok(line), Some(file)) => Some((format!("{file}:{middle}"), line, None)),
        _ => None,
    }
}

/// Parses stack captures into frames.
///
/// # Example
///
/// ```rust
/// use guardian_stack::FrameParser;
///
/// let parser = FrameParser::new();
/// let frames = parser.parse(
///     "   0: app::walk::h0123456789abcdef\n             at ./src/walk.rs:10:5\n   1: std::rt::lang_start\n",
/// );
/// assert_eq!(frames.len(), 2);
/// assert_eq!(frames[0].function, "app::walk");
/// assert!(frames[0].is_user_code);
/// assert!(!frames[1].is_user_code);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FrameParser {
    library_prefixes: Vec<String>,
}

impl FrameParser {
    /// Creates a parser with the built-in platform rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds function or path prefixes to classify as library code.
    #[must_use]
    pub fn with_library_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.library_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// Parses every recognised frame line. Unrecognised lines are skipped.
    pub fn parse(&self, raw: &str) -> Vec<Frame> {
        let p = patterns();
        let mut frames: Vec<Frame> = Vec::new();
        // Index of a numbered frame still waiting for its `at` line.
        let mut awaiting_location: Option<usize> = None;

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }

            if let Some(caps) = p.numbered.captures(line) {
                frames.push(self.build(caps[1].to_string(), None, None, None));
                awaiting_location = Some(frames.len() - 1);
                continue;
            }

            if let Some(caps) = p.parenthesised.captures(line) {
                let function = caps[1].to_string();
                match split_location(&caps[2]) {
                    Some((file, line_no, col)) => {
                        frames.push(self.build(function, Some(file), Some(line_no), col));
                    }
                    None => frames.push(self.build(function, None, None, None)),
                }
                awaiting_location = None;
                continue;
            }

            if let Some(caps) = p.location.captures(line) {
                let file = caps[1].to_string();
                let line_no = caps[2].parse().ok();
                let col = caps.get(3).and_then(|m| m.as_str().parse().ok());
                match awaiting_location.take() {
                    Some(idx) => {
                        let function = frames[idx].function.clone();
                        frames[idx] = self.build(function, Some(file), line_no, col);
                    }
                    None => frames.push(self.build(String::new(), Some(file), line_no, col)),
                }
                continue;
            }

            if let Some(caps) = p.at_sign.captures(line) {
                let line_no = caps[3].parse().ok();
                let col = caps.get(4).and_then(|m| m.as_str().parse().ok());
                frames.push(self.build(caps[1].to_string(), Some(caps[2].to_string()), line_no, col));
                awaiting_location = None;
            }
        }
        frames
    }

    /// Parses a capture into a sample, dropping the guardian's own frames.
    pub fn sample(&self, raw: &str, timestamp_ms: u64) -> StackSample {
        let frames: Vec<Frame> = self
            .parse(raw)
            .into_iter()
            .filter(|f| !is_internal(&f.function))
            .collect();
        StackSample {
            timestamp_ms,
            depth: frames.len(),
            frames,
        }
    }

    fn build(
        &self,
        raw_function: String,
        file: Option<String>,
        line: Option<u32>,
        column: Option<u32>,
    ) -> Frame {
        let function = normalize(&raw_function);
        let is_anonymous = function.is_empty()
            || function.contains("{{closure}}")
            || function.contains("<anonymous>");
        let is_async = function.contains("{async_fn")
            || function.contains("{async_block")
            || function.starts_with("async ")
            || function.contains("Future>::poll");
        let is_native = file.is_none();
        let is_user_code = !is_native && !self.is_library(&function, file.as_deref());
        let function = if function.is_empty() {
            "<anonymous>".to_string()
        } else {
            function
        };

        Frame {
            function,
            file,
            line,
            column,
            is_anonymous,
            is_native,
            is_user_code,
            is_async,
        }
    }

    fn is_library(&self, function: &str, file: Option<&str>) -> bool {
        if PLATFORM_FUNCTION_PREFIXES.iter().any(|p| function.starts_with(p)) {
            return true;
        }
        if let Some(file) = file {
            if PLATFORM_PATH_MARKERS.iter().any(|m| file.contains(m)) {
                return true;
            }
        }
        self.library_prefixes.iter().any(|p| {
            function.starts_with(p.as_str()) || file.is_some_and(|f| f.starts_with(p.as_str()))
        })
    }
}

fn is_internal(function: &str) -> bool {
    INTERNAL_PREFIXES.iter().any(|p| function.starts_with(p))
}

/// Strips `at ` prefixes, frame numbers and the `::h<hash>` suffix.
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("at ").unwrap_or(trimmed).trim();
    patterns().hash_suffix.replace(trimmed, "").into_owned()
}
