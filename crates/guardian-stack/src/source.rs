//! Stack sources: where the monitor's samples come from.
//!
//! | Source | Depth reflects |
//! |--------|----------------|
//! | [`ShadowStack`] | Instrumented calls on the tracked call chain |
//! | [`BacktraceSource`] | The native stack of the thread running the tick |
//! | [`ManualSource`] | Whatever a test or embedding host sets |

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::MonitoringError;
use crate::shadow::{ShadowStack, SHADOW_FILE};

/// Produces a textual stack capture for the frame parser.
pub trait StackSource: Send + Sync + fmt::Debug {
    /// Captures the current stack.
    ///
    /// # Errors
    ///
    /// [`MonitoringError`] with stage `capture` when no stack is available.
    fn capture(&self) -> Result<String, MonitoringError>;
}

impl<S: StackSource + ?Sized> StackSource for Arc<S> {
    fn capture(&self) -> Result<String, MonitoringError> {
        (**self).capture()
    }
}

impl StackSource for ShadowStack {
    fn capture(&self) -> Result<String, MonitoringError> {
        Ok(self.render())
    }
}

/// Captures the native backtrace of the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceSource;

impl StackSource for BacktraceSource {
    fn capture(&self) -> Result<String, MonitoringError> {
        let backtrace = Backtrace::force_capture();
        match backtrace.status() {
            BacktraceStatus::Captured => Ok(backtrace.to_string()),
            BacktraceStatus::Unsupported => Err(MonitoringError::new(
                "capture",
                "backtraces are unsupported on this platform",
            )),
            _ => Err(MonitoringError::new("capture", "backtrace not captured")),
        }
    }
}

/// A source reporting a settable capture. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualSource {
    raw: Arc<Mutex<Option<String>>>,
}

impl ManualSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the reported capture.
    pub fn set(&self, raw: impl Into<String>) {
        *self.raw.lock().unwrap_or_else(|p| p.into_inner()) = Some(raw.into());
    }

    /// Reports `functions` (innermost first) rendered in the std backtrace format.
    pub fn set_functions<I, S>(&self, functions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = String::new();
        for (n, function) in functions.into_iter().enumerate() {
            raw.push_str(&format!(
                "{n:4}: {}\n             at {SHADOW_FILE}:{}\n",
                function.as_ref(),
                n + 1
            ));
        }
        self.set(raw);
    }

    /// Reports a stack of `depth` frames named `function`.
    pub fn set_depth(&self, depth: usize, function: &str) {
        self.set_functions(std::iter::repeat(function).take(depth));
    }

    /// Makes every capture fail.
    pub fn fail(&self) {
        *self.raw.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl StackSource for ManualSource {
    fn capture(&self) -> Result<String, MonitoringError> {
        self.raw
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| MonitoringError::new("capture", "no stack available"))
    }
}
