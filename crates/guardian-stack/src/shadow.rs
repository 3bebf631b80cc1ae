//! # Shadow Stack
//!
//! An instrumented call tracker. Code that wants cheap, deterministic depth
//! monitoring calls [`ShadowStack::enter`] at the top of each interesting
//! function and holds the returned [`FrameGuard`] for the call's duration.
//!
//! ## Recursion Breaking
//!
//! When the stack monitor recovers from runaway recursion it *trips* the
//! shadow stack. While tripped, `enter` refuses with
//! [`StackError::RecursionBroken`] so instrumented code unwinds through its
//! own `?` chain. The trip clears once depth falls below the reset
//! threshold (the monitor's warning depth).
//!
//! ```text
//!   depth ─┐ trip()                     depth < reset_below
//!          ▼                                   ▼
//!   enter: Ok ── Ok ── Err(RecursionBroken) ── Ok
//! ```
//!
//! ## Example
//!
//! ```rust
//! use guardian_stack::ShadowStack;
//!
//! fn walk(stack: &ShadowStack, n: u32) -> guardian_stack::Result<u32> {
//!     let _guard = stack.enter("app::walk")?;
//!     if n == 0 { Ok(0) } else { Ok(1 + walk(stack, n - 1)?) }
//! }
//!
//! let stack = ShadowStack::new(100);
//! assert_eq!(walk(&stack, 10).unwrap(), 10);
//! assert_eq!(stack.depth(), 0);
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{Result, StackError};

/// File name rendered for shadow frames.
pub const SHADOW_FILE: &str = "<shadow>";

#[derive(Debug)]
struct Inner {
    frames: Mutex<Vec<String>>,
    tripped: AtomicBool,
    reset_below: usize,
}

/// Shared instrumented call stack. Clones share state.
#[derive(Debug, Clone)]
pub struct ShadowStack {
    inner: Arc<Inner>,
}

impl ShadowStack {
    /// Creates a stack whose trip clears below `reset_below` frames.
    #[must_use]
    pub fn new(reset_below: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                frames: Mutex::new(Vec::new()),
                tripped: AtomicBool::new(false),
                reset_below,
            }),
        }
    }

    fn frames(&self) -> MutexGuard<'_, Vec<String>> {
        self.inner.frames.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Pushes `function` and returns a guard that pops it on drop.
    ///
    /// # Errors
    ///
    /// [`StackError::RecursionBroken`] while the stack is tripped and depth
    /// is still at or above the reset threshold.
    pub fn enter(&self, function: impl Into<String>) -> Result<FrameGuard> {
        let mut frames = self.frames();
        if self.inner.tripped.load(Ordering::Acquire) {
            if frames.len() >= self.inner.reset_below {
                let function = function.into();
                debug!(function = %function, depth = frames.len(), "shadow stack refused entry");
                return Err(StackError::RecursionBroken {
                    function,
                    depth: frames.len(),
                });
            }
            self.inner.tripped.store(false, Ordering::Release);
        }
        frames.push(function.into());
        Ok(FrameGuard {
            stack: self.clone(),
            index: frames.len() - 1,
        })
    }

    /// Refuses further entries until depth falls below the reset threshold.
    pub fn trip(&self) {
        if !self.inner.tripped.swap(true, Ordering::AcqRel) {
            warn!(depth = self.depth(), "shadow stack tripped");
        }
    }

    /// Returns true while entries are refused.
    #[inline]
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    /// Clears the trip and every tracked frame.
    pub fn reset(&self) {
        self.frames().clear();
        self.inner.tripped.store(false, Ordering::Release);
    }

    /// Frames currently entered.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames().len()
    }

    /// Function names, innermost first.
    #[must_use]
    pub fn functions(&self) -> Vec<String> {
        self.frames().iter().rev().cloned().collect()
    }

    /// Renders the stack in the std backtrace format, innermost first.
    #[must_use]
    pub fn render(&self) -> String {
        let frames = self.frames();
        let mut out = String::with_capacity(frames.len() * 48);
        for (n, (index, function)) in frames.iter().enumerate().rev().enumerate() {
            let _ = writeln!(out, "{n:4}: {function}");
            let _ = writeln!(out, "             at {SHADOW_FILE}:{}", index + 1);
        }
        out
    }

    fn pop_to(&self, index: usize) {
        let mut frames = self.frames();
        // Out-of-order drops truncate everything above the guard.
        frames.truncate(index);
        if frames.len() < self.inner.reset_below {
            self.inner.tripped.store(false, Ordering::Release);
        }
    }
}

/// Pops its frame when dropped.
#[derive(Debug)]
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    stack: ShadowStack,
    index: usize,
}

impl FrameGuard {
    /// Zero-based position of this frame from the outermost call.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.index
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.stack.pop_to(self.index);
    }
}
