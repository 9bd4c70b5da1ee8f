//! `TerminalReporter`: presentation-layer implementation of `ProgressReporter`.
//!
//! Wraps `&OutputContext` and implements the `application::ports::ProgressReporter`
//! trait so application services can emit progress events without depending on
//! any presentation type directly.

use std::sync::Mutex;

use indicatif::ProgressBar;
use owo_colors::OwoColorize as _;

use crate::application::ports::ProgressReporter;
use crate::output::{OutputContext, progress};

/// Terminal progress reporter that wraps an `OutputContext`.
///
/// On a TTY each step runs under a spinner that turns into a batch bar once
/// `advance` reports totals. Without a TTY, steps print as plain lines and
/// batch counters are left to the tracing log.
pub struct TerminalReporter<'a> {
    ctx: &'a OutputContext,
    active: Mutex<Option<ProgressBar>>,
}

impl<'a> TerminalReporter<'a> {
    /// Create a new `TerminalReporter` wrapping the given output context.
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self {
            ctx,
            active: Mutex::new(None),
        }
    }

    fn take_active(&self) -> Option<ProgressBar> {
        self.active.lock().ok().and_then(|mut slot| slot.take())
    }

    fn clear(&self) {
        if let Some(pb) = self.take_active() {
            pb.finish_and_clear();
        }
    }
}

impl ProgressReporter for TerminalReporter<'_> {
    fn step(&self, message: &str) {
        if self.ctx.quiet {
            return;
        }
        if !self.ctx.show_progress() {
            println!("  {} {message}", "→".style(self.ctx.styles.info));
            return;
        }
        let pb = progress::spinner(message);
        let previous = match self.active.lock() {
            Ok(mut slot) => slot.replace(pb),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            previous.finish_and_clear();
        }
    }

    fn success(&self, message: &str) {
        if self.ctx.quiet {
            return;
        }
        match self.take_active() {
            Some(pb) => progress::finish_ok(&pb, message),
            None => println!("  {} {message}", "✓".style(self.ctx.styles.success)),
        }
    }

    fn warn(&self, message: &str) {
        if self.ctx.quiet {
            return;
        }
        match self.active.lock().ok().and_then(|slot| slot.clone()) {
            Some(pb) => pb.println(format!("  {} {message}", "⚠".style(self.ctx.styles.warning))),
            None => println!("  {} {message}", "⚠".style(self.ctx.styles.warning)),
        }
    }

    fn advance(&self, done: u64, total: u64) {
        let Ok(slot) = self.active.lock() else {
            return;
        };
        if let Some(pb) = slot.as_ref() {
            if pb.length() != Some(total) {
                progress::batches(pb, total);
            }
            pb.set_position(done);
        }
    }
}

impl Drop for TerminalReporter<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}
