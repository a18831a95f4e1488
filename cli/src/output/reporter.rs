//! `TerminalReporter`: presentation-layer implementation of `ProgressReporter`.
//!
//! Owns a copy of the `OutputContext` so it can be shared with the build
//! steps as `Arc<dyn ProgressReporter>` without depending on any
//! presentation type directly.

use crate::application::ports::ProgressReporter;
use crate::output::OutputContext;

/// Terminal progress reporter.
///
/// - `say()` prints `"==> {message}"`
/// - `message()` prints `"    {message}"`
/// - `success()`/`warn()` use the context's markers
///
/// Everything but `error()` is suppressed when `ctx.quiet`.
pub struct TerminalReporter {
    ctx: OutputContext,
}

impl TerminalReporter {
    /// Create a new `TerminalReporter` over the given output context.
    #[must_use]
    pub fn new(ctx: OutputContext) -> Self {
        Self { ctx }
    }
}

impl ProgressReporter for TerminalReporter {
    fn say(&self, message: &str) {
        tracing::info!(target: "xenpack::progress", "{message}");
        self.ctx.step(message);
    }

    fn message(&self, message: &str) {
        tracing::debug!(target: "xenpack::progress", "{message}");
        self.ctx.detail(message);
    }

    fn success(&self, message: &str) {
        self.ctx.success(message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "xenpack::progress", "{message}");
        self.ctx.warn(message);
    }

    fn error(&self, message: &str) {
        self.ctx.error(message);
    }
}
