//! Step orchestrator.
//!
//! Runs an ordered list of steps against one mutable context. A step that
//! halts (or leaves an error in the context), or a cancellation observed
//! between steps, stops forward progress; every step that already ran,
//! including the one that halted, then gets exactly one cleanup call in
//! reverse order. Cleanup failures are logged and never stop the pass.
//!
//! The runner knows nothing about VMs: it is generic over the context type.

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// What the orchestrator should do after a step's `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Halted,
    Cancelled,
}

/// Why forward progress stopped, as seen by cleanups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Halted,
    Cancelled,
}

/// What the orchestrator needs from a context.
pub trait StepContext: Send {
    fn cancellation(&self) -> &CancellationToken;
    /// True when a step recorded a failure without returning `Halt`.
    fn has_error(&self) -> bool;
    /// Called once, before cleanup starts, when the run did not complete.
    fn set_interruption(&mut self, interruption: Interruption);
}

/// One unit of the build.
///
/// A step may remember what it created in its own fields; only its own
/// `cleanup` consumes them.
#[async_trait]
pub trait Step<C: Send>: Send {
    fn name(&self) -> &str;

    async fn run(&mut self, ctx: &mut C) -> StepAction;

    /// Release whatever `run` allocated. Called at most once per run, also
    /// when `run` halted halfway.
    async fn cleanup(&mut self, _ctx: &mut C) -> Result<()> {
        Ok(())
    }
}

pub type BoxedStep<C> = Box<dyn Step<C>>;

/// Wall time of one step's `run`.
#[derive(Debug, Clone)]
pub struct StepTiming {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub timings: Vec<StepTiming>,
    /// Names of steps whose cleanup failed.
    pub cleanup_failures: Vec<String>,
}

impl RunReport {
    #[must_use]
    pub fn step_duration_ms(&self, name: &str) -> Option<u128> {
        self.timings
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.duration_ms)
    }
}

pub struct StepRunner<C: Send> {
    steps: Vec<BoxedStep<C>>,
}

impl<C: StepContext> StepRunner<C> {
    #[must_use]
    pub fn new(steps: Vec<BoxedStep<C>>) -> Self {
        Self { steps }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, then clean up in reverse.
    pub async fn run(&mut self, ctx: &mut C) -> RunReport {
        let mut ran = 0;
        let mut timings = Vec::with_capacity(self.steps.len());
        let mut outcome = RunOutcome::Completed;

        for step in &mut self.steps {
            if ctx.cancellation().is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }

            let name = step.name().to_string();
            tracing::debug!(step = %name, "running step");
            let started = Instant::now();
            let action = step.run(ctx).await;
            ran += 1;
            timings.push(StepTiming {
                name: name.clone(),
                duration_ms: started.elapsed().as_millis(),
            });

            if action == StepAction::Halt || ctx.has_error() {
                outcome = if ctx.cancellation().is_cancelled() {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Halted
                };
                tracing::debug!(step = %name, ?outcome, "step stopped the run");
                break;
            }
        }

        match outcome {
            RunOutcome::Completed => {}
            RunOutcome::Halted => ctx.set_interruption(Interruption::Halted),
            RunOutcome::Cancelled => ctx.set_interruption(Interruption::Cancelled),
        }

        let mut cleanup_failures = Vec::new();
        for step in self.steps[..ran].iter_mut().rev() {
            tracing::debug!(step = %step.name(), "cleaning up step");
            if let Err(e) = step.cleanup(ctx).await {
                tracing::warn!(step = %step.name(), error = %format!("{e:#}"), "cleanup failed");
                cleanup_failures.push(step.name().to_string());
            }
        }

        RunReport {
            outcome,
            timings,
            cleanup_failures,
        }
    }
}
