use anyhow::Result;
use async_trait::async_trait;
use xenpack_common::PowerState;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;

use super::finish;

/// Ask the guest to shut down cleanly; force it off if the request is
/// refused. [`super::WaitForShutdown`] waits for the result.
#[derive(Default)]
pub struct ShutdownVm;

impl ShutdownVm {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn shutdown(ctx: &BuildContext) -> Result<()> {
        let hv = ctx.hypervisor();
        let reporter = ctx.reporter();
        let instance = ctx.state.require_instance()?;

        if hv.power_state(instance).await? == PowerState::Halted {
            reporter.message("VM is already halted");
            return Ok(());
        }

        reporter.message("Sending clean shutdown request");
        if let Err(e) = hv.clean_shutdown(instance).await {
            reporter.warn(&format!("Clean shutdown failed ({e:#}), forcing shutdown"));
            hv.hard_shutdown(instance).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for ShutdownVm {
    fn name(&self) -> &str {
        "shutdown_vm"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Shutdown VM");
        let result = Self::shutdown(ctx).await;
        finish(ctx, result)
    }
}
