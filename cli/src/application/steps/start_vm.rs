use anyhow::{Context, Result};
use async_trait::async_trait;
use xenpack_common::PowerState;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;

use super::finish;

/// Bring the instance to `Running` from whatever state it is in, then record
/// where it runs.
///
/// `Halted` starts, `Paused` unpauses, `Suspended` resumes and `Running` is
/// left alone. Cleanup forces off a VM this step started unless the keep-VM
/// policy keeps it.
#[derive(Default)]
pub struct StartVm {
    started: bool,
}

impl StartVm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn boot(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let hv = ctx.services.hypervisor.clone();
        let reporter = ctx.services.reporter.clone();
        let instance = ctx.state.require_instance()?.clone();
        let uuid = hv.vm_uuid(&instance).await?;

        let state = hv
            .power_state(&instance)
            .await
            .with_context(|| format!("Unable to read power state of VM '{uuid}'"))?;
        let transition = match state {
            PowerState::Halted => Some(hv.start(&instance, false).await),
            PowerState::Paused => Some(hv.unpause(&instance).await),
            PowerState::Suspended => Some(hv.resume(&instance).await),
            PowerState::Running => {
                reporter.message(&format!("VM '{uuid}' is already running"));
                None
            }
        };
        if let Some(result) = transition {
            result.with_context(|| format!("Unable to start VM with UUID '{uuid}' from {state}"))?;
            self.started = true;
        }

        let domid = hv.domid(&instance).await?;
        let host = hv
            .resident_host_address(&instance)
            .await
            .context("Unable to determine what host the VM is running on")?;
        reporter.message(&format!("VM '{uuid}' is running on host with address '{host}'"));
        ctx.state.domid = Some(domid);
        ctx.state.resident_host = Some(host);
        ctx.state.instance_uuid.get_or_insert(uuid);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for StartVm {
    fn name(&self) -> &str {
        "start_vm"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Start VM");
        let result = self.boot(ctx).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if !self.started || ctx.should_keep_vm() {
            return Ok(());
        }
        let hv = ctx.hypervisor();
        let instance = ctx.state.require_instance()?;
        if hv.power_state(instance).await? != PowerState::Halted {
            hv.hard_shutdown(instance)
                .await
                .context("Unable to force shutdown VM")?;
        }
        Ok(())
    }
}
