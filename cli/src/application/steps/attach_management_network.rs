use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::network::MANAGEMENT_DEVICE;

use super::finish;

/// Plug the host-internal management network into device 0 so the host can
/// reach the guest.
#[derive(Default)]
pub struct AttachManagementNetwork;

impl AttachManagementNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn attach(ctx: &BuildContext) -> Result<()> {
        let hv = ctx.hypervisor();
        let instance = ctx.state.require_instance()?;
        let network = hv
            .management_network()
            .await
            .context("Unable to find the host internal management network")?;
        hv.connect_network(instance, &network, MANAGEMENT_DEVICE)
            .await
            .context("Unable to attach the management network")?;
        ctx.reporter()
            .message(&format!("Management network attached at device {MANAGEMENT_DEVICE}"));
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for AttachManagementNetwork {
    fn name(&self) -> &str {
        "attach_management_network"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Attach management network");
        let result = Self::attach(ctx).await;
        finish(ctx, result)
    }
}
