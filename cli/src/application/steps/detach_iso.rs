use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;

use super::finish;

/// Eject the install media once the installer has powered the VM off.
#[derive(Default)]
pub struct DetachIso;

impl DetachIso {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn detach(ctx: &BuildContext) -> Result<()> {
        let hv = ctx.hypervisor();
        let instance = ctx.state.require_instance()?;
        let iso = ctx.state.require_iso_vdi()?;
        let uuid = hv.vdi_uuid(iso).await.unwrap_or_else(|_| iso.to_string());
        hv.detach_vdi(instance, iso)
            .await
            .with_context(|| format!("Unable to detach ISO '{uuid}'"))?;
        ctx.reporter().message(&format!("Detached ISO '{uuid}'"));
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for DetachIso {
    fn name(&self) -> &str {
        "detach_iso"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Detach ISO");
        let result = Self::detach(ctx).await;
        finish(ctx, result)
    }
}
