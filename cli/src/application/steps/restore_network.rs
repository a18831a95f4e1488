use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::VifRef;
use crate::domain::network::{RestoreAction, plan_restore};

use super::finish;

/// Put the VM's interfaces back on the networks they had before isolation.
///
/// Interfaces added for the build (the isolated network and the management
/// attachment) are removed. Indices with nothing remembered are skipped.
#[derive(Default)]
pub struct RestoreNetwork;

impl RestoreNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn restore(ctx: &BuildContext) -> Result<()> {
        let hv = ctx.hypervisor();
        let reporter = ctx.reporter();
        let instance = ctx.state.require_instance()?;
        let originals = ctx.state.require_original_networks()?;

        let mut current: BTreeMap<u32, VifRef> = hv
            .vm_vifs(instance)
            .await?
            .into_iter()
            .map(|vif| (vif.device, vif.reference))
            .collect();
        let occupied: Vec<u32> = current.keys().copied().collect();

        for action in plan_restore(originals, &occupied) {
            match action {
                RestoreAction::Skip { device } => {
                    tracing::debug!(device, "no network remembered for device");
                    if let Some(vif) = current.remove(&device) {
                        hv.destroy_vif(&vif)
                            .await
                            .with_context(|| format!("Unable to remove interface {device}"))?;
                    }
                }
                RestoreAction::Reconnect {
                    device,
                    network,
                    remove_existing,
                } => {
                    if remove_existing {
                        if let Some(vif) = current.remove(&device) {
                            hv.destroy_vif(&vif)
                                .await
                                .with_context(|| format!("Unable to remove interface {device}"))?;
                        }
                    }
                    reporter.message(&format!("Reconnecting device {device} to '{network}'"));
                    hv.connect_network(instance, &network, device)
                        .await
                        .with_context(|| format!("Unable to reconnect interface {device}"))?;
                }
            }
        }

        // Interfaces past the last remembered index were added by the build.
        for (device, vif) in current {
            hv.destroy_vif(&vif)
                .await
                .with_context(|| format!("Unable to remove interface {device}"))?;
        }

        reporter.success("Networks restored");
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for RestoreNetwork {
    fn name(&self) -> &str {
        "restore_network"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Restore networks");
        let result = Self::restore(ctx).await;
        finish(ctx, result)
    }
}
