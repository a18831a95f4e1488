use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::ports::{Hypervisor, ProgressReporter};
use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::disk::mib_to_bytes;
use crate::domain::network::MANAGEMENT_DEVICE;
use crate::domain::{LookupError, VbdKind, VdiRef, VmRef};

use super::{cleanup_result, finish, remove_vm, resolve_sr};

/// Create the install VM for the ISO builder.
///
/// Clones the install template, sizes it, creates the disks in the order they
/// are listed, attaches the install ISO as a CD and optionally connects a
/// named network at device 0.
#[derive(Default)]
pub struct CreateInstance {
    instance: Option<VmRef>,
    disks: Vec<VdiRef>,
}

impl CreateInstance {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn create(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let Some(iso) = ctx.config.iso().cloned() else {
            anyhow::bail!("the create step needs an ISO builder configuration");
        };
        let hv: Arc<dyn Hypervisor> = ctx.services.hypervisor.clone();
        let reporter: Arc<dyn ProgressReporter> = ctx.services.reporter.clone();
        let common = ctx.config.common.clone();
        let iso_vdi = ctx.state.require_iso_vdi()?.clone();

        let templates = hv.vms_by_name(&iso.clone_template).await?;
        let template = LookupError::exactly_one("template", &iso.clone_template, templates)?;

        let instance = hv
            .clone_vm(&template, &common.vm_name)
            .await
            .context("Error cloning VM")?;
        self.instance = Some(instance.clone());
        ctx.state.instance = Some(instance.clone());

        hv.set_is_a_template(&instance, false)
            .await
            .context("Error setting is_a_template=false")?;
        if !common.vm_description.is_empty() {
            hv.set_description(&instance, &common.vm_description).await?;
        }
        hv.set_memory(&instance, mib_to_bytes(iso.memory_mib))
            .await
            .context("Error setting VM memory")?;
        hv.set_vcpus(&instance, iso.vcpus)
            .await
            .context("Error setting VM vCPUs")?;

        let sr = resolve_sr(ctx).await?;
        for disk in &iso.disks {
            reporter.message(&format!("Creating disk '{}' ({} MiB)", disk.name, disk.size_mib));
            let vdi = hv
                .create_vdi(&sr, &disk.name, mib_to_bytes(disk.size_mib))
                .await
                .with_context(|| format!("Unable to create disk '{}'", disk.name))?;
            self.disks.push(vdi.clone());
            hv.attach_vdi(&instance, &vdi, VbdKind::Disk)
                .await
                .with_context(|| format!("Unable to attach disk '{}'", disk.name))?;
        }

        hv.attach_vdi(&instance, &iso_vdi, VbdKind::Cd)
            .await
            .context("Unable to attach the install ISO")?;

        if let Some(name) = iso.network_name.as_deref() {
            let networks = hv.networks_by_name(name).await?;
            let network = LookupError::exactly_one("network", name, networks)?;
            hv.connect_network(&instance, &network, MANAGEMENT_DEVICE)
                .await
                .with_context(|| format!("Unable to connect network '{name}'"))?;
        }

        let uuid = hv.vm_uuid(&instance).await?;
        let boot_policy = hv
            .hvm_boot_policy(&instance)
            .await
            .context("Unable to determine if VM is HVM or PV")?;
        let sr_uuid = hv.sr_uuid(&sr).await?;
        ctx.state.instance_uuid = Some(uuid.clone());
        ctx.state.boot_policy = Some(boot_policy);
        ctx.state.instance_sr_uuid = Some(sr_uuid);

        reporter.success(&format!("Created instance '{uuid}'"));
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for CreateInstance {
    fn name(&self) -> &str {
        "create_instance"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Create instance");
        let result = self.create(ctx).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if ctx.should_keep_vm() {
            return Ok(());
        }
        let hv = ctx.hypervisor();
        let reporter = ctx.reporter();
        let mut failures = Vec::new();

        let mut destroyed = Vec::new();
        if let Some(vm) = self.instance.take() {
            match remove_vm(hv, reporter, &vm).await {
                Ok(vdis) => destroyed = vdis,
                Err(e) => {
                    reporter.error(&format!("{e:#}"));
                    failures.push(format!("{e:#}"));
                }
            }
        }

        // Disks created but never attached survive the VM.
        for vdi in self.disks.drain(..).filter(|d| !destroyed.contains(d)) {
            if let Err(e) = hv.destroy_vdi(&vdi).await {
                reporter.error(&format!("{e:#}"));
                failures.push(format!("destroying disk {vdi}: {e:#}"));
            }
        }

        cleanup_result(failures)
    }
}
