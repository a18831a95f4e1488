use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::ports::{Hypervisor, ProgressReporter};
use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::disk::whole_gigabytes;
use crate::domain::network::{MANAGEMENT_DEVICE, isolated_devices, networks_by_device};
use crate::domain::{InstanceError, LookupError, NetworkRef, VmRef};

use super::{cleanup_result, finish, remove_vm, resolve_sr};

const ISOLATED_NETWORK_NAME: &str = "xenpack isolated";
const ISOLATED_NETWORK_DESCRIPTION: &str =
    "Internal network keeping the build VM away from the source VM's networks";

/// Produce the build VM from the source VM.
///
/// snapshot → clone the snapshot (a template) → copy the clone onto the
/// target SR → mark the copy as a regular VM → delete clone, then snapshot.
/// The intermediates are only deleted once the copy exists. The copy must
/// have exactly one disk. Its interfaces are then moved onto a throwaway
/// network, except the management interface, remembering the original
/// networks by device index for [`super::RestoreNetwork`].
#[derive(Default)]
pub struct SnapshotInstance {
    snapshot: Option<VmRef>,
    clone: Option<VmRef>,
    instance: Option<VmRef>,
    temp_network: Option<NetworkRef>,
}

impl SnapshotInstance {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn create(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let Some(vm_cfg) = ctx.config.vm().cloned() else {
            anyhow::bail!("the snapshot step needs a VM builder configuration");
        };
        let hv: Arc<dyn Hypervisor> = ctx.services.hypervisor.clone();
        let reporter: Arc<dyn ProgressReporter> = ctx.services.reporter.clone();
        let vm_name = ctx.config.common.vm_name.clone();

        let sources = hv.vms_by_name(&vm_cfg.source_vm).await?;
        let source = LookupError::exactly_one("source VM", &vm_cfg.source_vm, sources)?;
        let source_uuid = hv.vm_uuid(&source).await?;

        reporter.message(&format!("Performing snapshot of source VM '{source_uuid}'"));
        let snapshot = hv
            .snapshot(&source, &vm_cfg.snapshot_name)
            .await
            .context("Error performing snapshot of source VM")?;
        self.snapshot = Some(snapshot.clone());

        reporter.message("Creating template from snapshot");
        let clone = hv
            .clone_vm(&snapshot, &vm_cfg.clone_name)
            .await
            .context("Error creating a clone to templatize")?;
        self.clone = Some(clone.clone());

        let sr = resolve_sr(ctx).await?;

        reporter.message("Copying template onto target storage");
        let instance = hv
            .copy_vm(&clone, &vm_name, &sr)
            .await
            .context("Error copying template onto target storage")?;
        self.instance = Some(instance.clone());
        ctx.state.instance = Some(instance.clone());

        hv.set_is_a_template(&instance, false)
            .await
            .context("Error setting is_a_template=false")?;
        let description = &ctx.config.common.vm_description;
        if !description.is_empty() {
            hv.set_description(&instance, description).await?;
        }

        reporter.message("Removing intermediate template");
        remove_vm(hv.as_ref(), reporter.as_ref(), &clone)
            .await
            .context("Error removing intermediate template")?;
        self.clone = None;

        reporter.message("Removing source snapshot");
        remove_vm(hv.as_ref(), reporter.as_ref(), &snapshot)
            .await
            .context("Error removing snapshot")?;
        self.snapshot = None;

        let disks = hv.vm_disks(&instance).await?;
        let [disk] = disks.as_slice() else {
            return Err(InstanceError::DiskCount(disks.len()).into());
        };
        let size = hv
            .vdi_virtual_size(disk)
            .await
            .context("Error determining disk size")?;
        let gb = whole_gigabytes(size);
        reporter.message(&format!("Found disk size of: {gb} GB"));
        ctx.state.configured_disk_gb = Some(gb);

        reporter.message("Creating temporary isolated network...");
        let temp_network = hv
            .create_network(ISOLATED_NETWORK_NAME, ISOLATED_NETWORK_DESCRIPTION)
            .await
            .context("Error creating temporary network")?;
        self.temp_network = Some(temp_network.clone());

        let mut vifs = hv.vm_vifs(&instance).await?;
        vifs.sort_by_key(|v| v.device);
        let originals = networks_by_device(
            &vifs
                .iter()
                .map(|v| (v.device, v.network.clone()))
                .collect::<Vec<_>>(),
        );
        reporter.message(&format!("Saving {} networks", vifs.len()));

        for vif in &vifs {
            hv.destroy_vif(&vif.reference)
                .await
                .with_context(|| format!("Unable to remove interface {} from VM", vif.device))?;
        }

        if originals.first().is_some_and(Option::is_some) {
            reporter.message(&format!(
                "Skipping plug of device {MANAGEMENT_DEVICE} (management)"
            ));
        }
        for device in isolated_devices(&originals) {
            hv.connect_network(&instance, &temp_network, device)
                .await
                .with_context(|| {
                    format!("Unable to connect interface {device} to the temporary network")
                })?;
        }

        let uuid = hv.vm_uuid(&instance).await?;
        let boot_policy = hv
            .hvm_boot_policy(&instance)
            .await
            .context("Unable to determine if VM is HVM or PV")?;
        let sr_uuid = hv.sr_uuid(&sr).await?;

        ctx.state.boot_policy = Some(boot_policy);
        ctx.state.instance_uuid = Some(uuid.clone());
        ctx.state.original_networks = Some(originals);
        ctx.state.instance_sr_uuid = Some(sr_uuid.clone());

        reporter.success(&format!("Created instance '{uuid}'"));
        reporter.message(&format!("Using SR '{sr_uuid}'"));
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for SnapshotInstance {
    fn name(&self) -> &str {
        "snapshot_instance"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Snapshot instance");
        let result = self.create(ctx).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let keep = ctx.should_keep_vm();
        let hv = ctx.hypervisor();
        let reporter = ctx.reporter();
        let mut failures = Vec::new();

        let instance = if keep { None } else { self.instance.take() };
        for vm in [self.clone.take(), self.snapshot.take(), instance]
            .into_iter()
            .flatten()
        {
            if let Err(e) = remove_vm(hv, reporter, &vm).await {
                reporter.error(&format!("{e:#}"));
                failures.push(format!("{e:#}"));
            }
        }

        // A kept VM from an interrupted build is still plugged into the
        // temporary network.
        let network_in_use = keep && ctx.state.interruption.is_some();
        if let Some(network) = self.temp_network.take().filter(|_| !network_in_use) {
            reporter.message("Destroying temporary network");
            if let Err(e) = hv.destroy_network(&network).await {
                reporter.error(&format!("{e:#}"));
                failures.push(format!("destroying temporary network: {e:#}"));
            }
        }

        cleanup_result(failures)
    }
}
