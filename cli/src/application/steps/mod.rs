//! Lifecycle steps of a build.
//!
//! Each step implements [`Step<BuildContext>`]. Steps do their work in a
//! `Result`-returning helper and convert a failure into a recorded error plus
//! [`StepAction::Halt`] through [`finish`].

use anyhow::{Context, Result};

use crate::application::ports::{Hypervisor, ProgressReporter};
use crate::application::runner::StepAction;
use crate::application::state::BuildContext;
use crate::domain::{LookupError, SrRef, VdiRef, VmRef, WaitError};

mod attach_management_network;
mod boot_wait;
mod copy_clean_script;
mod create_instance;
mod detach_iso;
mod export;
mod forward_guest_port;
mod iso_download;
mod prepare_nfs_export;
mod prepare_output_dir;
mod provision_guest;
mod restore_network;
mod shutdown_vm;
mod snapshot_instance;
mod start_vm;
mod wait_for_guest_ip;
mod wait_for_shutdown;

pub use attach_management_network::AttachManagementNetwork;
pub use boot_wait::BootWait;
pub use copy_clean_script::{CLEAN_SCRIPT, CopyCleanScript};
pub use create_instance::CreateInstance;
pub use detach_iso::DetachIso;
pub use export::{Export, TRANSFER_HELPER_BEFORE};
pub use forward_guest_port::ForwardGuestPort;
pub use iso_download::{IsoDownload, iso_import_commands};
pub use prepare_nfs_export::PrepareNfsExport;
pub use prepare_output_dir::PrepareOutputDir;
pub use provision_guest::ProvisionGuest;
pub use restore_network::RestoreNetwork;
pub use shutdown_vm::ShutdownVm;
pub use snapshot_instance::SnapshotInstance;
pub use start_vm::StartVm;
pub use wait_for_guest_ip::WaitForGuestIp;
pub use wait_for_shutdown::{SHUTDOWN_POLL_INTERVAL, WaitForShutdown};

/// Turn a step body's result into the orchestrator's action.
pub(crate) fn finish(ctx: &mut BuildContext, result: Result<()>) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(e) => {
            ctx.fail(e);
            StepAction::Halt
        }
    }
}

/// Map the outcome of a wait onto the orchestrator's action.
///
/// Cancellation halts without recording an error; the runner reports it as a
/// cancelled build.
pub(crate) fn finish_wait(
    ctx: &mut BuildContext,
    result: Result<(), WaitError>,
    what: &str,
) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(WaitError::Cancelled) => StepAction::Halt,
        Err(e) => finish(ctx, Err(anyhow::Error::new(e).context(what.to_string()))),
    }
}

/// The configured storage repository, or the pool default when none is named.
pub(crate) async fn resolve_sr(ctx: &BuildContext) -> Result<SrRef> {
    let hv = ctx.hypervisor();
    match ctx.config.common.sr_name.as_deref() {
        Some(name) => {
            let srs = hv.srs_by_name(name).await?;
            Ok(LookupError::exactly_one("SR", name, srs)?)
        }
        None => hv.default_sr().await.context("looking up the default SR"),
    }
}

/// Force a VM off and destroy it together with its disks.
///
/// Returns the disks that were destroyed.
pub(crate) async fn remove_vm(
    hv: &dyn Hypervisor,
    reporter: &dyn ProgressReporter,
    vm: &VmRef,
) -> Result<Vec<VdiRef>> {
    let uuid = hv.vm_uuid(vm).await.unwrap_or_else(|_| vm.to_string());
    reporter.message(&format!("Removing instance '{uuid}'"));

    if let Err(e) = hv.hard_shutdown(vm).await {
        tracing::debug!(vm = %uuid, error = %format!("{e:#}"), "hard shutdown before destroy failed");
    }

    let vdis = hv.vm_disks(vm).await?;
    for vdi in &vdis {
        let vdi_uuid = hv.vdi_uuid(vdi).await.unwrap_or_else(|_| vdi.to_string());
        reporter.message(&format!("Destroying disk '{vdi_uuid}'"));
        hv.destroy_vdi(vdi)
            .await
            .with_context(|| format!("destroying disk '{vdi_uuid}'"))?;
    }

    hv.destroy_vm(vm)
        .await
        .with_context(|| format!("destroying instance '{uuid}'"))?;
    Ok(vdis)
}

/// Fold a list of cleanup failures into one error.
pub(crate) fn cleanup_result(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(failures.join("; "))
    }
}
