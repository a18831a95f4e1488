//! Export of the built VM into the output directory.
//!
//! | format    | source                                          | files          |
//! |-----------|-------------------------------------------------|----------------|
//! | `none`    | nothing                                         | none           |
//! | `vhd`     | VHDs under the mounted storage repository       | one per disk   |
//! | `xva`     | `GET /export` archive of the whole VM           | one            |
//! | `vdi_raw` | `GET /export_raw_vdi` per disk                  | one per disk   |
//! | `vdi_vhd` | as `vdi_raw`, or the transfer helper on old hosts | one per disk |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use xenpack_common::{ExportFormat, ProductVersion};

use crate::application::ports::{
    DownloadRequest, ExportEndpoint, Hypervisor, ProgressReporter,
};
use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::disk::{export_file_name, mounted_vhd_path};
use crate::domain::{ExportError, VdiRef, VmRef};

use super::finish;

/// Hosts older than this cannot serve VHD through `export_raw_vdi`; the
/// transfer helper exposes the disk instead.
pub const TRANSFER_HELPER_BEFORE: [u32; 2] = [6, 5];

fn needs_transfer_helper(version: &ProductVersion, sub_format: &str) -> bool {
    sub_format == "vhd" && *version < ProductVersion::new(&TRANSFER_HELPER_BEFORE)
}

/// Write the VM's disks (or the whole VM) to the output directory in the
/// configured format and record the written files.
#[derive(Default)]
pub struct Export;

impl Export {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn export(ctx: &mut BuildContext) -> Result<()> {
        let format: ExportFormat = ctx
            .config
            .common
            .format
            .parse()
            .map_err(|_| ExportError::UnknownFormat(ctx.config.common.format.clone()))?;

        let hv: Arc<dyn Hypervisor> = ctx.services.hypervisor.clone();
        let reporter: Arc<dyn ProgressReporter> = ctx.services.reporter.clone();
        let instance = ctx.state.require_instance()?.clone();

        if ctx.config.common.convert_to_template {
            convert_to_template(hv.as_ref(), reporter.as_ref(), &instance).await?;
        }

        let files = match format {
            ExportFormat::None => {
                reporter.message("Skipping export");
                Vec::new()
            }
            ExportFormat::Vhd => export_mounted_vhds(ctx, hv.as_ref(), &instance).await?,
            ExportFormat::Xva => export_xva(ctx, &hv, &reporter, &instance).await?,
            ExportFormat::VdiRaw => export_vdis(ctx, &hv, &reporter, &instance, "raw").await?,
            ExportFormat::VdiVhd => export_vdis(ctx, &hv, &reporter, &instance, "vhd").await?,
        };

        for file in &files {
            reporter.message(&format!("Exported {}", file.display()));
        }
        ctx.state.export_files.extend(files);
        Ok(())
    }
}

/// Templates carry no network interfaces.
async fn convert_to_template(
    hv: &dyn Hypervisor,
    reporter: &dyn ProgressReporter,
    instance: &VmRef,
) -> Result<()> {
    reporter.message("Converting VM to template");
    for vif in hv.vm_vifs(instance).await? {
        hv.destroy_vif(&vif.reference)
            .await
            .with_context(|| format!("Unable to remove interface {}", vif.device))?;
    }
    hv.set_is_a_template(instance, true)
        .await
        .context("Error converting VM to a template")
}

async fn export_mounted_vhds(
    ctx: &BuildContext,
    hv: &dyn Hypervisor,
    instance: &VmRef,
) -> Result<Vec<PathBuf>> {
    let common = &ctx.config.common;
    if common.nfs_mount.is_none() {
        anyhow::bail!("the vhd export format needs nfs_mount to be configured");
    }
    let mount_point = common.nfs_mount_point();
    let mut files = Vec::new();
    for (index, vdi) in hv.vm_disks(instance).await?.iter().enumerate() {
        let vdi_uuid = hv.vdi_uuid(vdi).await?;
        let sr = hv.vdi_sr(vdi).await?;
        let sr_uuid = hv.sr_uuid(&sr).await?;
        let source = mounted_vhd_path(&mount_point, &sr_uuid, &vdi_uuid);
        let dest = common
            .output_directory
            .join(export_file_name(&common.vm_name, index, "vhd"));
        ctx.reporter()
            .message(&format!("Copying {} to {}", source.display(), dest.display()));
        tokio::fs::copy(&source, &dest)
            .await
            .with_context(|| format!("copying {}", source.display()))?;
        files.push(dest);
    }
    Ok(files)
}

async fn export_xva(
    ctx: &BuildContext,
    hv: &Arc<dyn Hypervisor>,
    reporter: &Arc<dyn ProgressReporter>,
    instance: &VmRef,
) -> Result<Vec<PathBuf>> {
    let common = &ctx.config.common;
    let endpoint = hv.export_endpoint().await?;
    let uuid = hv.vm_uuid(instance).await?;
    let url = format!(
        "{}/export?uuid={uuid}&session_id={}",
        endpoint.base_url, endpoint.session_id
    );
    let dest = common
        .output_directory
        .join(export_file_name(&common.vm_name, 0, "xva"));
    reporter.message("Downloading XVA");
    download(ctx, reporter, &DownloadRequest::new(url), &dest).await?;
    Ok(vec![dest])
}

async fn export_vdis(
    ctx: &BuildContext,
    hv: &Arc<dyn Hypervisor>,
    reporter: &Arc<dyn ProgressReporter>,
    instance: &VmRef,
    sub_format: &str,
) -> Result<Vec<PathBuf>> {
    let common = &ctx.config.common;
    let endpoint = hv.export_endpoint().await?;
    let version = hv.product_version().await?;
    let helper = needs_transfer_helper(&version, sub_format);
    tracing::debug!(%version, sub_format, helper, "choosing disk export path");
    let extension = if sub_format == "raw" { "raw" } else { "vhd" };

    let mut files = Vec::new();
    for (index, vdi) in hv.vm_disks(instance).await?.iter().enumerate() {
        let dest = common
            .output_directory
            .join(export_file_name(&common.vm_name, index, extension));
        if helper {
            export_via_helper(ctx, hv, reporter, vdi, sub_format, &dest).await?;
        } else {
            let request = direct_request(&endpoint, &hv.vdi_uuid(vdi).await?, sub_format);
            reporter.message(&format!("Downloading disk {index}"));
            download(ctx, reporter, &request, &dest).await?;
        }
        files.push(dest);
    }
    Ok(files)
}

fn direct_request(endpoint: &ExportEndpoint, vdi_uuid: &str, sub_format: &str) -> DownloadRequest {
    DownloadRequest::new(format!(
        "{}/export_raw_vdi?vdi={vdi_uuid}&format={sub_format}&session_id={}",
        endpoint.base_url, endpoint.session_id
    ))
    .with_basic_auth(&endpoint.username, &endpoint.password)
}

/// Expose, download, and always unexpose, even when the download failed.
async fn export_via_helper(
    ctx: &BuildContext,
    hv: &Arc<dyn Hypervisor>,
    reporter: &Arc<dyn ProgressReporter>,
    vdi: &VdiRef,
    sub_format: &str,
    dest: &Path,
) -> Result<()> {
    let exposed = hv
        .expose_vdi(vdi, sub_format)
        .await
        .context("Unable to expose disk through the transfer helper")?;
    reporter.message("Downloading disk through the transfer helper");
    let downloaded = download(ctx, reporter, &DownloadRequest::new(&exposed.url), dest).await;
    let unexposed = hv.unexpose_vdi(&exposed.handle).await;
    downloaded?;
    unexposed.context("Unable to unexpose disk")
}

async fn download(
    ctx: &BuildContext,
    reporter: &Arc<dyn ProgressReporter>,
    request: &DownloadRequest,
    dest: &Path,
) -> Result<u64> {
    let progress_reporter = Arc::clone(reporter);
    let progress = move |percent: u8| {
        progress_reporter.message(&format!("Downloading... {percent}%"));
    };
    let bytes = ctx
        .services
        .downloader
        .download(request, dest, &progress)
        .await
        .with_context(|| format!("downloading {}", dest.display()))?;
    tracing::info!(bytes, dest = %dest.display(), "download finished");
    Ok(bytes)
}

#[async_trait]
impl Step<BuildContext> for Export {
    fn name(&self) -> &str {
        "export"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Export");
        let result = Self::export(ctx).await;
        finish(ctx, result)
    }
}
