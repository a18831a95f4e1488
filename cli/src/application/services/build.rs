//! Application service: the build use-case.
//!
//! Assembles the step pipeline for the configured builder, runs it, and on
//! success writes the artifact metadata. The service never touches
//! `OutputContext` or any presentation type.

use std::path::PathBuf;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use xenpack_common::ArtifactMetadata;

use crate::application::ports::{FileHasher, LocalFs};
use crate::application::runner::{BoxedStep, RunOutcome, RunReport, StepRunner};
use crate::application::services::artifact;
use crate::application::state::{BuildContext, BuildServices};
use crate::application::steps::{
    AttachManagementNetwork, BootWait, CopyCleanScript, CreateInstance, DetachIso, Export,
    ForwardGuestPort, IsoDownload, PrepareNfsExport, PrepareOutputDir, ProvisionGuest,
    RestoreNetwork, ShutdownVm, SnapshotInstance, StartVm, WaitForGuestIp, WaitForShutdown,
};
use crate::domain::{BuildConfig, BuilderConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Replace an existing output directory.
    pub force: bool,
}

/// A finished build.
#[derive(Debug)]
pub struct BuildOutcome {
    pub output_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub artifact: ArtifactMetadata,
    pub report: RunReport,
}

/// Steps of the snapshot-based builder, in order.
#[must_use]
pub fn vm_pipeline(config: &BuildConfig, opts: BuildOptions) -> Vec<BoxedStep<BuildContext>> {
    let boot_timeout = config
        .vm()
        .map(|vm| vm.boot_timeout)
        .unwrap_or(config.common.shutdown_timeout);
    vec![
        Box::new(PrepareOutputDir::new(opts.force)),
        Box::new(PrepareNfsExport::new()),
        Box::new(SnapshotInstance::new()),
        Box::new(AttachManagementNetwork::new()),
        Box::new(CopyCleanScript::new()),
        Box::new(StartVm::new()),
        Box::new(BootWait::new()),
        Box::new(WaitForGuestIp::new(boot_timeout)),
        Box::new(ForwardGuestPort::new()),
        Box::new(ProvisionGuest::new()),
        Box::new(ShutdownVm::new()),
        Box::new(WaitForShutdown::new(config.common.shutdown_timeout)),
        Box::new(RestoreNetwork::new()),
        Box::new(Export::new()),
    ]
}

/// Steps of the install-from-ISO builder, in order.
#[must_use]
pub fn iso_pipeline(config: &BuildConfig, opts: BuildOptions) -> Vec<BoxedStep<BuildContext>> {
    let install_timeout = config
        .iso()
        .map(|iso| iso.install_timeout)
        .unwrap_or(config.common.shutdown_timeout);
    vec![
        Box::new(PrepareOutputDir::new(opts.force)),
        Box::new(PrepareNfsExport::new()),
        Box::new(IsoDownload::new()),
        Box::new(CreateInstance::new()),
        Box::new(StartVm::new()),
        Box::new(BootWait::new()),
        Box::new(WaitForShutdown::new(install_timeout)),
        Box::new(DetachIso::new()),
        Box::new(Export::new()),
    ]
}

#[must_use]
pub fn pipeline(config: &BuildConfig, opts: BuildOptions) -> Vec<BoxedStep<BuildContext>> {
    match config.builder {
        BuilderConfig::Vm(_) => vm_pipeline(config, opts),
        BuilderConfig::Iso(_) => iso_pipeline(config, opts),
    }
}

/// Run a build to completion.
///
/// # Errors
///
/// - `Build was halted.` with the failing step's error as the cause.
/// - `Build was cancelled.` after a cancellation.
/// - Artifact metadata errors after a successful run.
pub async fn run_build(
    config: BuildConfig,
    services: BuildServices,
    fs: &impl LocalFs,
    hasher: &impl FileHasher,
    cancel: CancellationToken,
    opts: BuildOptions,
) -> Result<BuildOutcome> {
    let steps = pipeline(&config, opts);
    let mut runner = StepRunner::new(steps);
    let mut ctx = BuildContext::new(config, services, cancel);

    tracing::info!(steps = runner.len(), vm = %ctx.config.common.vm_name, "starting build");
    let report = runner.run(&mut ctx).await;
    tracing::info!(outcome = ?report.outcome, "build finished");

    if !report.cleanup_failures.is_empty() {
        ctx.reporter().warn(&format!(
            "Cleanup failed for: {}",
            report.cleanup_failures.join(", ")
        ));
    }

    match report.outcome {
        RunOutcome::Completed => {}
        RunOutcome::Cancelled => anyhow::bail!("Build was cancelled."),
        RunOutcome::Halted => {
            return Err(match ctx.state.error.take() {
                Some(e) => e.context("Build was halted."),
                None => anyhow::anyhow!("Build was halted."),
            });
        }
    }

    let output_dir = ctx.config.common.output_directory.clone();
    let meta = artifact::describe(&ctx.config, &ctx.state, fs, hasher)?;
    let metadata_path = artifact::write_metadata(&output_dir, &meta, fs)?;
    ctx.reporter().success(&meta.describe(&output_dir.display().to_string()));

    Ok(BuildOutcome {
        output_dir,
        metadata_path,
        artifact: meta,
        report,
    })
}
