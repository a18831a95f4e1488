//! `xenpack build <template>`: run a build against a XenServer pool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::app::AppContext;
use crate::application::services::build::{BuildOptions, BuildOutcome, run_build};
use crate::application::state::BuildServices;
use crate::domain::KeepVm;
use crate::infra::command_runner::{DEFAULT_CMD_TIMEOUT, TokioCommandRunner};
use crate::infra::config::load_build_config;
use crate::infra::download::HttpDownloader;
use crate::infra::fs::OsFs;
use crate::infra::mount::SystemMounts;
use crate::infra::ssh::{OpenSshConnector, SshDialer};
use crate::infra::xapi::XenApiClient;
use crate::output::{TerminalReporter, json, progress};

#[derive(Args)]
pub struct BuildArgs {
    /// Path to the YAML build template
    pub template: PathBuf,

    /// Replace the output directory if it already exists
    #[arg(long)]
    pub force: bool,

    /// Override the template's VM retention policy (never, on_success, always)
    #[arg(long, value_name = "POLICY")]
    pub keep_vm: Option<String>,
}

/// Run `xenpack build`.
///
/// # Errors
///
/// Returns an error if the template is invalid, the pool cannot be reached,
/// or the build halts.
pub async fn run(app: &AppContext, args: &BuildArgs) -> Result<()> {
    let mut config = load_build_config(&args.template)?;
    if let Some(policy) = &args.keep_vm {
        config.common.keep_vm = policy.parse::<KeepVm>()?;
    }

    let host = config.common.remote_host.clone();
    let pb = progress::spinner(&app.output, &format!("Connecting to {host}..."));
    let client = match XenApiClient::login(
        &host,
        &config.common.remote_username,
        &config.common.remote_password,
    )
    .await
    {
        Ok(client) => {
            progress::finish_ok(&pb, &format!("Connected to {host}"));
            Arc::new(client)
        }
        Err(e) => {
            progress::finish_error(&pb);
            return Err(e);
        }
    };

    let services = BuildServices {
        hypervisor: client.clone(),
        shells: Arc::new(OpenSshConnector::default()),
        dialer: Arc::new(SshDialer),
        downloader: Arc::new(HttpDownloader::new()?),
        mounts: Arc::new(SystemMounts::new(TokioCommandRunner::new(
            DEFAULT_CMD_TIMEOUT,
        ))),
        reporter: Arc::new(TerminalReporter::new(app.output.clone())),
    };
    let opts = BuildOptions { force: args.force };

    let result = run_build(config, services, &OsFs, &OsFs, app.cancel.clone(), opts).await;

    if let Err(e) = client.logout().await {
        tracing::warn!(error = %e, "XenAPI logout failed");
    }

    let outcome = result?;
    print_outcome(app, &outcome)
}

fn print_outcome(app: &AppContext, outcome: &BuildOutcome) -> Result<()> {
    let dir = outcome.output_dir.display().to_string();
    if app.is_json() {
        println!(
            "{}",
            json::format_artifact(&dir, &outcome.artifact).context("formatting build result")?
        );
        return Ok(());
    }

    let out = &app.output;
    out.kv("builder", &outcome.artifact.builder_id);
    out.kv("format", outcome.artifact.format.as_str());
    for file in &outcome.artifact.files {
        out.kv("file", &format!("{} ({} bytes)", file.name, file.bytes));
    }
    out.kv("metadata", &outcome.metadata_path.display().to_string());
    for timing in &outcome.report.timings {
        tracing::debug!(step = %timing.name, ms = timing.duration_ms, "step timing");
    }
    Ok(())
}
