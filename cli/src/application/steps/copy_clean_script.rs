use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;

use super::finish;

/// Script the guest fetches from the host's web root on first boot.
pub const CLEAN_SCRIPT: &str = "xenpack-clean.sh";
const WEB_ROOT: &str = "/opt/xensource/www";

fn removal_commands() -> Vec<String> {
    vec![
        format!("rm -f ./{CLEAN_SCRIPT}"),
        format!("rm -f {WEB_ROOT}/{CLEAN_SCRIPT}"),
    ]
}

fn install_commands(script_url: &str) -> Vec<String> {
    let mut cmds = removal_commands();
    cmds.push(format!("wget {script_url}{CLEAN_SCRIPT}"));
    cmds.push(format!("cp ./{CLEAN_SCRIPT} {WEB_ROOT}/{CLEAN_SCRIPT}"));
    cmds.push(format!("rm -f ./{CLEAN_SCRIPT}"));
    cmds
}

/// Publish the guest clean script on the hypervisor host.
#[derive(Default)]
pub struct CopyCleanScript {
    installed: bool,
}

impl CopyCleanScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn install(&mut self, ctx: &BuildContext, script_url: &str) -> Result<()> {
        ctx.host_shell()
            .run_commands(&install_commands(script_url))
            .await
            .context("Error saving script on the hypervisor host")?;
        self.installed = true;
        ctx.reporter().success("Script copy complete");
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for CopyCleanScript {
    fn name(&self) -> &str {
        "copy_clean_script"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Copy clean script");
        let Some(script_url) = ctx.config.common.script_url.clone() else {
            ctx.reporter().message("No script_url configured, skipping");
            return StepAction::Continue;
        };
        let result = self.install(ctx, &script_url).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if !self.installed {
            return Ok(());
        }
        ctx.reporter().say("Removing clean script from the host");
        ctx.host_shell()
            .run_commands(&removal_commands())
            .await
            .context("Error removing script on the hypervisor host")?;
        self.installed = false;
        Ok(())
    }
}
