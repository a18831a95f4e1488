use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::SshTarget;

use super::finish;

/// Run the configured shell commands on the guest through the forwarded port.
#[derive(Default)]
pub struct ProvisionGuest;

impl ProvisionGuest {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn provision(ctx: &BuildContext) -> Result<()> {
        let common = &ctx.config.common;
        let port = ctx.state.require_local_ssh_port()?;
        let target = SshTarget::new(
            Ipv4Addr::LOCALHOST.to_string(),
            port,
            common.ssh_username.clone(),
            common.ssh_auth.clone(),
        );
        let shell = ctx.services.shells.connect(&target);
        let output = shell
            .run_commands(&common.provision_commands)
            .await
            .context("Provisioning the guest failed")?;
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            ctx.reporter().message(line);
        }
        ctx.reporter().success(&format!(
            "Ran {} provisioning command(s)",
            common.provision_commands.len()
        ));
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for ProvisionGuest {
    fn name(&self) -> &str {
        "provision_guest"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        if ctx.config.common.provision_commands.is_empty() {
            return StepAction::Continue;
        }
        ctx.reporter().say("Step: Provision guest");
        let result = Self::provision(ctx).await;
        finish(ctx, result)
    }
}
