use anyhow::Result;
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::application::tunnel::{self, ForwardHandle, TunnelRoute};

use super::finish;

/// Expose the guest's SSH port on a local port, tunnelled through the host
/// the VM runs on.
#[derive(Default)]
pub struct ForwardGuestPort {
    handle: Option<ForwardHandle>,
}

impl ForwardGuestPort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn forward(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let common = &ctx.config.common;
        let guest_ip = ctx.state.require_guest_ip()?.to_string();
        let listener = tunnel::bind_first_free(common.host_port_min, common.host_port_max).await?;
        let route = TunnelRoute {
            entry: ctx.host_target(),
            dest_host: guest_ip.clone(),
            dest_port: common.ssh_port,
        };
        let handle = tunnel::open_tunnel(listener, ctx.services.dialer.clone(), route)?;
        let port = handle.local_port();
        ctx.reporter().message(&format!(
            "Forwarding 127.0.0.1:{port} to {guest_ip}:{}",
            common.ssh_port
        ));
        tracing::info!(local_port = port, guest = %guest_ip, "guest port forwarded");
        ctx.state.local_ssh_port = Some(port);
        self.handle = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for ForwardGuestPort {
    fn name(&self) -> &str {
        "forward_guest_port"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Forward guest SSH port");
        let result = self.forward(ctx).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
            ctx.state.local_ssh_port = None;
        }
        Ok(())
    }
}
