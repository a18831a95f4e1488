use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::application::ports::Hypervisor;
use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::application::wait::{self, WaitSpec};
use crate::domain::network::MANAGEMENT_DEVICE;

use super::{finish, finish_wait};

const GUEST_IP_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll the guest metrics until the management interface reports an address.
pub struct WaitForGuestIp {
    timeout: Duration,
}

impl WaitForGuestIp {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Step<BuildContext> for WaitForGuestIp {
    fn name(&self) -> &str {
        "wait_for_guest_ip"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say("Step: Wait for VM IP to become available");
        let instance = match ctx.state.require_instance() {
            Ok(vm) => vm.clone(),
            Err(e) => return finish(ctx, Err(e.into())),
        };
        let hv: Arc<dyn Hypervisor> = ctx.services.hypervisor.clone();

        let spec = WaitSpec::new(GUEST_IP_POLL_INTERVAL, self.timeout);
        let result = wait::until(spec, &ctx.cancel, || {
            let hv = Arc::clone(&hv);
            let instance = instance.clone();
            async move {
                let ip = hv.guest_ip(&instance, MANAGEMENT_DEVICE).await?;
                tracing::debug!(ip = ?ip, "guest address poll");
                Ok(ip.is_some())
            }
        })
        .await;

        let action = finish_wait(ctx, result, "Unable to find an IP on the VM");
        if action == StepAction::Halt {
            return action;
        }

        let ip = hv
            .guest_ip(&instance, MANAGEMENT_DEVICE)
            .await
            .and_then(|ip| ip.context("the guest address disappeared after it was reported"));
        match ip {
            Ok(ip) => {
                ctx.reporter().success(&format!("Got IP '{ip}' from the guest"));
                ctx.state.guest_ip = Some(ip);
                StepAction::Continue
            }
            Err(e) => finish(ctx, Err(e)),
        }
    }
}
