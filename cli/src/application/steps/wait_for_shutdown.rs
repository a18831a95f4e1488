use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use xenpack_common::PowerState;

use crate::application::ports::Hypervisor;
use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::application::wait::{self, WaitSpec};

use super::{finish, finish_wait};

/// Power state is checked this rarely; shutdowns and installs take minutes.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Poll the power state until the VM is `Halted`.
///
/// Used after a shutdown request and, in the ISO builder, to wait for the
/// installer to power the VM off.
pub struct WaitForShutdown {
    timeout: Duration,
    poll_interval: Duration,
}

impl WaitForShutdown {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: SHUTDOWN_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl Step<BuildContext> for WaitForShutdown {
    fn name(&self) -> &str {
        "wait_for_shutdown"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        ctx.reporter().say(&format!(
            "Step: Wait for VM shutdown (timeout {}s)",
            self.timeout.as_secs()
        ));
        let instance = match ctx.state.require_instance() {
            Ok(vm) => vm.clone(),
            Err(e) => return finish(ctx, Err(e.into())),
        };
        let hv: Arc<dyn Hypervisor> = ctx.services.hypervisor.clone();

        let spec = WaitSpec::new(self.poll_interval, self.timeout);
        let result = wait::until(spec, &ctx.cancel, || {
            let hv = Arc::clone(&hv);
            let instance = instance.clone();
            async move {
                let state = hv.power_state(&instance).await?;
                tracing::debug!(%state, "power state poll");
                Ok(state == PowerState::Halted)
            }
        })
        .await;

        let action = finish_wait(ctx, result, "Error waiting for VM to halt");
        if action == StepAction::Continue {
            ctx.reporter().success("VM shut down");
        }
        action
    }
}
