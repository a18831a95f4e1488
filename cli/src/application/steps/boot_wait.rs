use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::application::wait;

/// Give the guest `boot_wait` to come up. Cancellation cuts the wait short;
/// the orchestrator notices it before the next step.
#[derive(Default)]
pub struct BootWait;

impl BootWait {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step<BuildContext> for BootWait {
    fn name(&self) -> &str {
        "boot_wait"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let delay = ctx.config.common.boot_wait;
        if delay.is_zero() {
            return StepAction::Continue;
        }
        ctx.reporter()
            .say(&format!("Waiting {}s for boot...", delay.as_secs()));
        wait::sleep(delay, &ctx.cancel).await;
        StepAction::Continue
    }
}
