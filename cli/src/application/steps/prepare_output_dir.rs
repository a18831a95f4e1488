use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;

use super::finish;

/// Create the output directory; with `force`, replace an existing one.
/// An interrupted build removes it again.
pub struct PrepareOutputDir {
    force: bool,
    created: bool,
}

impl PrepareOutputDir {
    #[must_use]
    pub fn new(force: bool) -> Self {
        Self {
            force,
            created: false,
        }
    }

    async fn prepare(&mut self, ctx: &BuildContext) -> Result<()> {
        let dir = &ctx.config.common.output_directory;
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            anyhow::ensure!(
                self.force,
                "Output directory '{}' already exists. Use --force to replace it.",
                dir.display()
            );
            ctx.reporter()
                .message(&format!("Deleting previous output directory {}", dir.display()));
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("removing {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        self.created = true;
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for PrepareOutputDir {
    fn name(&self) -> &str {
        "prepare_output_dir"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let result = self.prepare(ctx).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if !self.created || ctx.state.interruption.is_none() {
            return Ok(());
        }
        let dir = &ctx.config.common.output_directory;
        ctx.reporter().say("Deleting output directory...");
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("removing {}", dir.display()))
    }
}
