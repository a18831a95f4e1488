use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;

use super::finish;

/// Mount the storage repository's NFS export under `<output>/nfs` so the
/// `vhd` export can copy disk files directly. Does nothing when no
/// `nfs_mount` is configured.
#[derive(Default)]
pub struct PrepareNfsExport {
    mounted: bool,
}

impl PrepareNfsExport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn mount(&mut self, ctx: &BuildContext, source: &str) -> Result<()> {
        let mount_point = ctx.config.common.nfs_mount_point();

        if tokio::fs::try_exists(&mount_point).await.unwrap_or(false) {
            ctx.reporter().message("Deleting previous mount point directory...");
            tokio::fs::remove_dir_all(&mount_point)
                .await
                .with_context(|| format!("removing {}", mount_point.display()))?;
        }
        tokio::fs::create_dir_all(&mount_point)
            .await
            .with_context(|| format!("creating {}", mount_point.display()))?;

        ctx.services
            .mounts
            .mount(source, &mount_point)
            .await
            .with_context(|| format!("Unable to mount NFS SR '{source}' locally"))?;
        self.mounted = true;
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for PrepareNfsExport {
    fn name(&self) -> &str {
        "prepare_nfs_export"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let Some(source) = ctx.config.common.nfs_mount.clone() else {
            return StepAction::Continue;
        };
        ctx.reporter().say("Step: Mounting NFS export");
        let result = self.mount(ctx, &source).await;
        finish(ctx, result)
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let mount_point = ctx.config.common.nfs_mount_point();
        ctx.reporter().say("Unmounting NFS export...");
        ctx.services
            .mounts
            .unmount(&mount_point)
            .await
            .with_context(|| format!("Unable to unmount '{}'", mount_point.display()))?;
        self.mounted = false;
        tokio::fs::remove_dir_all(&mount_point)
            .await
            .with_context(|| format!("removing {}", mount_point.display()))
    }
}
