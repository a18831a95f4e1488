//! NFS mounts on the build host through `mount`/`umount`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::ports::{CommandRunner, MountManager};

/// Mounts through the system tools via a [`CommandRunner`].
pub struct SystemMounts<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> SystemMounts<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = self
            .runner
            .run(program, args)
            .await
            .with_context(|| format!("running {program}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{program} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> MountManager for SystemMounts<R> {
    async fn mount(&self, source: &str, target: &Path) -> Result<()> {
        let target = target.to_string_lossy();
        tracing::debug!(source, target = %target, "mounting");
        self.run("mount", &["-t", "nfs", source, &target]).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.to_string_lossy();
        tracing::debug!(target = %target, "unmounting");
        self.run("umount", &[&target]).await
    }
}
