use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::runner::{Step, StepAction};
use crate::application::state::BuildContext;
use crate::domain::LookupError;

use super::finish;

/// Host-side commands that fetch the import script and use it to download
/// `iso_url` into the ISO library `sr_name` as `iso_name`.
#[must_use]
pub fn iso_import_commands(script_url: &str, sr_name: &str, iso_name: &str, iso_url: &str) -> Vec<String> {
    vec![
        "rm -f ./copyiso.sh".to_string(),
        format!("wget {script_url}copyiso.sh"),
        "chmod +x ./copyiso.sh".to_string(),
        format!("./copyiso.sh '{sr_name}' '{iso_name}' '{iso_url}' "),
        "rm -f ./copyiso.sh".to_string(),
    ]
}

/// Make sure the install ISO exists in an ISO library, importing it through
/// the hypervisor host when it does not.
///
/// - one image with the name: use it, no download
/// - several images with the name: ambiguous, fatal
/// - none: an `iso_url` must be configured and the target library must
///   resolve to exactly one SR; the import runs once on the host
#[derive(Default)]
pub struct IsoDownload;

impl IsoDownload {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn ensure_iso(ctx: &mut BuildContext) -> Result<()> {
        let Some(iso) = ctx.config.iso().cloned() else {
            anyhow::bail!("the ISO step needs an ISO builder configuration");
        };
        let hv = ctx.services.hypervisor.clone();
        let reporter = ctx.services.reporter.clone();

        let vdis = hv.vdis_by_name(&iso.iso_name).await?;
        match vdis.len() {
            1 => {
                reporter.message("ISO already in ISO library");
                ctx.state.iso_vdi = vdis.into_iter().next();
                return Ok(());
            }
            0 => {}
            count => {
                return Err(LookupError::Ambiguous {
                    kind: "ISO",
                    name: iso.iso_name.clone(),
                    count,
                }
                .into());
            }
        }

        let Some(url) = iso.iso_url.as_deref() else {
            anyhow::bail!(
                "ISO '{}' not in SR, but no download URL specified. Aborting.",
                iso.iso_name
            );
        };
        let sr_name = iso.iso_sr.clone().unwrap_or_default();
        let srs = hv.srs_by_name(&sr_name).await?;
        LookupError::exactly_one("ISO SR", &sr_name, srs)?;
        let script_url = ctx.config.common.script_url.clone().unwrap_or_default();

        reporter.message(&format!("Importing {} into '{sr_name}' from {url}", iso.iso_name));
        let commands = iso_import_commands(&script_url, &sr_name, &iso.iso_name, url);
        ctx.host_shell()
            .run_commands(&commands)
            .await
            .context("Error running ISO import on the hypervisor host")?;

        let imported = hv.vdis_by_name(&iso.iso_name).await?;
        ctx.state.iso_vdi = Some(LookupError::exactly_one("ISO", &iso.iso_name, imported)?);
        reporter.success("ISO import completed");
        Ok(())
    }
}

#[async_trait]
impl Step<BuildContext> for IsoDownload {
    fn name(&self) -> &str {
        "iso_download"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let name = ctx.config.iso().map(|i| i.iso_name.clone()).unwrap_or_default();
        ctx.reporter().say(&format!("Step: Locating ISO {name}"));
        let result = Self::ensure_iso(ctx).await;
        finish(ctx, result)
    }
}
