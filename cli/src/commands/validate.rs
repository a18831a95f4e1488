//! `xenpack validate <template>`: check a template offline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::app::AppContext;
use crate::domain::BuilderConfig;
use crate::infra::config::{PASSWORD_ENV, load_template};

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the YAML build template
    pub template: PathBuf,
}

/// Run `xenpack validate`.
///
/// # Errors
///
/// Returns an error listing every problem in the template.
pub fn run(app: &AppContext, args: &ValidateArgs) -> Result<()> {
    let template = load_template(&args.template)?;
    let builder = template.builder_type();
    let password = std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty());
    let config = template
        .prepare(password)
        .with_context(|| format!("invalid template {}", args.template.display()))?;

    if app.is_json() {
        println!(
            "{}",
            serde_json::json!({
                "valid": true,
                "builder": builder,
                "vm_name": config.common.vm_name,
                "format": config.common.format,
            })
        );
        return Ok(());
    }

    let out = &app.output;
    out.success(&format!("Template {} is valid", args.template.display()));
    out.kv("builder", builder);
    out.kv("vm_name", &config.common.vm_name);
    out.kv("format", &config.common.format);
    out.kv(
        "output_directory",
        &config.common.output_directory.display().to_string(),
    );
    match &config.builder {
        BuilderConfig::Vm(vm) => out.kv("source_vm", &vm.source_vm),
        BuilderConfig::Iso(iso) => {
            out.kv("iso_name", &iso.iso_name);
            for disk in &iso.disks {
                out.kv("disk", &format!("{} ({} MiB)", disk.name, disk.size_mib));
            }
        }
    }
    Ok(())
}
