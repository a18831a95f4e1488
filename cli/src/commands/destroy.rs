//! `xenpack destroy <output-dir>`: remove a build's output directory.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::services::artifact;
use crate::infra::fs::OsFs;

#[derive(Args)]
pub struct DestroyArgs {
    /// Output directory of a previous build
    pub output_dir: PathBuf,
}

/// Run `xenpack destroy`.
///
/// # Errors
///
/// Returns an error if the directory does not exist or cannot be removed.
pub fn run(app: &AppContext, args: &DestroyArgs) -> Result<()> {
    artifact::destroy(&args.output_dir, &OsFs)?;
    if app.is_json() {
        println!(
            "{}",
            serde_json::json!({ "destroyed": args.output_dir.display().to_string() })
        );
    } else {
        app.output
            .success(&format!("Removed {}", args.output_dir.display()));
    }
    Ok(())
}
