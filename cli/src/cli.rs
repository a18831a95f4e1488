//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, OutputFlags};
use crate::commands;

/// Build XenServer VM images from templates
#[derive(Parser)]
#[command(
    name = "xenpack",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a template
    Build(commands::build::BuildArgs),

    /// Check a template without contacting the hypervisor
    Validate(commands::validate::ValidateArgs),

    /// Remove a build output directory
    Destroy(commands::destroy::DestroyArgs),

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Cli {
            no_color,
            quiet,
            json,
            command,
        } = self;
        let app = AppContext::new(
            OutputFlags {
                no_color,
                quiet,
                json,
            },
            cancel,
        );
        match command {
            Command::Build(args) => commands::build::run(&app, &args).await,
            Command::Validate(args) => commands::validate::run(&app, &args),
            Command::Destroy(args) => commands::destroy::run(&app, &args),
            Command::Version => {
                commands::version::run(app.is_json());
                Ok(())
            }
        }
    }
}
