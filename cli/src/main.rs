//! xenpack: build XenServer VM images from templates

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use xenpack_cli::cli::Cli;
use xenpack_cli::output::json;

/// Environment variable holding the tracing filter directive.
const LOG_ENV: &str = "XENPACK_LOG";

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = cli.json;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, cleaning up...");
            on_signal.cancel();
        }
    });

    if let Err(e) = cli.run(cancel).await {
        match json::format_error(&format!("{e:#}"), "COMMAND_FAILED") {
            Ok(doc) if json_mode => println!("{doc}"),
            _ => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }
}
