// crates/client/src/main.rs
//! jobwatch: follow and control backend jobs from the terminal.

use std::process::ExitCode;

use clap::Parser;
use jobwatch_client::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  \u{2717} {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Keep the guard alive for the whole run so the log file is flushed.
    let _telemetry = match jobwatch_observability::init_tracing(&config.telemetry) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("  \u{2717} failed to initialise logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli::run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("  \u{2717} {e:#}");
            ExitCode::FAILURE
        }
    }
}
