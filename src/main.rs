//! p2pfs - peer-to-peer content-addressed file store
//!
//! Thin binary over `p2pfs-core`: parse the command line, set up logging,
//! run one command.

use clap::Parser;
use p2pfs_core::{execute, Cli, Config};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::resolve(&cli.global) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log_level);

    let mut stdout = std::io::stdout();
    match execute(cli.command, config, &mut stdout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// Logs go to stderr so command output on stdout stays pipeable
fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
