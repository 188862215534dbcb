use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use fcgiwrap::{logging, signals, Server, ShutdownReason};

mod cli;

use cli::Cli;

fn run(cli: &Cli) -> anyhow::Result<ShutdownReason> {
    let config = cli.to_config().context("invalid configuration")?;
    signals::install().context("installing signal handlers")?;
    let server = Server::bind(config).context("setting up listener")?;
    server.serve()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build_date = env!("FCGIWRAP_BUILD_DATE"),
        target = env!("FCGIWRAP_BUILD_TARGET"),
        profile = env!("FCGIWRAP_BUILD_PROFILE"),
        rustc = env!("FCGIWRAP_BUILD_RUSTC"),
        "starting fcgiwrap"
    );

    match run(&cli) {
        Ok(reason) => {
            tracing::info!(reason = %reason, "exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            ExitCode::from(1)
        }
    }
}
