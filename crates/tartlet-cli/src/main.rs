//! tartlet - run engine for macOS and Linux VMs on Apple Silicon.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod engine;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "tartlet=debug" } else { "tartlet=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
    };

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(tartlet_constants::status::EXIT_FAILURE);
    }
}
