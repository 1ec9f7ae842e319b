use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;

mod cli;
mod config;
mod connector;
mod progress;
mod protocol;
#[cfg(test)]
mod test_support;
mod transfer;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when both are given.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    cli.run()
}
