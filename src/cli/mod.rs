use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, ConfigStore};
use crate::connector::ConnectOptions;
use crate::protocol::ProtocolError;
use crate::transfer::TransferError;

mod register;
mod upload;

#[derive(Parser, Debug)]
#[command(name = "luxbox", version, about = "Client for the Luxbox resource server", long_about = None)]
pub struct Cli {
    /// Configuration file to use instead of ~/.luxbox.yaml
    #[arg(long, global = true, env = "LUXBOX_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Give up on the server after this many seconds without progress
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,
    /// Print debug logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a new user at the Luxbox server
    Register,
    /// Copy the resource to the Luxbox server
    Upload {
        /// Path to the local resource
        path: PathBuf,
        /// Create the resource on the server with the specified name, omit to use local resource name
        #[arg(short, long)]
        name: Option<String>,
        /// Overwrite resource if it already exists
        #[arg(
            short,
            long,
            action = ArgAction::Set,
            num_args = 0..=1,
            default_value_t = false,
            default_missing_value = "true"
        )]
        overwrite: bool,
    },
}

/// Failures a command reports to the user.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("server responded with code {code}: {data}")]
    ServerError { code: i64, data: Value },
    #[error("failed to access {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("server response is missing '{0}'")]
    MissingField(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let store = match &self.config {
            Some(path) => ConfigStore::new(path),
            None => ConfigStore::in_home_dir()?,
        };
        let options = self.connect_options();

        match self.command {
            Commands::Register => register::run(&store, options)?,
            Commands::Upload {
                path,
                name,
                overwrite,
            } => upload::run(
                &store,
                options,
                &upload::UploadArgs {
                    path: &path,
                    name: name.as_deref(),
                    overwrite,
                },
            )?,
        }
        Ok(())
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            // Sockets reject a zero timeout; treat it as no timeout.
            timeout: self
                .timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}
