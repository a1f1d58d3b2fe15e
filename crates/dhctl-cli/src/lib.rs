//! dhctl CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

use dhctl_common::telemetry::{LogFormat, TelemetryConfig};
use dhctl_server::LogSink;

/// dhctl - Deckhouse cluster converge tool
#[derive(Parser, Debug)]
#[command(name = "dhctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log format: text or json
    #[arg(long, global = true, env = "DHCTL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "DHCTL_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Converge the cluster with its configuration
    Converge(commands::converge::ConvergeArgs),
    /// Compare the cluster with its configuration without changing it
    Check(commands::check::CheckArgs),
    /// Destroy the cluster infrastructure
    Destroy(commands::destroy::DestroyArgs),
    /// Converge lock management
    #[command(subcommand)]
    Lock(commands::lock::LockCommand),
    /// Serve operations over gRPC
    Server(commands::server::ServerArgs),
    /// Run one operation behind a unix socket (started by `server`)
    #[command(name = "_server", hide = true)]
    Worker(commands::worker::WorkerArgs),
}

impl Cli {
    pub fn is_worker(&self) -> bool {
        matches!(self.command, Commands::Worker(_))
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            debug: self.debug,
            ..Default::default()
        }
    }

    /// Run the CLI command
    pub async fn run(self, log_sink: Option<LogSink>) -> Result<()> {
        let Cli {
            log_format,
            debug,
            command,
        } = self;
        match command {
            Commands::Converge(args) => commands::converge::run(args).await,
            Commands::Check(args) => commands::check::run(args).await,
            Commands::Destroy(args) => commands::destroy::run(args).await,
            Commands::Lock(command) => commands::lock::run(command).await,
            Commands::Server(args) => commands::server::run(args, log_format, debug).await,
            Commands::Worker(args) => commands::worker::run(args, log_sink).await,
        }
    }
}
