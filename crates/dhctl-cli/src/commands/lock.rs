//! Lock command - Manage the converge lock
//!
//! Usage: dhctl lock release --kubeconfig <path>

use clap::{Args, Subcommand};
use tracing::info;

use dhctl_converge::{force_release, LockConfig};

use super::ConnectionArgs;
use crate::Result;

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Delete the converge lease whoever holds it
    Release(LockReleaseArgs),
}

#[derive(Args, Debug)]
pub struct LockReleaseArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

pub async fn run(command: LockCommand) -> Result<()> {
    match command {
        LockCommand::Release(args) => {
            let config = LockConfig::default();
            let client = args.connection.client().await?;
            force_release(client.as_ref(), &config).await?;
            info!(lease = %config.name, namespace = %config.namespace, "Converge lock released");
            Ok(())
        }
    }
}
