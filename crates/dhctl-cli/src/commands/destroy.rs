//! Destroy command - Delete the cluster infrastructure
//!
//! Usage: dhctl destroy --kubeconfig <path> [--yes]
//!
//! Removes the node groups, destroys every node (workers before masters)
//! and finally the base infrastructure.

use std::sync::Arc;

use clap::Args;
use tracing::info;

use dhctl_common::confirm::{AutoAnswer, Confirm, TerminalPrompt};
use dhctl_converge::{destroy_cluster, ConvergeSettings, LockConfig};
use dhctl_phases::Operation;

use super::{handle_interrupts, ClusterArgs};
use crate::{Error, Result};

/// Destroy the cluster
#[derive(Args, Debug)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

pub async fn run(args: DestroyArgs) -> Result<()> {
    let confirm: Arc<dyn Confirm> = if args.yes {
        Arc::new(AutoAnswer::yes())
    } else {
        Arc::new(TerminalPrompt)
    };
    let prepared = args.cluster.prepare(confirm.clone()).await?;
    if !confirm.ask(
        &format!(
            "Do you really want to DELETE all resources of cluster {}?",
            prepared.meta.cluster_prefix
        ),
        false,
    ) {
        return Err(Error::Declined("cluster destruction declined".to_string()));
    }
    handle_interrupts(prepared.tomb.clone());

    let pipeline = prepared.pipeline(Operation::Destroy);
    let ctx = prepared.converge_context(ConvergeSettings {
        auto_approve: true,
        ..Default::default()
    });
    destroy_cluster(&ctx, &pipeline, LockConfig::default()).await?;

    info!("Cluster destroyed");
    Ok(())
}
