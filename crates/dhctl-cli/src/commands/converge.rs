//! Converge command - Bring the cluster in line with its configuration
//!
//! Usage: dhctl converge [--config cluster.yaml,provider.yaml] [--yes]
//!
//! Takes the converge lock, then converges the base infrastructure, every
//! node group and the Deckhouse configuration. Interrupted runs resume from
//! the state kept in the cluster and the local cache.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use clap::Args;
use tracing::info;

use dhctl_common::confirm::{AutoAnswer, Confirm, TerminalPrompt};
use dhctl_converge::{ConvergeEngine, ConvergeSettings, LockConfig};
use dhctl_phases::{Operation, OperationPhase};

use super::{handle_interrupts, ClusterArgs};
use crate::Result;

fn parse_phase(name: &str) -> std::result::Result<OperationPhase, String> {
    OperationPhase::parse(name).ok_or_else(|| format!("unknown phase {name}"))
}

/// Converge the cluster
#[derive(Args, Debug)]
pub struct ConvergeArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Apply every change without asking
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,

    /// Never apply destructive changes and never delete nodes
    #[arg(long)]
    pub skip_destructive: bool,

    /// Phases to leave out (e.g. base-infrastructure)
    #[arg(long, value_delimiter = ',', value_parser = parse_phase)]
    pub skip_phases: Vec<OperationPhase>,

    /// Nodes left untouched
    #[arg(long = "exclude-nodes", value_delimiter = ',')]
    pub excluded_nodes: Vec<String>,

    /// Create new node groups one after another
    #[arg(long)]
    pub sequential_bootstrap: bool,

    /// Destructive change id reviewed with `dhctl check`; a matching plan is applied without asking
    #[arg(long, env = "DHCTL_APPROVE_DESTRUCTION_CHANGE_ID")]
    pub approve_destruction_change_id: Option<String>,
}

impl ConvergeArgs {
    pub fn settings(&self) -> ConvergeSettings {
        ConvergeSettings {
            auto_approve: self.yes,
            auto_dismiss_destructive: self.skip_destructive,
            excluded_nodes: self.excluded_nodes.iter().cloned().collect::<BTreeSet<_>>(),
            skip_phases: self.skip_phases.iter().copied().collect::<HashSet<_>>(),
            sequential_bootstrap: self.sequential_bootstrap,
            approve_destruction_change_id: self.approve_destruction_change_id.clone(),
            ..Default::default()
        }
    }

    fn confirm(&self) -> Arc<dyn Confirm> {
        if self.yes {
            Arc::new(AutoAnswer::yes())
        } else {
            Arc::new(TerminalPrompt)
        }
    }
}

pub async fn run(args: ConvergeArgs) -> Result<()> {
    let prepared = args.cluster.prepare(args.confirm()).await?;
    handle_interrupts(prepared.tomb.clone());

    let pipeline = prepared.pipeline(Operation::Converge);
    let ctx = prepared.converge_context(args.settings());
    ConvergeEngine::new(ctx, LockConfig::default()).run(&pipeline).await?;

    info!("Cluster converged");
    Ok(())
}
