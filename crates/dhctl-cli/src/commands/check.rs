//! Check command - Compare the cluster with its configuration
//!
//! Usage: dhctl check [--output json|yaml]
//!
//! Plans every infrastructure step without applying anything and prints the
//! statistics. The destructive change id of the report is what
//! `dhctl converge --approve-destruction-change-id` expects.

use std::io::Write;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use tracing::info;

use dhctl_common::confirm::AutoAnswer;
use dhctl_converge::check_state;

use super::ClusterArgs;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

impl OutputFormat {
    fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        }
    }
}

/// Check the cluster
#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Report format
    #[arg(short = 'o', long, value_enum, default_value = "yaml")]
    pub output: OutputFormat,
}

pub async fn run(args: CheckArgs) -> Result<()> {
    // check never applies, any question it meets is declined
    let prepared = args.cluster.prepare(Arc::new(AutoAnswer::no())).await?;
    let statistics = check_state(prepared.client.as_ref(), &prepared.meta, &prepared.infra)
        .await
        .into_result()?;
    info!(
        destructive = statistics.has_destructive_changes(),
        "Cluster checked"
    );

    let report = statistics.format(args.output.as_str())?;
    let mut stdout = std::io::stdout();
    stdout
        .write_all(&report)
        .and_then(|_| stdout.flush())
        .map_err(|e| Error::io("stdout", e))?;
    Ok(())
}
