//! Hidden `_server` command - One operation behind a unix socket
//!
//! Started by `dhctl server` for every operation stream; exits when the
//! stream is over.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use dhctl_common::DEFAULT_TMP_DIR;
use dhctl_server::{serve_worker, DhctlOperations, LogSink, WorkerConfig};

use super::DEFAULT_MODULES_DIR;
use crate::Result;

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Unix socket to listen on
    #[arg(long)]
    pub socket: PathBuf,

    #[arg(long, env = "DHCTL_TMP_DIR", default_value = DEFAULT_TMP_DIR)]
    pub tmp_dir: PathBuf,

    #[arg(long, env = "DHCTL_MODULES_DIR", default_value = DEFAULT_MODULES_DIR)]
    pub modules_dir: PathBuf,
}

pub async fn run(args: WorkerArgs, log_sink: Option<LogSink>) -> Result<()> {
    let config = WorkerConfig {
        socket: args.socket,
        tmp_dir: args.tmp_dir,
        modules_dir: args.modules_dir,
    };
    let operations = Arc::new(DhctlOperations::new(config.clone()));
    serve_worker(config, operations, log_sink).await?;
    Ok(())
}
