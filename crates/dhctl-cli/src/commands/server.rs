//! Server command - Serve dhctl operations over gRPC
//!
//! Usage: dhctl server [--address 0.0.0.0:51051] [--parallel-tasks 10]
//!
//! Every operation stream runs in a worker subprocess started from this
//! executable with the hidden `_server` sub-command.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tracing::{info, warn};

use dhctl_common::telemetry::LogFormat;
use dhctl_common::DEFAULT_TMP_DIR;
use dhctl_server::config::{DEFAULT_PARALLEL_TASKS, DEFAULT_WORKER_HEALTH_TIMEOUT};
use dhctl_server::{serve_gateway, ServerConfig, WorkerCommand};

use super::DEFAULT_MODULES_DIR;
use crate::{Error, Result};

/// Serve operations over gRPC
#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Listen address
    #[arg(long, env = "DHCTL_SERVER_ADDRESS", default_value = "0.0.0.0:51051")]
    pub address: SocketAddr,

    /// Operations running at once
    #[arg(long, env = "DHCTL_SERVER_PARALLEL_TASKS", default_value_t = DEFAULT_PARALLEL_TASKS)]
    pub parallel_tasks: usize,

    /// Milliseconds a request waits for a free slot
    #[arg(long, env = "DHCTL_SERVER_REQUEST_TIMEOUT_MS", default_value_t = 1000)]
    pub request_timeout_ms: u64,

    /// Seconds a worker may take to come up
    #[arg(
        long,
        env = "DHCTL_SERVER_WORKER_TIMEOUT_SECS",
        default_value_t = DEFAULT_WORKER_HEALTH_TIMEOUT.as_secs(),
    )]
    pub worker_timeout_secs: u64,

    /// Root of worker sockets and state caches
    #[arg(long, env = "DHCTL_TMP_DIR", default_value = DEFAULT_TMP_DIR)]
    pub tmp_dir: PathBuf,

    /// Infrastructure modules directory passed to workers
    #[arg(long, env = "DHCTL_MODULES_DIR", default_value = DEFAULT_MODULES_DIR)]
    pub modules_dir: PathBuf,
}

impl ServerArgs {
    pub fn config(&self, worker: WorkerCommand) -> ServerConfig {
        ServerConfig {
            parallel_tasks: self.parallel_tasks,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            tmp_dir: self.tmp_dir.clone(),
            worker_health_timeout: Duration::from_secs(self.worker_timeout_secs),
            ..ServerConfig::new(self.address, worker)
        }
    }
}

/// Workers inherit the log settings and the modules directory
fn worker_command(args: &ServerArgs, log_format: LogFormat, debug: bool) -> Result<WorkerCommand> {
    let mut command = WorkerCommand::current_exe().map_err(|e| Error::io("current executable", e))?;
    command.args.push("--modules-dir".to_string());
    command.args.push(args.modules_dir.display().to_string());
    command.args.push("--log-format".to_string());
    command.args.push(
        match log_format {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
        .to_string(),
    );
    if debug {
        command.args.push("--debug".to_string());
    }
    Ok(command)
}

pub async fn run(args: ServerArgs, log_format: LogFormat, debug: bool) -> Result<()> {
    let config = args.config(worker_command(&args, log_format, debug)?);
    info!(worker = %config.worker.program.display(), "Workers start from this executable");

    serve_gateway(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for interrupts");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: ServerArgs,
    }

    #[test]
    fn test_defaults() {
        let wrapper = Wrapper::try_parse_from(["server"]).unwrap();
        let config = wrapper.args.config(WorkerCommand {
            program: PathBuf::from("/usr/bin/dhctl"),
            args: vec!["_server".to_string()],
        });
        assert_eq!(config.address, "0.0.0.0:51051".parse::<SocketAddr>().unwrap());
        assert_eq!(config.parallel_tasks, DEFAULT_PARALLEL_TASKS);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.worker_health_timeout, DEFAULT_WORKER_HEALTH_TIMEOUT);
    }

    #[test]
    fn test_worker_gets_log_settings() {
        let wrapper = Wrapper::try_parse_from(["server", "--modules-dir", "/opt/modules"]).unwrap();
        let command = worker_command(&wrapper.args, LogFormat::Json, true).unwrap();
        assert_eq!(
            command.args,
            ["_server", "--modules-dir", "/opt/modules", "--log-format", "json", "--debug"]
        );
    }
}
