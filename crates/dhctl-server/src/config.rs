//! Settings of the gateway and worker processes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dhctl_common::DEFAULT_TMP_DIR;

/// Default number of operations running at once
pub const DEFAULT_PARALLEL_TASKS: usize = 10;

/// How long a request waits for a free slot before ResourceExhausted
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a fresh worker may take to report SERVING
pub const DEFAULT_WORKER_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Hidden sub-command that runs a worker
pub const WORKER_SUBCOMMAND: &str = "_server";

/// Program and leading arguments used to start a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The running executable with its hidden worker sub-command
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![WORKER_SUBCOMMAND.to_string()],
        })
    }
}

/// Gateway settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub parallel_tasks: usize,
    pub request_timeout: Duration,
    /// Root of worker sockets and per-invocation caches
    pub tmp_dir: PathBuf,
    pub worker: WorkerCommand,
    pub worker_health_timeout: Duration,
}

impl ServerConfig {
    pub fn new(address: SocketAddr, worker: WorkerCommand) -> Self {
        Self {
            address,
            parallel_tasks: DEFAULT_PARALLEL_TASKS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            worker,
            worker_health_timeout: DEFAULT_WORKER_HEALTH_TIMEOUT,
        }
    }
}

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unix socket the worker listens on
    pub socket: PathBuf,
    pub tmp_dir: PathBuf,
    /// Infrastructure tool modules (`<modules>/<provider>/layouts/<layout>/<step>`)
    pub modules_dir: PathBuf,
}

const DEFAULT_GRPC_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest message on the DHCTL streams; states of big clusters exceed the tonic default
pub fn grpc_max_message_size() -> usize {
    std::env::var("DHCTL_GRPC_MAX_MESSAGE_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_GRPC_MAX_MESSAGE_SIZE)
}
