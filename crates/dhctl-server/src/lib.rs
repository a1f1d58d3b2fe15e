//! dhctl server
//!
//! - **Gateway**: the public DHCTL service; admits at most `parallel_tasks`
//!   streams and proxies each one to a fresh worker subprocess
//! - **Worker**: runs one operation behind a unix socket and drives its
//!   phases from the client's Continue decisions
//! - **Validation**: unary checks of configuration documents
//! - **Status**: request counters of the gateway

pub mod config;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod log_forward;
pub mod messages;
pub mod operations;
pub mod serve;
pub mod session;
pub mod status;
pub mod validation;
pub mod worker;

pub use config::{ServerConfig, WorkerCommand, WorkerConfig, WORKER_SUBCOMMAND};
pub use error::{Result, ServerError};
pub use gateway::Gateway;
pub use limiter::Limiter;
pub use log_forward::LogSink;
pub use operations::{DhctlOperations, OperationSession, Operations};
pub use serve::{serve_gateway, serve_worker, WorkerService};
pub use status::{RequestStats, StatusService};
pub use validation::ValidationService;
pub use worker::{Worker, WorkerLauncher};
