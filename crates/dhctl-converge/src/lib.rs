//! Converge operations of dhctl
//!
//! Reconciles a running cluster with its desired configuration: the base
//! infrastructure, every node group and the configuration Secrets, under
//! the converge lease. The check, destroy, bootstrap, abort and commander
//! operations share the same state persistence and cluster client.

pub mod bootstrap;
pub mod check;
pub mod client;
pub mod commander;
pub mod context;
pub mod controller;
pub mod deckhouse;
pub mod destroy;
pub mod destructive;
pub mod engine;
pub mod hooks;
pub mod lock;
pub mod node_user;
pub mod readiness;
pub mod savers;
pub mod state;

#[cfg(test)]
mod testing;

pub use bootstrap::{bootstrap_cluster, BootstrapResult};
pub use check::{check_state, CheckReport, CheckStatus, Statistics};
pub use client::{ClusterClient, KubeClusterClient};
pub use commander::{commander_attach, commander_detach, CommanderAttachResult};
pub use context::{ConvergeContext, ConvergeSettings, DirectTransport, NodeSession, NodeTransport};
pub use deckhouse::{load_meta_config, update_deckhouse_configuration};
pub use destroy::{abort_bootstrap, destroy_cluster};
pub use destructive::destructive_change_id;
pub use engine::ConvergeEngine;
pub use lock::{force_release, ConvergeLock, LockConfig};
