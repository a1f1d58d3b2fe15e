//! Waiting for nodes to join the cluster

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use dhctl_common::tomb::Tomb;
use dhctl_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};

use crate::client::{is_node_ready, is_pod_ready, ClusterClient};

/// Label selector of the control plane manager pods
pub const CONTROL_PLANE_MANAGER_SELECTOR: &str = "app=d8-control-plane-manager";

/// How long readiness is polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSettings {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: 100,
            interval: Duration::from_secs(20),
        }
    }
}

/// Decides whether a node is usable
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeChecker: Send + Sync {
    async fn is_ready(&self, node: &str) -> Result<bool>;
}

/// `Ready=True` on the Node object
pub struct NodeReadyChecker {
    client: Arc<dyn ClusterClient>,
}

impl NodeReadyChecker {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeChecker for NodeReadyChecker {
    async fn is_ready(&self, node: &str) -> Result<bool> {
        Ok(self.client.get_node(node).await?.as_ref().is_some_and(is_node_ready))
    }
}

/// Node ready and its control plane manager pod running
pub struct ControlPlaneChecker {
    client: Arc<dyn ClusterClient>,
}

impl ControlPlaneChecker {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeChecker for ControlPlaneChecker {
    async fn is_ready(&self, node: &str) -> Result<bool> {
        if !self.client.get_node(node).await?.as_ref().is_some_and(is_node_ready) {
            return Ok(false);
        }
        let pods = self
            .client
            .list_pods(KUBE_SYSTEM_NAMESPACE, CONTROL_PLANE_MANAGER_SELECTOR)
            .await?;
        let ready = pods
            .iter()
            .filter(|pod| pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
            .any(is_pod_ready);
        if !ready {
            debug!(node, "Control plane manager is not ready yet");
        }
        Ok(ready)
    }
}

/// Poll until every node of `nodes` is ready
pub async fn wait_for_nodes_list_ready(
    checker: &dyn NodeChecker,
    nodes: &[String],
    settings: &ReadinessSettings,
    tomb: &Tomb,
) -> Result<()> {
    let mut waiting: Vec<&String> = nodes.iter().collect();
    for attempt in 1..=settings.attempts.max(1) {
        if tomb.is_interrupted() {
            return Err(Error::ConvergeInterrupted);
        }

        let mut still_waiting = Vec::new();
        for node in waiting {
            match checker.is_ready(node).await {
                Ok(true) => info!(node = %node, "Node is ready"),
                Ok(false) => still_waiting.push(node),
                Err(e) => {
                    warn!(node = %node, error = %e, "Node readiness check failed");
                    still_waiting.push(node);
                }
            }
        }
        waiting = still_waiting;
        if waiting.is_empty() {
            return Ok(());
        }

        debug!(attempt, waiting = ?waiting, "Waiting for nodes to become ready");
        if attempt < settings.attempts {
            tokio::select! {
                _ = tokio::time::sleep(settings.interval) => {}
                _ = tomb.interrupted() => return Err(Error::ConvergeInterrupted),
            }
        }
    }

    let waiting: Vec<&str> = waiting.iter().map(|n| n.as_str()).collect();
    Err(Error::internal_with_context(
        "node readiness",
        format!("nodes {} are not ready", waiting.join(", ")),
    ))
}

pub async fn wait_for_single_node_ready(
    checker: &dyn NodeChecker,
    node: &str,
    settings: &ReadinessSettings,
    tomb: &Tomb,
) -> Result<()> {
    wait_for_nodes_list_ready(checker, &[node.to_string()], settings, tomb).await
}
