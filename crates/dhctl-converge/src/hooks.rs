//! Control plane hooks run around master applies and destroys

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use dhctl_common::tomb::Tomb;
use dhctl_common::{Error, Result};
use dhctl_infra::{InfraActionHook, PlanChanges};

use crate::client::ClusterClient;
use crate::readiness::{wait_for_nodes_list_ready, ControlPlaneChecker, ReadinessSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Update,
    Destroy,
}

/// Guards the control plane while one master is changed.
///
/// Before a destructive change the remaining masters must run a ready
/// control plane; a single master cannot be replaced in place at all.
pub struct ControlPlaneHook {
    client: Arc<dyn ClusterClient>,
    node: String,
    other_masters: Vec<String>,
    readiness: ReadinessSettings,
    tomb: Arc<Tomb>,
    action: Action,
    check_others: AtomicBool,
}

impl ControlPlaneHook {
    fn new(
        action: Action,
        client: Arc<dyn ClusterClient>,
        node: &str,
        other_masters: Vec<String>,
        readiness: ReadinessSettings,
        tomb: Arc<Tomb>,
    ) -> Self {
        Self {
            client,
            node: node.to_string(),
            other_masters,
            readiness,
            tomb,
            action,
            check_others: AtomicBool::new(false),
        }
    }

    /// Hook for an apply of `node`
    pub fn for_update(
        client: Arc<dyn ClusterClient>,
        node: &str,
        other_masters: Vec<String>,
        readiness: ReadinessSettings,
        tomb: Arc<Tomb>,
    ) -> Self {
        Self::new(Action::Update, client, node, other_masters, readiness, tomb)
    }

    /// Hook for the removal of `node`; `remaining` are the masters that stay
    pub fn for_destroy(
        client: Arc<dyn ClusterClient>,
        node: &str,
        remaining: Vec<String>,
        readiness: ReadinessSettings,
        tomb: Arc<Tomb>,
    ) -> Self {
        Self::new(Action::Destroy, client, node, remaining, readiness, tomb)
    }
}

#[async_trait]
impl InfraActionHook for ControlPlaneHook {
    async fn before_action(&self, runner: &str, changes: PlanChanges) -> Result<bool> {
        if changes != PlanChanges::DestructiveChanges {
            return Ok(false);
        }
        if self.other_masters.is_empty() {
            return Err(match self.action {
                Action::Update => Error::SingleMasterDestructiveChanges {
                    node: self.node.clone(),
                },
                Action::Destroy => Error::CannotDeleteAllMasters,
            });
        }
        debug!(
            runner,
            node = %self.node,
            "Destructive change of a master, checking the rest of the control plane"
        );
        self.check_others.store(true, Ordering::SeqCst);
        Ok(false)
    }

    async fn is_ready(&self) -> Result<()> {
        if !self.check_others.load(Ordering::SeqCst) {
            return Ok(());
        }
        let checker = ControlPlaneChecker::new(self.client.clone());
        wait_for_nodes_list_ready(&checker, &self.other_masters, &self.readiness, &self.tomb)
            .await?;
        info!(node = %self.node, masters = ?self.other_masters, "Control plane is ready");
        Ok(())
    }

    async fn after_action(&self, _runner: &str) -> Result<()> {
        Ok(())
    }
}
