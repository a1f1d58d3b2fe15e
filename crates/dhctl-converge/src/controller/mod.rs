//! Node-group controllers
//!
//! Every node group is reconciled by the same flow: add missing nodes,
//! update the existing ones, delete the surplus, then bring the NodeGroup
//! resource in line. The [`NodeGroupOps`] variants (masters and cloud
//! permanent groups) supply the per-node steps.

mod master;
mod permanent;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};

use dhctl_common::config::{node_index, sort_node_names_desc};
use dhctl_common::retry::{retry_with_backoff_if, RetryConfig};
use dhctl_common::{Error, Result, MASTER_NODE_GROUP_NAME};
use dhctl_infra::{destroy_pipeline, InfraActionHook, NodeRunnerOptions, SaverDestination};

use crate::client::node_group_template;
use crate::context::ConvergeContext;
use crate::savers::NodeStateSaver;
use crate::state::{delete_node_state, NodeGroupInfrastructureState};

pub use master::MasterNodeGroupController;
pub use permanent::CloudPermanentNodeGroupController;

/// Common fields of a node-group controller
pub struct NodeGroupBase {
    pub ctx: Arc<ConvergeContext>,
    pub name: String,
    pub desired_replicas: u32,
    pub state: NodeGroupInfrastructureState,
    pub cloud_config: String,
}

impl NodeGroupBase {
    pub fn new(ctx: Arc<ConvergeContext>, name: &str, state: NodeGroupInfrastructureState) -> Self {
        let desired_replicas = ctx.meta().replicas_for(name);
        Self {
            ctx,
            name: name.to_string(),
            desired_replicas,
            state,
            cloud_config: String::new(),
        }
    }

    /// Whether the group is still part of the desired config
    pub fn is_desired(&self) -> bool {
        self.name == MASTER_NODE_GROUP_NAME
            || self.ctx.meta().terra_node_group(&self.name).is_some()
    }

    /// Node names of the state, highest index first
    pub fn node_names_desc(&self) -> Vec<String> {
        sort_node_names_desc(&self.state.state.keys().collect::<Vec<_>>())
    }

    /// Surplus nodes to delete, highest index first
    pub fn nodes_to_delete(&self) -> Vec<String> {
        let surplus = self.state.state.len().saturating_sub(self.desired_replicas as usize);
        self.node_names_desc().into_iter().take(surplus).collect()
    }

    /// Unused slots to fill, lowest index first
    pub fn missing_indices(&self) -> Vec<u32> {
        let missing = (self.desired_replicas as usize).saturating_sub(self.state.state.len());
        (0..)
            .filter(|i| !self.state.state.contains_key(&self.ctx.meta().node_name(&self.name, *i)))
            .take(missing)
            .collect()
    }

    /// Options of a runner for one node slot of the group
    pub fn runner_options(&self, node: &str, index: u32) -> NodeRunnerOptions {
        NodeRunnerOptions {
            node_group: self.name.clone(),
            node_index: index,
            node_name: node.to_string(),
            cloud_config: self.cloud_config.clone(),
            state: self.ctx.runner_state(self.state.state.get(node)),
            auto_approve: self.ctx.auto_approve(),
            ..Default::default()
        }
    }

    fn state_saver(&self, node: &str) -> Arc<dyn SaverDestination> {
        Arc::new(NodeStateSaver::new(
            self.ctx.client(),
            node,
            &self.name,
            self.state.settings.clone(),
        ))
    }
}

/// Per-node steps of a node-group variant
#[async_trait]
pub trait NodeGroupOps: Send + Sync {
    fn base(&self) -> &NodeGroupBase;

    fn base_mut(&mut self) -> &mut NodeGroupBase;

    /// Create the nodes of [`NodeGroupBase::missing_indices`]
    async fn add_nodes(&mut self) -> Result<()>;

    async fn update_node(&mut self, name: &str) -> Result<()>;

    /// Delete `names`, given highest index first
    async fn delete_nodes(&mut self, names: &[String]) -> Result<()>;
}

/// Errors that end the group run instead of being collected
fn stops_run(e: &Error) -> bool {
    e.is_interrupted() || matches!(e, Error::SingleMasterDestructiveChanges { .. })
}

/// Reconcile one node group
pub async fn run_node_group(ops: &mut dyn NodeGroupOps) -> Result<()> {
    let name = ops.base().name.clone();
    async {
        let ctx = ops.base().ctx.clone();
        if ops.base().is_desired() {
            let cloud_config = crate::state::cloud_config(ctx.client().as_ref(), &name).await?;
            ops.base_mut().cloud_config = cloud_config;
        }

        let base = ops.base();
        if base.desired_replicas as usize > base.state.state.len() {
            info!(
                desired = base.desired_replicas,
                current = base.state.state.len(),
                "Adding nodes"
            );
            ops.add_nodes().instrument(info_span!("add_nodes")).await?;
        }

        let to_delete = ops.base().nodes_to_delete();
        let mut errors = Vec::new();

        for node in ops.base().node_names_desc() {
            if to_delete.contains(&node) {
                continue;
            }
            if ctx.settings().excluded_nodes.contains(&node) {
                info!(node = %node, "Node is excluded, skipping update");
                continue;
            }
            ctx.check_interrupted()?;
            match ops.update_node(&node).instrument(info_span!("update_node", node = %node)).await {
                Ok(()) => {}
                Err(e) if stops_run(&e) => return Err(e),
                Err(e) => {
                    warn!(node = %node, error = %e, "Node update failed, continuing with the rest");
                    errors.push(e);
                }
            }
        }

        if !to_delete.is_empty() {
            if ctx.settings().auto_dismiss_destructive {
                info!(nodes = ?to_delete, "Deleting nodes is dismissed");
            } else if let Err(e) = ops.delete_nodes(&to_delete).await {
                if e.is_interrupted() {
                    return Err(e);
                }
                errors.push(e);
            }
        }

        if ops.base().is_desired() {
            if name != MASTER_NODE_GROUP_NAME {
                if let Err(e) = update_node_template(ops.base()).await {
                    errors.push(e);
                }
            }
        } else if errors.is_empty() {
            delete_node_group(ops.base()).await?;
        }

        Error::from_many(errors)
    }
    .instrument(info_span!("node_group", group = %name))
    .await
}

/// Converge one node group with the variant matching its name
pub async fn converge_node_group(
    ctx: Arc<ConvergeContext>,
    name: &str,
    state: NodeGroupInfrastructureState,
) -> Result<()> {
    if name == MASTER_NODE_GROUP_NAME {
        MasterNodeGroupController::new(ctx, state).run().await
    } else {
        let mut controller = CloudPermanentNodeGroupController::new(ctx, name, state);
        run_node_group(&mut controller).await
    }
}

/// Destroy `names` with the settings the group had when they were created.
///
/// Node objects, cached states and state Secrets go with them. Failures
/// are collected per node; an interruption ends the loop.
pub async fn delete_redundant_nodes(
    base: &mut NodeGroupBase,
    names: &[String],
    hook_for: &(dyn Fn(&NodeGroupBase, &str) -> Option<Arc<dyn InfraActionHook>> + Send + Sync),
) -> Result<()> {
    let ctx = base.ctx.clone();
    let mut errors = Vec::new();
    for name in names {
        if ctx.tomb().is_interrupted() {
            errors.push(Error::ConvergeInterrupted);
            break;
        }
        let index = match node_index(name) {
            Ok(index) => index,
            Err(e) => {
                warn!(node = %name, error = %e, "Skipping node");
                continue;
            }
        };

        let mut opts = base.runner_options(name, index);
        opts.node_group_settings = base.state.settings.clone();
        opts.destinations = vec![base.state_saver(name)];
        opts.hook = hook_for(base, name);

        let deleted = async {
            let runner = ctx.infra().node_runner_for_delete(ctx.meta(), opts)?;
            destroy_pipeline(&runner, name).await?;

            let client = ctx.client();
            retry_with_backoff_if(
                &RetryConfig::linear(10, Duration::from_secs(5)).silent(),
                &format!("delete node {name}"),
                || client.delete_node(name),
                Error::is_retryable,
            )
            .await?;
            ctx.cache().delete(&runner.state_key())?;
            delete_node_state(client.as_ref(), name).await
        }
        .instrument(info_span!("delete_node", node = %name))
        .await;

        match deleted {
            Ok(()) => {
                info!(node = %name, "Node deleted");
                base.state.state.remove(name);
            }
            Err(e) => {
                warn!(node = %name, error = %e, "Failed to delete node");
                errors.push(e);
            }
        }
    }
    Error::from_many(errors)
}

async fn update_template_once(base: &NodeGroupBase, desired: &Value) -> Result<()> {
    let client = base.ctx.client();
    let Some(mut node_group) = client.get_node_group(&base.name).await? else {
        if let Some(spec) = base.ctx.meta().terra_node_group(&base.name) {
            info!(node_group = %base.name, "NodeGroup is absent, creating");
            client.create_node_group(&base.ctx.meta().node_group_manifest(spec)).await?;
        }
        return Ok(());
    };

    let current = node_group_template(&node_group).cloned().unwrap_or_else(|| json!({}));
    if &current == desired {
        return Ok(());
    }
    info!(node_group = %base.name, current = %current, desired = %desired, "Node template changed");
    if !base
        .ctx
        .approve(&format!("Update node template of node group {}?", base.name))
    {
        info!(node_group = %base.name, "Node template update skipped");
        return Ok(());
    }

    match node_group.data.get_mut("spec").and_then(Value::as_object_mut) {
        Some(spec) => {
            spec.insert("nodeTemplate".to_string(), desired.clone());
        }
        None => {
            node_group.data["spec"] = json!({"nodeTemplate": desired});
        }
    }
    client.update_node_group(&node_group).await?;
    info!(node_group = %base.name, "Node template updated");
    Ok(())
}

/// Bring `spec.nodeTemplate` of the NodeGroup in line with the config
pub async fn update_node_template(base: &NodeGroupBase) -> Result<()> {
    let desired = base
        .ctx
        .meta()
        .terra_node_group(&base.name)
        .and_then(|g| g.node_template.clone())
        .unwrap_or_else(|| json!({}));
    retry_with_backoff_if(
        &RetryConfig::linear(5, Duration::from_secs(1)),
        &format!("update node template of {}", base.name),
        || update_template_once(base, &desired),
        |e| matches!(e, Error::NodeGroupChanged { .. }) || e.is_retryable(),
    )
    .await
}

/// Remove the NodeGroup of a group dropped from the config
async fn delete_node_group(base: &NodeGroupBase) -> Result<()> {
    if base.name == MASTER_NODE_GROUP_NAME {
        return Ok(());
    }
    if base.ctx.settings().auto_dismiss_destructive {
        info!(node_group = %base.name, "Deleting node group is dismissed");
        return Ok(());
    }
    if !base
        .ctx
        .approve(&format!("Delete node group {} from the cluster?", base.name))
    {
        info!(node_group = %base.name, "Node group deletion skipped");
        return Ok(());
    }
    base.ctx.client().delete_node_group(&base.name).await?;
    info!(node_group = %base.name, "Node group deleted");
    Ok(())
}
