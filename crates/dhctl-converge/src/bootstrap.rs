//! Bootstrap of infrastructure that has no state yet
//!
//! Node groups added to the config are bootstrapped by converge before the
//! existing groups are reconciled. A brand new cluster gets its base
//! infrastructure and first master here, recorded in the local cache only.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

use dhctl_common::config::{MetaConfig, TerraNodeGroupSpec};
use dhctl_common::{Error, Result, MASTER_NODE_GROUP_NAME};
use dhctl_infra::{
    apply_pipeline, BaseInfraOutputs, InfrastructureContext, MasterNodeOutputs, NodeRunnerOptions,
    OnlyState, SaverDestination,
};

use crate::context::ConvergeContext;
use crate::readiness::{wait_for_nodes_list_ready, NodeReadyChecker};
use crate::savers::NodeStateSaver;
use crate::state::{cloud_config, save_master_hosts, save_node_state};

/// Providers whose API cannot create instances concurrently
const SERIAL_PROVIDERS: &[&str] = &["vcd"];

fn bootstrap_serially(ctx: &ConvergeContext) -> bool {
    ctx.settings().sequential_bootstrap
        || SERIAL_PROVIDERS
            .iter()
            .any(|p| ctx.meta().provider_name.eq_ignore_ascii_case(p))
}

/// Create the NodeGroup of `group` and all its nodes
pub async fn bootstrap_node_group(
    ctx: &Arc<ConvergeContext>,
    group: &TerraNodeGroupSpec,
) -> Result<()> {
    async {
        let meta = ctx.meta();
        let client = ctx.client();
        client.create_node_group(&meta.node_group_manifest(group)).await?;
        // the cloud config is rendered for the NodeGroup just created
        let cloud_config = cloud_config(client.as_ref(), &group.name).await?;
        let settings = meta
            .find_terra_node_group(&group.name)
            .map(|settings| serde_json::to_vec(&settings))
            .transpose()?;

        let mut created = Vec::new();
        for index in 0..group.replicas {
            ctx.check_interrupted()?;
            let node = meta.node_name(&group.name, index);
            let saver: Arc<dyn SaverDestination> = Arc::new(NodeStateSaver::new(
                client.clone(),
                node.as_str(),
                group.name.as_str(),
                settings.clone(),
            ));
            let opts = NodeRunnerOptions {
                node_group: group.name.clone(),
                node_index: index,
                node_name: node.clone(),
                cloud_config: cloud_config.clone(),
                destinations: vec![saver],
                ..Default::default()
            };
            let runner = ctx.infra().node_runner_for_bootstrap(meta, opts)?;
            let outputs = apply_pipeline(&runner, &node, &OnlyState).await?;
            save_node_state(
                client.as_ref(),
                &node,
                &group.name,
                &outputs.infrastructure_state,
                settings.as_deref(),
            )
            .await?;
            info!(node = %node, "Node bootstrapped");
            created.push(node);
        }

        let checker = NodeReadyChecker::new(client);
        let readiness = &ctx.settings().readiness;
        if let Err(e) = wait_for_nodes_list_ready(&checker, &created, readiness, ctx.tomb()).await {
            if e.is_interrupted() {
                return Err(e);
            }
            warn!(
                node_group = %group.name,
                error = %e,
                "Bootstrapped nodes are not ready yet, continuing"
            );
        }
        Ok(())
    }
    .instrument(info_span!("bootstrap_node_group", node_group = %group.name))
    .await
}

/// Bootstrap groups that have no infrastructure state yet
pub async fn bootstrap_additional_node_groups(
    ctx: &Arc<ConvergeContext>,
    groups: &[&TerraNodeGroupSpec],
) -> Result<()> {
    if groups.is_empty() {
        return Ok(());
    }
    info!(
        groups = ?groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
        "Bootstrapping new node groups"
    );

    if bootstrap_serially(ctx) {
        for group in groups {
            bootstrap_node_group(ctx, group).await?;
        }
        return Ok(());
    }

    let results = futures::future::join_all(
        groups.iter().map(|group| bootstrap_node_group(ctx, group)),
    )
    .await;
    Error::from_many(results.into_iter().filter_map(|r| r.err()).collect())
}

/// Addresses of a cluster whose infrastructure was just created
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResult {
    pub master_address: Option<String>,
    pub master_internal_ip: Option<String>,
    pub bastion_host: Option<String>,
    pub kube_data_device_path: Option<String>,
    pub cloud_discovery: Option<Value>,
}

/// Base infrastructure and the first master of a new cluster.
///
/// States are kept in the local cache under the runner keys; nothing is
/// written to a cluster, there is none yet.
pub async fn bootstrap_cluster(
    meta: &MetaConfig,
    infra: &InfrastructureContext,
) -> Result<BootstrapResult> {
    async {
        let base = infra.base_infra_runner_for_bootstrap(meta)?;
        let base_outputs = apply_pipeline(&base, "Kubernetes cluster", &BaseInfraOutputs).await?;

        let node = meta.node_name(MASTER_NODE_GROUP_NAME, 0);
        let opts = NodeRunnerOptions {
            node_group: MASTER_NODE_GROUP_NAME.to_string(),
            node_index: 0,
            node_name: node.clone(),
            ..Default::default()
        };
        let master = infra.node_runner_for_bootstrap(meta, opts)?;
        let master_outputs = apply_pipeline(&master, &node, &MasterNodeOutputs).await?;

        if let Some(host) = &master_outputs.master_ip_for_ssh {
            save_master_hosts(
                infra.cache().as_ref(),
                &BTreeMap::from([(node.clone(), host.clone())]),
            )?;
        }
        info!(node = %node, host = ?master_outputs.master_ip_for_ssh, "First master created");

        Ok(BootstrapResult {
            master_address: master_outputs.master_ip_for_ssh,
            master_internal_ip: master_outputs.node_internal_ip,
            bastion_host: base_outputs.bastion_host,
            kube_data_device_path: master_outputs.kube_data_device_path,
            cloud_discovery: base_outputs.cloud_discovery,
        })
    }
    .instrument(info_span!("bootstrap_cluster", prefix = %meta.cluster_prefix))
    .await
}
