//! Cluster destruction and bootstrap abort

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use dhctl_common::config::{node_index, sort_node_names_desc, MetaConfig};
use dhctl_common::{Result, MASTER_NODE_GROUP_NAME};
use dhctl_infra::{destroy_pipeline, InfrastructureContext, NodeRunnerOptions};
use dhctl_phases::{OperationPhase, Pipeline};

use crate::context::ConvergeContext;
use crate::lock::LockConfig;
use crate::state::{
    cluster_state, delete_node_state, nodes_state, nodes_state_from_cache, ordered_node_groups,
    NodeGroupInfrastructureState, BASE_INFRASTRUCTURE_CACHE_KEY,
};

async fn destroy_node(
    infra: &InfrastructureContext,
    meta: &MetaConfig,
    group: &str,
    name: &str,
    opts: NodeRunnerOptions,
) -> Result<String> {
    let runner = infra.node_runner_for_destroy(meta, opts)?;
    destroy_pipeline(&runner, name)
        .instrument(info_span!("destroy_node", node_group = %group, node = %name))
        .await?;
    Ok(runner.state_key())
}

/// Destroy every resource of a cloud cluster.
///
/// Non-master NodeGroups go first so the cluster stops managing nodes, then
/// worker nodes, masters and the base infrastructure.
pub async fn destroy_cluster(
    ctx: &Arc<ConvergeContext>,
    pipeline: &Pipeline,
    lock_config: LockConfig,
) -> Result<()> {
    ctx.take_lock(lock_config).await?;
    let result = destroy_with_lock(ctx, pipeline).instrument(info_span!("destroy")).await;
    if result.is_err() {
        // the cluster may be gone already, nothing to release then
        if let Err(e) = ctx.release_lock().await {
            warn!(error = %e, "Failed to release converge lock");
        }
    }
    result
}

async fn delete_node_groups(ctx: &ConvergeContext) -> Result<()> {
    let client = ctx.client();
    for node_group in client.list_node_groups().await? {
        let Some(name) = node_group.metadata.name else {
            continue;
        };
        if name == MASTER_NODE_GROUP_NAME {
            continue;
        }
        client.delete_node_group(&name).await?;
        info!(node_group = %name, "Node group deleted");
    }
    Ok(())
}

async fn destroy_nodes(
    ctx: &ConvergeContext,
    mut nodes: BTreeMap<String, NodeGroupInfrastructureState>,
) -> Result<()> {
    let meta = ctx.meta();
    let keys: Vec<String> = nodes.keys().cloned().collect();
    let mut order: Vec<String> = ordered_node_groups(meta, &keys)
        .into_iter()
        .filter(|g| g != MASTER_NODE_GROUP_NAME)
        .collect();
    if nodes.contains_key(MASTER_NODE_GROUP_NAME) {
        order.push(MASTER_NODE_GROUP_NAME.to_string());
    }

    for group in order {
        let NodeGroupInfrastructureState { state, settings } = nodes
            .remove(&group)
            .unwrap_or_default();
        for name in sort_node_names_desc(&state.keys().collect::<Vec<_>>()) {
            ctx.check_interrupted()?;
            let opts = NodeRunnerOptions {
                node_group: group.clone(),
                node_index: node_index(&name)?,
                node_name: name.clone(),
                state: ctx.runner_state(state.get(&name)),
                node_group_settings: settings.clone(),
                auto_approve: ctx.auto_approve(),
                ..Default::default()
            };
            let key = destroy_node(ctx.infra(), meta, &group, &name, opts).await?;
            ctx.cache().delete(&key)?;
            // master Secrets go away with the control plane
            if group != MASTER_NODE_GROUP_NAME {
                delete_node_state(ctx.client().as_ref(), &name).await?;
            }
            info!(node = %name, "Node destroyed");
        }
    }
    Ok(())
}

async fn destroy_base_infrastructure(ctx: &ConvergeContext, state: Option<Vec<u8>>) -> Result<()> {
    let state = ctx.runner_state(state.as_ref());
    let runner = ctx
        .infra()
        .base_infra_runner_for_destroy(ctx.meta(), state, ctx.auto_approve())?;
    destroy_pipeline(&runner, "Kubernetes cluster").await?;
    ctx.cache().delete(BASE_INFRASTRUCTURE_CACHE_KEY)
}

async fn destroy_with_lock(ctx: &Arc<ConvergeContext>, pipeline: &Pipeline) -> Result<()> {
    let client = ctx.client();
    let (cluster, nodes) = if ctx.commander_mode() {
        (None, nodes_state_from_cache(ctx.cache().as_ref(), ctx.meta())?)
    } else {
        (cluster_state(client.as_ref()).await?, nodes_state(client.as_ref()).await?)
    };
    let ctx: &ConvergeContext = ctx;
    let is_static = ctx.meta().is_static();

    pipeline
        .run(move |_| async move {
            pipeline
                .run_phase(OperationPhase::DeleteResources, false, move || async move {
                    delete_node_groups(ctx).await.map(|_| None)
                })
                .await?;

            // masters are destroyed next, renewal would fail with them
            if let Some(lock) = ctx.lock() {
                lock.stop_auto_renew();
            }

            if is_static {
                pipeline.skip_phase(OperationPhase::AllNodes)?;
                pipeline.skip_phase(OperationPhase::BaseInfrastructure)?;
                return Ok(());
            }

            pipeline
                .run_phase(OperationPhase::AllNodes, false, move || async move {
                    destroy_nodes(ctx, nodes).await.map(|_| None)
                })
                .await?;
            pipeline
                .run_phase(OperationPhase::BaseInfrastructure, false, move || async move {
                    destroy_base_infrastructure(ctx, cluster).await.map(|_| None)
                })
                .await
        })
        .await?;

    ctx.cache().clean()?;
    info!("Cluster destroyed");
    Ok(())
}

/// Destroy what a failed bootstrap left in the local cache
pub async fn abort_bootstrap(
    meta: &MetaConfig,
    infra: &InfrastructureContext,
    pipeline: &Pipeline,
) -> Result<()> {
    let cache = infra.cache();
    pipeline
        .run(move |_| async move {
            pipeline
                .run_phase(OperationPhase::BaseInfrastructure, false, move || async move {
                    for index in (0..meta.master_node_group.replicas).rev() {
                        let name = meta.node_name(MASTER_NODE_GROUP_NAME, index);
                        if !cache.in_cache(&format!("{name}.tfstate"))? {
                            continue;
                        }
                        let opts = NodeRunnerOptions {
                            node_group: MASTER_NODE_GROUP_NAME.to_string(),
                            node_index: index,
                            node_name: name.clone(),
                            auto_approve: true,
                            ..Default::default()
                        };
                        let key = destroy_node(infra, meta, MASTER_NODE_GROUP_NAME, &name, opts)
                            .await?;
                        cache.delete(&key)?;
                    }

                    if cache.in_cache(BASE_INFRASTRUCTURE_CACHE_KEY)? {
                        let runner = infra.base_infra_runner_for_destroy(meta, None, true)?;
                        destroy_pipeline(&runner, "Kubernetes cluster").await?;
                        cache.delete(BASE_INFRASTRUCTURE_CACHE_KEY)?;
                    }
                    Ok(None)
                })
                .await
        })
        .await?;

    cache.clean()?;
    info!("Bootstrap aborted, infrastructure destroyed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap_cluster;
    use crate::lock::LOCK_LEASE_NAME;
    use crate::testing::{harness, infra_context, meta_config, FakeInfra};
    use dhctl_common::confirm::AutoAnswer;
    use dhctl_common::tomb::Tomb;
    use dhctl_common::D8_SYSTEM_NAMESPACE;

    #[tokio::test]
    async fn story_cluster_is_destroyed_workers_first() {
        let meta = meta_config(2, &[("worker", 2)]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&meta);

        destroy_cluster(
            &h.ctx,
            &Pipeline::dummy("destroy", h.ctx.cache().clone()),
            LockConfig::default(),
        )
            .await
            .unwrap();

        assert_eq!(
            h.infra.calls_of("destroy"),
            vec![
                "test-worker-1",
                "test-worker-0",
                "test-master-1",
                "test-master-0",
                "base-infrastructure"
            ]
        );
        assert!(h.cluster.node_group("worker").is_none());
        assert!(h.cluster.node_state_secrets().iter().all(|s| !s.contains("worker")));
        // the lease goes away with the cluster
        assert!(h.cluster.lease(D8_SYSTEM_NAMESPACE, LOCK_LEASE_NAME).is_some());
        assert!(h.ctx.cache().snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_destroy_releases_the_lock() {
        let meta = meta_config(1, &[("worker", 1)]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&meta);
        h.infra.fail("destroy:test-worker-0");

        let err = destroy_cluster(
            &h.ctx,
            &Pipeline::dummy("destroy", h.ctx.cache().clone()),
            LockConfig::default(),
        )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("test-worker-0"));
        assert_eq!(h.infra.calls_of("destroy"), vec!["test-worker-0"]);
        assert!(h.cluster.lease(D8_SYSTEM_NAMESPACE, LOCK_LEASE_NAME).is_none());
    }

    #[tokio::test]
    async fn story_aborted_bootstrap_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeInfra::new();
        let (infra, cache) = infra_context(
            dir.path(),
            fake.clone(),
            Arc::new(AutoAnswer::yes()),
            Tomb::new(),
        );
        let meta = meta_config(3, &[]);
        bootstrap_cluster(&meta, &infra).await.unwrap();

        abort_bootstrap(&meta, &infra, &Pipeline::dummy("abort", cache.clone()))
            .await
            .unwrap();

        assert_eq!(fake.calls_of("destroy"), vec!["test-master-0", "base-infrastructure"]);
        assert!(!cache.in_cache(BASE_INFRASTRUCTURE_CACHE_KEY).unwrap());
        assert!(!cache.in_cache("test-master-0.tfstate").unwrap());
    }
}
