//! Commander attach and detach
//!
//! Attaching hands a running cluster over to commander: its infrastructure
//! state is copied into the local cache, which is authoritative from then
//! on. Detaching removes what converge left in the cluster and gives the
//! cluster back.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, info_span, Instrument};

use dhctl_common::Result;
use dhctl_phases::{OperationPhase, Pipeline};

use crate::check::{check_state, Statistics};
use crate::context::ConvergeContext;
use crate::lock::LockConfig;
use crate::node_user::delete_node_user;
use crate::state::{
    cluster_state, delete_converge_state, nodes_state, BASE_INFRASTRUCTURE_CACHE_KEY,
};

/// What commander takes over with the cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommanderAttachResult {
    pub statistics: Statistics,
    /// Cache keys and the infrastructure states stored under them
    pub state: BTreeMap<String, Vec<u8>>,
}

async fn check(ctx: &ConvergeContext) -> Result<Statistics> {
    check_state(ctx.client().as_ref(), ctx.meta(), ctx.infra())
        .await
        .into_result()
}

/// Copy the cluster and node states into the cache, keyed the way runners read them
async fn copy_states_to_cache(ctx: &ConvergeContext) -> Result<BTreeMap<String, Vec<u8>>> {
    let client = ctx.client();
    let cache = ctx.cache();
    let mut copied = BTreeMap::new();

    if let Some(state) = cluster_state(client.as_ref()).await? {
        cache.save(BASE_INFRASTRUCTURE_CACHE_KEY, &state)?;
        copied.insert(BASE_INFRASTRUCTURE_CACHE_KEY.to_string(), state);
    }
    for (group, nodes) in nodes_state(client.as_ref()).await? {
        for (node, state) in nodes.state {
            let key = format!("{node}.tfstate");
            cache.save(&key, &state)?;
            info!(node_group = %group, node = %node, "Node state copied");
            copied.insert(key, state);
        }
    }
    Ok(copied)
}

async fn attach_with_lock(
    ctx: &ConvergeContext,
    pipeline: &Pipeline,
) -> Result<CommanderAttachResult> {
    let result = Mutex::new(CommanderAttachResult::default());
    let out = &result;
    pipeline
        .run(move |_| async move {
            pipeline
                .run_phase(OperationPhase::CommanderAttachCheck, false, move || async move {
                    let statistics = check(ctx).await?;
                    let data = serde_json::to_value(&statistics)?;
                    out.lock().statistics = statistics;
                    Ok(Some(data))
                })
                .await?;
            pipeline
                .run_phase(OperationPhase::CommanderAttachCapi, false, move || async move {
                    let state = copy_states_to_cache(ctx).await?;
                    out.lock().state = state;
                    Ok(None)
                })
                .await
        })
        .await?;
    Ok(result.into_inner())
}

/// Take the cluster over into the local cache
pub async fn commander_attach(
    ctx: &Arc<ConvergeContext>,
    pipeline: &Pipeline,
    lock_config: LockConfig,
) -> Result<CommanderAttachResult> {
    ctx.take_lock(lock_config).await?;
    let result = attach_with_lock(ctx, pipeline)
        .instrument(info_span!("commander_attach"))
        .await;
    let released = ctx.release_lock().await;
    let result = result?;
    released?;
    info!(states = result.state.len(), "Cluster attached to commander");
    Ok(result)
}

/// Give the cluster back: drop the converge state, the converger user and the lease
pub async fn commander_detach(
    ctx: &Arc<ConvergeContext>,
    pipeline: &Pipeline,
    lock_config: LockConfig,
) -> Result<()> {
    ctx.take_lock(lock_config).await?;
    let ctx_ref: &ConvergeContext = ctx;
    let result = pipeline
        .run(move |_| async move {
            pipeline
                .run_phase(OperationPhase::CommanderDetachCheck, false, move || async move {
                    let statistics = check(ctx_ref).await?;
                    Ok(Some(serde_json::to_value(&statistics)?))
                })
                .await?;
            let client = ctx_ref.client();
            delete_converge_state(client.as_ref()).await?;
            delete_node_user(client.as_ref()).await
        })
        .instrument(info_span!("commander_detach"))
        .await;
    let released = ctx.release_lock().await;
    result.and(released)?;
    info!("Cluster detached from commander");
    Ok(())
}
