//! Converge engine
//!
//! One converge runs inside the converge lease and walks three phases:
//! base infrastructure, all nodes, deckhouse configuration. Each phase is
//! reported through the pipeline so a caller can stop between them.

use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use dhctl_common::config::TerraNodeGroupSpec;
use dhctl_common::{Error, Result, MASTER_NODE_GROUP_NAME};
use dhctl_infra::{apply_pipeline, BaseInfraOutputs, BaseInfraRunnerOptions, SaverDestination};
use dhctl_phases::{OperationPhase, Pipeline};

use crate::bootstrap::bootstrap_additional_node_groups;
use crate::check::check_state;
use crate::context::ConvergeContext;
use crate::controller::converge_node_group;
use crate::deckhouse::update_deckhouse_configuration;
use crate::lock::LockConfig;
use crate::node_user::delete_node_user;
use crate::savers::ClusterStateSaver;
use crate::state::{
    cluster_state, converge_state, nodes_state, nodes_state_from_cache, ordered_node_groups,
    save_cluster_state, ConvergePhase, ConvergeState,
};

const NO_NODES_QUESTION: &str =
    "Cluster has no nodes created by infrastructure utility. Do you want to continue and create nodes?";

pub struct ConvergeEngine {
    ctx: Arc<ConvergeContext>,
    lock_config: LockConfig,
}

impl ConvergeEngine {
    pub fn new(ctx: Arc<ConvergeContext>, lock_config: LockConfig) -> Self {
        Self { ctx, lock_config }
    }

    /// Converge the cluster; the lease is released whatever the outcome
    pub async fn run(&self, pipeline: &Pipeline) -> Result<()> {
        self.ctx.take_lock(self.lock_config.clone()).await?;
        let result = self.converge(pipeline).instrument(info_span!("converge")).await;
        let released = self.ctx.release_lock().await;
        result.and(released)
    }

    fn skipped(&self, phase: OperationPhase) -> bool {
        self.ctx.settings().skip_phases.contains(&phase)
    }

    async fn converge(&self, pipeline: &Pipeline) -> Result<()> {
        let ctx = &self.ctx;
        ctx.restore_converge_state(converge_state(ctx.client().as_ref()).await?);
        self.check_destructive_approval().await?;

        let is_static = ctx.meta().is_static();
        let this = self;
        pipeline
            .run(move |_| async move {
                if is_static || this.skipped(OperationPhase::BaseInfrastructure) {
                    pipeline.skip_phase(OperationPhase::BaseInfrastructure)?;
                } else {
                    pipeline
                        .run_phase(OperationPhase::BaseInfrastructure, false, move || async move {
                            this.converge_base_infrastructure().await.map(|_| None)
                        })
                        .await?;
                }

                if is_static || this.skipped(OperationPhase::AllNodes) {
                    pipeline.skip_phase(OperationPhase::AllNodes)?;
                } else {
                    pipeline
                        .run_phase(OperationPhase::AllNodes, false, move || async move {
                            this.converge_all_nodes().await.map(|_| None)
                        })
                        .await?;
                }

                if this.skipped(OperationPhase::DeckhouseConfiguration) {
                    pipeline.skip_phase(OperationPhase::DeckhouseConfiguration)?;
                } else {
                    let phase = OperationPhase::DeckhouseConfiguration;
                    pipeline
                        .run_phase(phase, false, move || async move {
                            let ctx = &this.ctx;
                            update_deckhouse_configuration(ctx.client().as_ref(), ctx.meta())
                                .await
                                .map(|_| None)
                        })
                        .await?;
                }
                Ok(())
            })
            .await?;
        info!("Converge finished");
        Ok(())
    }

    /// Run unattended only when the reviewed destructive change id matches
    async fn check_destructive_approval(&self) -> Result<()> {
        let ctx = &self.ctx;
        let Some(approved) = ctx.settings().approve_destruction_change_id.as_deref() else {
            return Ok(());
        };
        let statistics = check_state(ctx.client().as_ref(), ctx.meta(), ctx.infra())
            .await
            .into_result()?;
        let change_id = statistics.destructive_change_id;
        if change_id.is_empty() {
            return Ok(());
        }
        if change_id != approved {
            return Err(Error::NeedApproveForDestructiveChange { change_id });
        }
        info!(change_id = %change_id, "Destructive changes are approved");
        ctx.enable_auto_approve();
        Ok(())
    }

    async fn converge_base_infrastructure(&self) -> Result<()> {
        let ctx = &self.ctx;
        let client = ctx.client();
        let state = if ctx.commander_mode() {
            None
        } else {
            let state = cluster_state(client.as_ref())
                .await?
                .ok_or_else(|| Error::NoInfrastructureState {
                    what: "kubernetes cluster".to_string(),
                })?;
            Some(state)
        };

        let saver: Arc<dyn SaverDestination> = Arc::new(ClusterStateSaver::new(client.clone()));
        let runner = ctx.infra().base_infra_runner_for_converge(
            ctx.meta(),
            BaseInfraRunnerOptions {
                state,
                auto_approve: ctx.auto_approve(),
                destinations: vec![saver],
            },
        )?;
        let outputs = apply_pipeline(&runner, "Kubernetes cluster", &BaseInfraOutputs).await?;
        save_cluster_state(client.as_ref(), &outputs).await
    }

    async fn converge_all_nodes(&self) -> Result<()> {
        let ctx = &self.ctx;
        let mut states = if ctx.commander_mode() {
            nodes_state_from_cache(ctx.cache().as_ref(), ctx.meta())?
        } else {
            nodes_state(ctx.client().as_ref()).await?
        };

        let meta = ctx.meta();
        let desired = meta.master_node_group.replicas
            + meta.terra_node_groups.iter().map(|g| g.replicas).sum::<u32>();
        if states.is_empty() && desired > 0 && !ctx.approve_by_default(NO_NODES_QUESTION) {
            info!("Aborted");
            return Ok(());
        }

        let new_groups: Vec<&TerraNodeGroupSpec> = ctx
            .meta()
            .terra_node_groups
            .iter()
            .filter(|group| !states.contains_key(&group.name))
            .collect();
        bootstrap_additional_node_groups(ctx, &new_groups).await?;

        let mut groups: Vec<String> = states.keys().cloned().collect();
        if !states.contains_key(MASTER_NODE_GROUP_NAME) {
            groups.push(MASTER_NODE_GROUP_NAME.to_string());
        }
        for group in ordered_node_groups(ctx.meta(), &groups) {
            ctx.check_interrupted()?;
            let state = states.remove(&group).unwrap_or_default();
            converge_node_group(ctx.clone(), &group, state).await?;
        }

        self.drop_node_user().await
    }

    /// The converger user is only needed while masters are converged
    async fn drop_node_user(&self) -> Result<()> {
        let ctx = &self.ctx;
        let state = ctx.converge_state();
        if state.node_user_credentials.is_none() && state.phase == ConvergePhase::None {
            return Ok(());
        }
        delete_node_user(ctx.client().as_ref()).await?;
        ctx.save_converge_state(ConvergeState::default()).await?;
        info!("Converger node user removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckStatus;
    use crate::lock::LOCK_LEASE_NAME;
    use crate::node_user::CONVERGE_NODE_USER;
    use crate::testing::{destructive_plan, harness, harness_with, meta_config, zones_plan};
    use dhctl_common::confirm::{AutoAnswer, MockConfirm};
    use dhctl_common::D8_SYSTEM_NAMESPACE;
    use serde_json::json;

    #[tokio::test]
    async fn story_converged_cluster_is_left_untouched() {
        let meta = meta_config(1, &[("worker", 2)]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&meta);
        h.seed_credentials().await;

        ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .run(&Pipeline::dummy("converge", h.ctx.cache().clone()))
            .await
            .unwrap();

        assert!(h.infra.calls_of("apply").is_empty());
        assert!(h.infra.calls_of("destroy").is_empty());
        assert!(h.cluster.lease(D8_SYSTEM_NAMESPACE, LOCK_LEASE_NAME).is_none());
        assert!(h.cluster.node_user(CONVERGE_NODE_USER).is_none());
        let state = converge_state(h.cluster.as_ref()).await.unwrap();
        assert!(state.node_user_credentials.is_none());

        let report = check_state(h.cluster.as_ref(), &meta, h.ctx.infra()).await;
        let statistics = report.into_result().unwrap();
        assert_eq!(statistics.cluster.status, CheckStatus::Ok);
        assert!(statistics.nodes.iter().all(|n| n.status == CheckStatus::Ok));
    }

    #[tokio::test]
    async fn test_unreviewed_destructive_change_is_refused() {
        let meta = meta_config(1, &[("worker", 1)]);
        let h = harness_with(meta.clone(), Arc::new(AutoAnswer::yes()), |s| {
            s.auto_approve = false;
            s.approve_destruction_change_id = Some("reviewed-something-else".to_string());
        });
        h.cluster.seed_converged(&meta);
        h.infra.plan_for("test-worker-0", destructive_plan("test-worker-0"));

        let err = ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .run(&Pipeline::dummy("converge", h.ctx.cache().clone()))
            .await
            .unwrap_err();

        match err {
            Error::NeedApproveForDestructiveChange { change_id } => assert_eq!(change_id.len(), 64),
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.infra.calls_of("apply").is_empty());
        assert!(h.cluster.lease(D8_SYSTEM_NAMESPACE, LOCK_LEASE_NAME).is_none());
    }

    #[tokio::test]
    async fn story_reviewed_destructive_change_runs_unattended() {
        let meta = meta_config(1, &[("worker", 1)]);
        let probe = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        probe.cluster.seed_converged(&meta);
        probe.infra.plan_for("test-worker-0", destructive_plan("test-worker-0"));
        let reviewed = check_state(probe.cluster.as_ref(), &meta, probe.ctx.infra())
            .await
            .into_result()
            .unwrap()
            .destructive_change_id;
        assert!(!reviewed.is_empty());

        // any question to the operator fails the test
        let h = harness_with(meta.clone(), Arc::new(MockConfirm::new()), |s| {
            s.auto_approve = false;
            s.approve_destruction_change_id = Some(reviewed.clone());
        });
        h.cluster.seed_converged(&meta);
        h.seed_credentials().await;
        h.infra.plan_for("test-worker-0", destructive_plan("test-worker-0"));

        ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .run(&Pipeline::dummy("converge", h.ctx.cache().clone()))
            .await
            .unwrap();

        assert_eq!(h.infra.calls_of("apply"), vec!["test-worker-0"]);
    }

    #[tokio::test]
    async fn story_new_group_is_bootstrapped_and_base_infrastructure_updated() {
        let current = meta_config(1, &[]);
        let meta = meta_config(1, &[("system", 1)]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&current);
        h.cluster.put_cloud_config("system", b"#cloud-config");
        h.seed_credentials().await;
        h.infra.discovered_zones(json!(["a", "b"]));
        h.infra.plan_for("base-infrastructure", zones_plan(json!(["a", "b"])));

        ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .run(&Pipeline::dummy("converge", h.ctx.cache().clone()))
            .await
            .unwrap();

        assert_eq!(h.infra.calls_of("apply"), vec!["base-infrastructure", "test-system-0"]);
        assert!(h.cluster.node_group("system").is_some());
        let state = cluster_state(h.cluster.as_ref()).await.unwrap().unwrap();
        let state: serde_json::Value = serde_json::from_slice(&state).unwrap();
        assert_eq!(state["outputs"]["cloud_discovery_data"]["value"]["zones"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_declined_nodes_creation_leaves_empty_cluster() {
        let meta = meta_config(1, &[("worker", 2)]);
        let mut confirm = MockConfirm::new();
        confirm
            .expect_ask()
            .withf(|message, yes| message == NO_NODES_QUESTION && *yes)
            .times(1)
            .return_const(false);
        let h = harness_with(meta, Arc::new(confirm), |s| {
            s.auto_approve = false;
            s.skip_phases = [
                OperationPhase::BaseInfrastructure,
                OperationPhase::DeckhouseConfiguration,
            ]
                .into_iter()
                .collect();
        });

        ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .run(&Pipeline::dummy("converge", h.ctx.cache().clone()))
            .await
            .unwrap();

        assert!(h.infra.calls().is_empty());
        assert!(h.cluster.node_group("worker").is_none());
        assert!(h.cluster.lease(D8_SYSTEM_NAMESPACE, LOCK_LEASE_NAME).is_none());
    }

    #[rstest::rstest]
    #[case::auto_approved(true, AutoAnswer::no(), true)]
    #[case::confirmed(false, AutoAnswer::yes(), true)]
    #[case::declined(false, AutoAnswer::no(), false)]
    #[tokio::test]
    async fn test_nodes_of_empty_cluster_need_approval(
        #[case] auto_approve: bool,
        #[case] answer: AutoAnswer,
        #[case] created: bool,
    ) {
        let meta = meta_config(1, &[("system", 1)]);
        let h = harness_with(meta, Arc::new(answer), |s| s.auto_approve = auto_approve);
        h.cluster.put_cloud_config("system", b"#cloud-config");

        let _ = ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .converge_all_nodes()
            .await;

        let applied = h.infra.calls_of("apply");
        assert_eq!(applied.contains(&"test-system-0".to_string()), created, "{applied:?}");
        assert_eq!(h.cluster.node_group("system").is_some(), created);
    }

    #[tokio::test]
    async fn test_skipped_phases_do_not_run() {
        let meta = meta_config(1, &[("worker", 1)]);
        let h = harness_with(meta.clone(), Arc::new(AutoAnswer::yes()), |s| {
            s.skip_phases = [OperationPhase::BaseInfrastructure, OperationPhase::AllNodes]
                .into_iter()
                .collect();
        });
        h.cluster.seed_converged(&meta);

        ConvergeEngine::new(h.ctx.clone(), LockConfig::default())
            .run(&Pipeline::dummy("converge", h.ctx.cache().clone()))
            .await
            .unwrap();

        assert!(h.infra.calls().is_empty());
        assert!(h
            .cluster
            .secret(
                dhctl_common::KUBE_SYSTEM_NAMESPACE,
                dhctl_common::secrets::CLUSTER_CONFIGURATION,
            )
            .is_some());
    }
}
