use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use dhctl_common::config::node_index;
use dhctl_common::Result;
use dhctl_infra::{apply_pipeline, OnlyState, SaverDestination};

use crate::context::ConvergeContext;
use crate::readiness::{wait_for_nodes_list_ready, wait_for_single_node_ready, NodeReadyChecker};
use crate::savers::NodeStateSaver;
use crate::state::{save_node_state, NodeGroupInfrastructureState};

use super::{delete_redundant_nodes, NodeGroupBase, NodeGroupOps};

/// Cloud permanent worker group
pub struct CloudPermanentNodeGroupController {
    base: NodeGroupBase,
    /// Settings of the group in the desired config, recorded with every node
    settings: Option<Vec<u8>>,
}

impl CloudPermanentNodeGroupController {
    pub fn new(ctx: Arc<ConvergeContext>, name: &str, state: NodeGroupInfrastructureState) -> Self {
        let settings = ctx
            .meta()
            .find_terra_node_group(name)
            .and_then(|settings| serde_json::to_vec(&settings).ok())
            .or_else(|| state.settings.clone());
        Self {
            base: NodeGroupBase::new(ctx, name, state),
            settings,
        }
    }

    fn saver(&self, node: &str) -> Arc<dyn SaverDestination> {
        Arc::new(NodeStateSaver::new(
            self.base.ctx.client(),
            node,
            &self.base.name,
            self.settings.clone(),
        ))
    }

    async fn apply_node(&mut self, node: &str, index: u32, fresh: bool) -> Result<()> {
        let ctx = self.base.ctx.clone();
        let mut opts = self.base.runner_options(node, index);
        if fresh {
            opts.state = None;
        }
        opts.destinations = vec![self.saver(node)];

        let runner = ctx.infra().node_runner_for_converge(ctx.meta(), opts)?;
        let outputs = apply_pipeline(&runner, node, &OnlyState).await?;
        save_node_state(
            ctx.client().as_ref(),
            node,
            &self.base.name,
            &outputs.infrastructure_state,
            self.settings.as_deref(),
        )
        .await?;
        self.base
            .state
            .state
            .insert(node.to_string(), outputs.infrastructure_state);
        Ok(())
    }
}

#[async_trait]
impl NodeGroupOps for CloudPermanentNodeGroupController {
    fn base(&self) -> &NodeGroupBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeGroupBase {
        &mut self.base
    }

    async fn add_nodes(&mut self) -> Result<()> {
        let ctx = self.base.ctx.clone();
        let mut added = Vec::new();
        for index in self.base.missing_indices() {
            ctx.check_interrupted()?;
            let node = ctx.meta().node_name(&self.base.name, index);
            self.apply_node(&node, index, true).await?;
            info!(node = %node, "Node created");
            added.push(node);
        }

        let checker = NodeReadyChecker::new(ctx.client());
        let readiness = &ctx.settings().readiness;
        match wait_for_nodes_list_ready(&checker, &added, readiness, ctx.tomb()).await {
            Err(e) if !e.is_interrupted() => {
                // not fatal: the nodes exist and are recorded, the agent may still configure them
                warn!(nodes = ?added, error = %e, "New nodes are not ready yet, continuing");
                Ok(())
            }
            other => other,
        }
    }

    async fn update_node(&mut self, name: &str) -> Result<()> {
        let index = match node_index(name) {
            Ok(index) => index,
            Err(e) => {
                warn!(node = %name, error = %e, "Skipping node");
                return Ok(());
            }
        };
        self.apply_node(name, index, false).await?;

        let ctx = &self.base.ctx;
        wait_for_single_node_ready(
            &NodeReadyChecker::new(ctx.client()),
            name,
            &ctx.settings().readiness,
            ctx.tomb(),
        )
        .await
    }

    async fn delete_nodes(&mut self, names: &[String]) -> Result<()> {
        delete_redundant_nodes(&mut self.base, names, &|_, _| None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::run_node_group;
    use crate::state::nodes_state;
    use crate::testing::{harness, meta_config, update_plan};
    use dhctl_common::confirm::AutoAnswer;

    fn controller(
        h: &crate::testing::Harness,
        group: &str,
        state: NodeGroupInfrastructureState,
    ) -> CloudPermanentNodeGroupController {
        CloudPermanentNodeGroupController::new(h.ctx.clone(), group, state)
    }

    #[tokio::test]
    async fn story_scale_up_fills_the_lowest_free_slots() {
        let current = meta_config(1, &[("worker", 1)]);
        let h = harness(meta_config(1, &[("worker", 3)]), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&current);
        let state = nodes_state(h.cluster.as_ref()).await.unwrap().remove("worker").unwrap();

        run_node_group(&mut controller(&h, "worker", state)).await.unwrap();

        assert_eq!(h.infra.calls_of("apply"), vec!["test-worker-1", "test-worker-2"]);
        let states = h.cluster.node_state_secrets();
        assert!(states.contains(&"d8-node-terraform-state-test-worker-2".to_string()));
        assert!(h.cluster.has_node("test-worker-2"));
    }

    #[tokio::test]
    async fn story_node_update_failure_does_not_block_the_rest() {
        let meta = meta_config(1, &[("worker", 3)]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&meta);
        h.infra.plan_for("test-worker-0", update_plan());
        h.infra.plan_for("test-worker-2", update_plan());
        h.infra.fail("apply:test-worker-2");
        let state = nodes_state(h.cluster.as_ref()).await.unwrap().remove("worker").unwrap();

        let err = run_node_group(&mut controller(&h, "worker", state)).await.unwrap_err();

        assert!(err.to_string().contains("test-worker-2"));
        // updates go from the highest index down and the failed node does not stop the others
        assert_eq!(h.infra.calls_of("apply"), vec!["test-worker-2", "test-worker-0"]);
    }

    #[tokio::test]
    async fn story_removed_group_is_destroyed_with_its_node_group() {
        let current = meta_config(1, &[("static", 2)]);
        let h = harness(meta_config(1, &[]), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&current);
        let state = nodes_state(h.cluster.as_ref()).await.unwrap().remove("static").unwrap();
        assert!(state.settings.is_some());

        run_node_group(&mut controller(&h, "static", state)).await.unwrap();

        assert_eq!(h.infra.calls_of("destroy"), vec!["test-static-1", "test-static-0"]);
        assert_eq!(h.cluster.deleted_nodes(), vec!["test-static-1", "test-static-0"]);
        assert!(h
            .cluster
            .node_state_secrets()
            .iter()
            .all(|s| !s.contains("test-static")));
        assert!(h.cluster.node_group("static").is_none());
    }

    #[tokio::test]
    async fn test_dismissed_destructive_keeps_surplus_nodes() {
        let current = meta_config(1, &[("worker", 2)]);
        let h = crate::testing::harness_with(
            meta_config(1, &[("worker", 1)]),
            Arc::new(AutoAnswer::yes()),
            |settings| settings.auto_dismiss_destructive = true,
        );
        h.cluster.seed_converged(&current);
        let state = nodes_state(h.cluster.as_ref()).await.unwrap().remove("worker").unwrap();

        run_node_group(&mut controller(&h, "worker", state)).await.unwrap();

        assert!(h.infra.calls_of("destroy").is_empty());
        assert!(h.cluster.has_node("test-worker-1"));
    }

    #[tokio::test]
    async fn test_changed_node_template_is_patched() {
        let meta = meta_config(1, &[("worker", 1)]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&meta);
        let mut stale = meta.node_group_manifest(meta.terra_node_group("worker").unwrap());
        stale["spec"]["nodeTemplate"] = serde_json::json!({"labels": {"group": "old"}});
        h.cluster.put_node_group(stale);
        let state = nodes_state(h.cluster.as_ref()).await.unwrap().remove("worker").unwrap();

        run_node_group(&mut controller(&h, "worker", state)).await.unwrap();

        let node_group = h.cluster.node_group("worker").unwrap();
        assert_eq!(
            node_group.data["spec"]["nodeTemplate"],
            serde_json::json!({"labels": {"group": "worker"}})
        );
    }
}
