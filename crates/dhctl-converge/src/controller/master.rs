use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use async_trait::async_trait;
use dhctl_common::config::node_index;
use dhctl_common::{Error, Result, MASTER_NODE_GROUP_NAME};
use dhctl_infra::{apply_pipeline, master_ip_from_state, InfraActionHook, MasterNodeOutputs};

use crate::context::{ConvergeContext, MasterHost, NodeSession};
use crate::hooks::ControlPlaneHook;
use crate::node_user::{create_node_user, generate_credentials, write_private_key};
use crate::readiness::{wait_for_nodes_list_ready, wait_for_single_node_ready, ControlPlaneChecker};
use crate::state::{
    cloud_config_for_hosts, save_master_hosts, save_master_node_state, ConvergePhase,
    NodeGroupInfrastructureState,
};

use super::{delete_redundant_nodes, run_node_group, NodeGroupBase, NodeGroupOps};

/// Masters kept while a single master is replaced
const MIGRATION_REPLICAS: u32 = 3;

/// Control plane node group.
///
/// Works through the converger node user, keeps etcd quorum when masters
/// are removed, and replaces a single master by growing the control plane
/// to three masters and shrinking it back.
pub struct MasterNodeGroupController {
    base: NodeGroupBase,
    hosts: Vec<MasterHost>,
    migrating: bool,
}

impl MasterNodeGroupController {
    pub fn new(ctx: Arc<ConvergeContext>, state: NodeGroupInfrastructureState) -> Self {
        let hosts = state
            .state
            .iter()
            .filter_map(|(name, state)| {
                master_ip_from_state(state).map(|host| MasterHost {
                    name: name.clone(),
                    host,
                })
            })
            .collect();
        Self {
            base: NodeGroupBase::new(ctx, MASTER_NODE_GROUP_NAME, state),
            hosts,
            migrating: false,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.switch_to_node_user().await?;

        match self.base.ctx.converge_state().phase {
            ConvergePhase::ScaleToMultiMaster => {
                info!("Resuming the migration to a multi-master control plane");
                return self.migrate(ConvergePhase::ScaleToMultiMaster).await;
            }
            ConvergePhase::ScaleToSingleMaster => {
                info!("Resuming the migration back to a single master");
                return self.migrate(ConvergePhase::ScaleToSingleMaster).await;
            }
            _ => {}
        }

        let desired = self.base.desired_replicas;
        match self.run_with_replicas(desired).await {
            Err(Error::SingleMasterDestructiveChanges { node }) => {
                warn!(node = %node, "The only master has to be recreated");
                if !self.base.ctx.approve(
                    "The only master must be recreated. Temporarily scale the control plane to three masters and back?",
                ) {
                    return Err(Error::SingleMasterDestructiveChanges { node });
                }
                self.migrate(ConvergePhase::ScaleToMultiMaster).await
            }
            other => other,
        }
    }

    async fn set_phase(&self, phase: ConvergePhase) -> Result<()> {
        let mut state = self.base.ctx.converge_state();
        state.phase = phase;
        self.base.ctx.save_converge_state(state).await
    }

    /// Run the migration from `from` on; every step is recorded first
    async fn migrate(&mut self, from: ConvergePhase) -> Result<()> {
        self.migrating = true;
        if from == ConvergePhase::ScaleToMultiMaster {
            self.set_phase(ConvergePhase::ScaleToMultiMaster).await?;
            self.run_with_replicas(MIGRATION_REPLICAS).await?;
        }
        self.set_phase(ConvergePhase::ScaleToSingleMaster).await?;
        self.run_with_replicas(1).await?;
        self.set_phase(ConvergePhase::None).await?;
        self.migrating = false;
        info!("Control plane is back to a single master");
        Ok(())
    }

    async fn run_with_replicas(&mut self, replicas: u32) -> Result<()> {
        info!(replicas, "Converging masters");
        self.base.desired_replicas = replicas;
        run_node_group(self).await
    }

    /// Reconnect as the converger node user, creating it on first use
    async fn switch_to_node_user(&mut self) -> Result<()> {
        let ctx = self.base.ctx.clone();
        let mut state = ctx.converge_state();
        let credentials = match state.node_user_credentials.clone() {
            Some(credentials) => credentials,
            None => {
                let credentials = generate_credentials()?;
                create_node_user(ctx.client().as_ref(), &credentials).await?;
                state.node_user_credentials = Some(credentials.clone());
                ctx.save_converge_state(state).await?;
                credentials
            }
        };

        let session = NodeSession {
            user: credentials.name.clone(),
            private_key_path: write_private_key(ctx.cache().dir(), &credentials)?,
            hosts: self.hosts.clone(),
        };
        let client = ctx.transport().switch_user(&session).await?;
        ctx.switch_client(client).await?;
        info!(
            user = %session.user,
            hosts = session.hosts.len(),
            "Connected as the converger node user"
        );
        Ok(())
    }

    async fn publish_hosts(&self) -> Result<()> {
        let ctx = &self.base.ctx;
        ctx.transport().set_hosts(&self.hosts).await?;
        let hosts: BTreeMap<String, String> = self
            .hosts
            .iter()
            .map(|h| (h.name.clone(), h.host.clone()))
            .collect();
        save_master_hosts(ctx.cache().as_ref(), &hosts)
    }

    fn other_masters(&self, node: &str) -> Vec<String> {
        self.base
            .state
            .state
            .keys()
            .filter(|name| name.as_str() != node)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NodeGroupOps for MasterNodeGroupController {
    fn base(&self) -> &NodeGroupBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeGroupBase {
        &mut self.base
    }

    async fn add_nodes(&mut self) -> Result<()> {
        let ctx = self.base.ctx.clone();
        let mut added = Vec::new();
        let mut internal_ips = Vec::new();

        for index in self.base.missing_indices() {
            ctx.check_interrupted()?;
            let node = ctx.meta().node_name(MASTER_NODE_GROUP_NAME, index);
            let mut opts = self.base.runner_options(&node, index);
            opts.state = None;
            opts.destinations = vec![self.base.state_saver(&node)];

            let runner = ctx.infra().node_runner_for_converge(ctx.meta(), opts)?;
            let outputs = apply_pipeline(&runner, &node, &MasterNodeOutputs).await?;
            save_master_node_state(
                ctx.client().as_ref(),
                &node,
                &outputs.infrastructure_state,
                outputs.kube_data_device_path.as_deref().unwrap_or_default(),
            )
            .await?;
            self.base
                .state
                .state
                .insert(node.clone(), outputs.infrastructure_state.clone());

            if let Some(host) = outputs.master_ip_for_ssh {
                self.hosts.push(MasterHost {
                    name: node.clone(),
                    host,
                });
                self.publish_hosts().await?;
            }
            internal_ips.extend(outputs.node_internal_ip);
            info!(node = %node, "Master created");
            added.push(node);
        }

        if !internal_ips.is_empty() {
            // existing masters are updated with endpoints of the new ones
            self.base.cloud_config =
                cloud_config_for_hosts(ctx.client().as_ref(), MASTER_NODE_GROUP_NAME, &internal_ips)
                    .await?;
        }

        let checker = ControlPlaneChecker::new(ctx.client());
        let readiness = &ctx.settings().readiness;
        match wait_for_nodes_list_ready(&checker, &added, readiness, ctx.tomb()).await {
            Err(e) if !e.is_interrupted() => {
                // not fatal: updates of the other masters check the control plane again
                warn!(nodes = ?added, error = %e, "New masters are not ready yet, continuing");
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
        let ctx = self.base.ctx.clone();
        let hook: Arc<dyn InfraActionHook> = Arc::new(ControlPlaneHook::for_update(
            ctx.client(),
            name,
            self.other_masters(name),
            ctx.settings().readiness,
            ctx.tomb().clone(),
        ));

        let mut opts = self.base.runner_options(name, index);
        opts.destinations = vec![self.base.state_saver(name)];
        opts.hook = Some(hook);
        let runner = ctx.infra().node_runner_for_converge(ctx.meta(), opts)?;
        let outputs = apply_pipeline(&runner, name, &MasterNodeOutputs).await?;
        save_master_node_state(
            ctx.client().as_ref(),
            name,
            &outputs.infrastructure_state,
            outputs.kube_data_device_path.as_deref().unwrap_or_default(),
        )
        .await?;
        self.base
            .state
            .state
            .insert(name.to_string(), outputs.infrastructure_state);

        wait_for_single_node_ready(
            &ControlPlaneChecker::new(ctx.client()),
            name,
            &ctx.settings().readiness,
            ctx.tomb(),
        )
        .await
    }

    async fn delete_nodes(&mut self, names: &[String]) -> Result<()> {
        let ctx = self.base.ctx.clone();
        let desired = self.base.desired_replicas;
        if desired < 1 {
            return Err(Error::CannotDeleteAllMasters);
        }
        let total = self.base.state.state.len() as u32;
        let required = total / 2 + 1;
        if desired < required
            && !self.migrating
            && !ctx.approve(&format!(
                "Removing masters down to {desired} breaks etcd quorum of {total} masters (required {required}). Continue?"
            ))
        {
            return Err(Error::QuorumNotConfirmed { desired, required });
        }

        let remaining: Vec<String> = self
            .base
            .state
            .state
            .keys()
            .filter(|name| !names.contains(name))
            .cloned()
            .collect();
        let readiness = ctx.settings().readiness;
        let tomb = ctx.tomb().clone();
        let hook_for = move |base: &NodeGroupBase, node: &str| -> Option<Arc<dyn InfraActionHook>> {
            Some(Arc::new(ControlPlaneHook::for_destroy(
                base.ctx.client(),
                node,
                remaining.clone(),
                readiness,
                tomb.clone(),
            )))
        };
        let deleted = delete_redundant_nodes(&mut self.base, names, &hook_for).await;

        let state = &self.base.state.state;
        self.hosts.retain(|h| state.contains_key(&h.name));
        self.publish_hosts().await?;
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClusterClient;
    use crate::context::{MockNodeTransport, NodeTransport};
    use crate::state::{converge_state, nodes_state, set_converge_state};
    use crate::testing::{
        destructive_plan, harness, harness_with, harness_with_transport, meta_config, FakeCluster,
    };
    use dhctl_common::confirm::{AutoAnswer, MockConfirm};

    async fn masters(cluster: &FakeCluster) -> NodeGroupInfrastructureState {
        nodes_state(cluster).await.unwrap().remove(MASTER_NODE_GROUP_NAME).unwrap()
    }

    fn three_master_endpoints(cluster: &FakeCluster) {
        cluster.put_cloud_config_with_endpoints(
            MASTER_NODE_GROUP_NAME,
            b"#cloud-config",
            &["192.168.0.1:6443", "192.168.0.2:6443", "192.168.0.3:6443"],
        );
    }

    #[tokio::test]
    async fn story_masters_are_added_in_order_and_registered_as_hosts() {
        let h = harness_with_transport(meta_config(3, &[]), Arc::new(AutoAnswer::yes()), |cluster| {
            let mut transport = MockNodeTransport::new();
            let mut seq = mockall::Sequence::new();
            transport
                .expect_switch_user()
                .withf(|session| session.user == "d8-dhctl-converge" && session.hosts.len() == 1)
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(cluster.clone() as Arc<dyn ClusterClient>));
            transport
                .expect_set_hosts()
                .withf(|hosts| hosts.len() == 2 && hosts[1].host == "10.0.0.2")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            transport
                .expect_set_hosts()
                .withf(|hosts| hosts.len() == 3 && hosts[2].name == "test-master-2")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            Arc::new(transport) as Arc<dyn NodeTransport>
        });
        h.cluster.seed_converged(&meta_config(1, &[]));
        three_master_endpoints(&h.cluster);
        h.seed_credentials().await;

        MasterNodeGroupController::new(h.ctx.clone(), masters(&h.cluster).await)
            .run()
            .await
            .unwrap();

        assert_eq!(h.infra.calls_of("apply"), vec!["test-master-1", "test-master-2"]);
        assert!(h.cluster.has_node("test-master-2"));
        let hosts = crate::state::master_hosts(h.ctx.cache().as_ref()).unwrap();
        assert_eq!(hosts.get("test-master-2").map(String::as_str), Some("10.0.0.3"));
    }

    #[tokio::test]
    async fn story_single_master_is_replaced_through_three_masters() {
        let meta = meta_config(1, &[]);
        let h = harness(meta.clone(), Arc::new(AutoAnswer::yes()));
        h.cluster.seed_converged(&meta);
        three_master_endpoints(&h.cluster);
        h.seed_credentials().await;
        h.infra.plan_for("test-master-0", destructive_plan("test-master-0"));

        MasterNodeGroupController::new(h.ctx.clone(), masters(&h.cluster).await)
            .run()
            .await
            .unwrap();

        assert_eq!(
            h.infra.calls_of("apply"),
            vec!["test-master-1", "test-master-2", "test-master-0"]
        );
        assert_eq!(h.infra.calls_of("destroy"), vec!["test-master-2", "test-master-1"]);
        let state = converge_state(h.cluster.as_ref()).await.unwrap();
        assert_eq!(state.phase, ConvergePhase::None);
        assert!(state.node_user_credentials.is_some());
        assert_eq!(masters(&h.cluster).await.state.len(), 1);
    }

    #[tokio::test]
    async fn story_interrupted_migration_resumes_at_the_recorded_step() {
        let h = harness(meta_config(1, &[]), Arc::new(AutoAnswer::yes()));
        // crashed right after growing to three masters
        h.cluster.seed_converged(&meta_config(3, &[]));
        h.seed_credentials().await;
        let mut state = converge_state(h.cluster.as_ref()).await.unwrap();
        state.phase = ConvergePhase::ScaleToSingleMaster;
        set_converge_state(h.cluster.as_ref(), &state).await.unwrap();
        h.ctx.restore_converge_state(state);

        MasterNodeGroupController::new(h.ctx.clone(), masters(&h.cluster).await)
            .run()
            .await
            .unwrap();

        assert!(h.infra.calls_of("apply").is_empty());
        assert_eq!(h.infra.calls_of("destroy"), vec!["test-master-2", "test-master-1"]);
        assert_eq!(converge_state(h.cluster.as_ref()).await.unwrap().phase, ConvergePhase::None);
    }

    #[tokio::test]
    async fn test_declined_migration_keeps_the_master() {
        let meta = meta_config(1, &[]);
        let mut confirm = MockConfirm::new();
        confirm
            .expect_ask()
            .returning(|question, _| !question.contains("three masters"));
        let h = harness_with(meta.clone(), Arc::new(confirm), |s| s.auto_approve = false);
        h.cluster.seed_converged(&meta);
        h.seed_credentials().await;
        h.infra.plan_for("test-master-0", destructive_plan("test-master-0"));

        let err = MasterNodeGroupController::new(h.ctx.clone(), masters(&h.cluster).await)
            .run()
            .await
            .unwrap_err();

        assert!(
            matches!(
                err,
                Error::SingleMasterDestructiveChanges { ref node } if node == "test-master-0"
            )
        );
        assert!(h.infra.calls_of("apply").is_empty());
        assert_eq!(converge_state(h.cluster.as_ref()).await.unwrap().phase, ConvergePhase::None);
    }

    #[tokio::test]
    async fn test_quorum_guard() {
        let meta = meta_config(3, &[]);
        let mut confirm = MockConfirm::new();
        confirm
            .expect_ask()
            .withf(|question, _| question.contains("quorum"))
            .times(1)
            .returning(|_, _| false);
        let h = harness_with(meta.clone(), Arc::new(confirm), |s| s.auto_approve = false);
        h.cluster.seed_converged(&meta);

        let mut controller = MasterNodeGroupController::new(
            h.ctx.clone(),
            masters(&h.cluster).await,
        );
        let names = vec!["test-master-2".to_string(), "test-master-1".to_string()];

        controller.base.desired_replicas = 1;
        let err = controller.delete_nodes(&names).await.unwrap_err();
        assert!(matches!(err, Error::QuorumNotConfirmed { desired: 1, required: 2 }));

        controller.base.desired_replicas = 0;
        let err = controller.delete_nodes(&names).await.unwrap_err();
        assert!(matches!(err, Error::CannotDeleteAllMasters));
        assert!(h.infra.calls_of("destroy").is_empty());
    }
}
