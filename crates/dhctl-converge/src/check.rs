//! Drift report of a cluster against its desired configuration
//!
//! [`check_state`] plans every runner of the cluster without applying
//! anything and summarizes the outcome as [`Statistics`]. The same report
//! backs the destructive change approval of converge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, Instrument};

use dhctl_common::config::{node_index, sort_node_names_desc, MetaConfig};
use dhctl_common::{Error, Result, MASTER_NODE_GROUP_NAME};
use dhctl_infra::{
    check_base_infrastructure_pipeline, check_destroy_pipeline, check_pipeline,
    BaseInfrastructureDestructiveChanges, InfrastructureContext, NodeRunnerOptions, PlanChanges,
    PlanDestructiveChanges,
};

use crate::client::{node_group_template, ClusterClient};
use crate::destructive::destructive_change_id;
use crate::state::{
    cluster_state, nodes_state, nodes_state_from_cache, ordered_node_groups,
    NodeGroupInfrastructureState,
};

/// Status of one checked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    #[default]
    Ok,
    Changed,
    DestructivelyChanged,
    /// In the state but beyond the desired replicas
    Abandoned,
    /// Desired but without state
    Absent,
    Error,
}

impl CheckStatus {
    fn from_changes(changes: PlanChanges) -> Self {
        match changes {
            PlanChanges::NoChanges => CheckStatus::Ok,
            PlanChanges::Changes => CheckStatus::Changed,
            PlanChanges::DestructiveChanges => CheckStatus::DestructivelyChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterCheckResult {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_changes: Option<BaseInfrastructureDestructiveChanges>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeCheckResult {
    pub group: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_changes: Option<PlanDestructiveChanges>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeGroupCheckResult {
    pub name: String,
    pub status: CheckStatus,
}

/// Outcome of a check
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeCheckResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_templates: Vec<NodeGroupCheckResult>,
    #[serde(default)]
    pub cluster: ClusterCheckResult,
    /// Plan documents of every runner that has changes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terraform_plan: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destructive_change_id: String,
}

impl Statistics {
    /// Whether nothing has to be changed
    pub fn is_ok(&self) -> bool {
        self.cluster.status == CheckStatus::Ok
            && self.nodes.iter().all(|n| n.status == CheckStatus::Ok)
            && self.node_templates.iter().all(|t| t.status == CheckStatus::Ok)
    }

    /// Whether any plan deletes something
    pub fn has_destructive_changes(&self) -> bool {
        self.cluster.destructive_changes.is_some()
            || self.nodes.iter().any(|n| n.destructive_changes.is_some())
    }

    /// Render for humans as `json` or `yaml`, without plans and destructive details
    pub fn format(&self, format: &str) -> Result<Vec<u8>> {
        let mut summary = self.clone();
        summary.terraform_plan.clear();
        summary.cluster.destructive_changes = None;
        for node in &mut summary.nodes {
            node.destructive_changes = None;
        }
        match format {
            "json" => Ok(serde_json::to_vec_pretty(&summary)?),
            "yaml" => Ok(serde_yaml::to_string(&summary)?.into_bytes()),
            other => Err(Error::validation_for_field(
                "output",
                format!("unknown output format {other}"),
            )),
        }
    }
}

/// Statistics and the errors met while collecting them
#[derive(Debug, Default)]
pub struct CheckReport {
    pub statistics: Statistics,
    pub errors: Vec<Error>,
}

impl CheckReport {
    /// The statistics, or the accumulated errors
    pub fn into_result(self) -> Result<Statistics> {
        Error::from_many(self.errors)?;
        Ok(self.statistics)
    }
}

struct Checker<'a> {
    client: &'a dyn ClusterClient,
    meta: &'a MetaConfig,
    infra: &'a InfrastructureContext,
    report: CheckReport,
}

impl Checker<'_> {
    async fn check_cluster(&mut self) {
        let state = if self.infra.commander_mode() {
            None
        } else {
            match cluster_state(self.client).await {
                Ok(Some(state)) => Some(state),
                Ok(None) => {
                    self.cluster_failed(Error::NoInfrastructureState {
                        what: "kubernetes cluster".to_string(),
                    });
                    return;
                }
                Err(e) => {
                    self.cluster_failed(e);
                    return;
                }
            }
        };

        let checked = async {
            let runner = self.infra.base_infra_runner_for_check(self.meta, state)?;
            check_base_infrastructure_pipeline(&runner, "Kubernetes cluster").await
        }
        .await;
        match checked {
            Ok(check) => {
                self.report.statistics.cluster = ClusterCheckResult {
                    status: CheckStatus::from_changes(check.changes),
                    destructive_changes: check.destructive,
                };
                self.report.statistics.terraform_plan.extend(check.plan);
            }
            Err(e) => self.cluster_failed(e),
        }
    }

    fn cluster_failed(&mut self, error: Error) {
        self.report.statistics.cluster.status = CheckStatus::Error;
        self.report.errors.push(error);
    }

    async fn node_states(&mut self) -> BTreeMap<String, NodeGroupInfrastructureState> {
        let loaded = if self.infra.commander_mode() {
            nodes_state_from_cache(self.infra.cache().as_ref(), self.meta)
        } else {
            nodes_state(self.client).await
        };
        loaded.unwrap_or_else(|e| {
            self.report.errors.push(e);
            BTreeMap::new()
        })
    }

    async fn check_templates(&mut self) {
        let templates: BTreeMap<String, Value> = match self.client.list_node_groups().await {
            Ok(groups) => groups
                .iter()
                .filter_map(|ng| {
                    let name = ng.metadata.name.clone()?;
                    Some((name, node_group_template(ng).cloned().unwrap_or_else(|| json!({}))))
                })
                .collect(),
            Err(e) => {
                self.report.errors.push(e);
                BTreeMap::new()
            }
        };

        let stats = &mut self.report.statistics;
        stats.node_templates.push(NodeGroupCheckResult {
            name: MASTER_NODE_GROUP_NAME.to_string(),
            status: CheckStatus::Ok,
        });
        for group in &self.meta.terra_node_groups {
            let desired = group.node_template.clone().unwrap_or_else(|| json!({}));
            let status = match templates.get(&group.name) {
                Some(current) if *current == desired => CheckStatus::Ok,
                Some(_) => CheckStatus::Changed,
                None => CheckStatus::Absent,
            };
            stats.node_templates.push(NodeGroupCheckResult {
                name: group.name.clone(),
                status,
            });
        }
    }

    async fn missed_node(&mut self, group: &str, name: String) {
        let status = match self.client.get_node(&name).await {
            Ok(Some(_)) => CheckStatus::Error,
            Ok(None) => CheckStatus::Absent,
            Err(e) => {
                self.report.errors.push(e);
                CheckStatus::Error
            }
        };
        self.report.statistics.nodes.push(NodeCheckResult {
            group: group.to_string(),
            name,
            status,
            destructive_changes: None,
        });
    }

    fn runner_options(
        &self,
        group: &str,
        name: &str,
        state: &[u8],
        settings: Option<Vec<u8>>,
    ) -> Result<NodeRunnerOptions> {
        Ok(NodeRunnerOptions {
            node_group: group.to_string(),
            node_index: node_index(name)?,
            node_name: name.to_string(),
            state: (!self.infra.commander_mode()).then(|| state.to_vec()),
            node_group_settings: settings,
            ..Default::default()
        })
    }

    async fn check_abandoned(
        &mut self,
        group: &str,
        name: &str,
        state: &[u8],
        settings: Option<Vec<u8>>,
    ) {
        let checked = async {
            let opts = self.runner_options(group, name, state, settings)?;
            let runner = self.infra.node_runner_for_check(self.meta, opts)?;
            check_destroy_pipeline(&runner, name).await
        }
        .await;
        let mut result = NodeCheckResult {
            group: group.to_string(),
            name: name.to_string(),
            status: CheckStatus::Abandoned,
            destructive_changes: None,
        };
        match checked {
            Ok(check) => {
                result.destructive_changes = check.destructive;
                self.report.statistics.terraform_plan.extend(check.plan);
            }
            Err(e) => {
                result.status = CheckStatus::Error;
                self.report.errors.push(
                    Error::internal_with_context(format!("node {name}"), e.to_string()),
                );
            }
        }
        self.report.statistics.nodes.push(result);
    }

    async fn check_node(&mut self, group: &str, name: &str, state: &[u8]) {
        let checked = async {
            let opts = self.runner_options(group, name, state, None)?;
            let runner = self.infra.node_runner_for_check(self.meta, opts)?;
            check_pipeline(&runner, name).await
        }
        .await;
        let mut result = NodeCheckResult {
            group: group.to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        match checked {
            Ok(check) => {
                result.status = CheckStatus::from_changes(check.changes);
                if result.status == CheckStatus::DestructivelyChanged {
                    result.destructive_changes = check.destructive;
                }
                self.report.statistics.terraform_plan.extend(check.plan);
            }
            Err(e) => {
                result.status = CheckStatus::Error;
                self.report.errors.push(
                    Error::internal_with_context(format!("node {name}"), e.to_string()),
                );
            }
        }
        self.report.statistics.nodes.push(result);
    }

    async fn check_group(&mut self, group: &str, mut state: NodeGroupInfrastructureState) {
        let replicas = self.meta.replicas_for(group) as usize;
        if replicas > state.state.len() {
            let mut missing: Vec<String> = (0..replicas as u32)
                .map(|i| self.meta.node_name(group, i))
                .filter(|name| !state.state.contains_key(name))
                .collect();
            // indices are not always contiguous: only the shortfall is reported
            missing.truncate(replicas - state.state.len());
            for name in missing {
                self.missed_node(group, name).await;
            }
        } else if replicas < state.state.len() {
            let names: Vec<&String> = state.state.keys().collect();
            let surplus: Vec<String> = sort_node_names_desc(&names)
                .into_iter()
                .take(state.state.len() - replicas)
                .collect();
            for name in surplus {
                if let Some(node_state) = state.state.remove(&name) {
                    self.check_abandoned(group, &name, &node_state, state.settings.clone()).await;
                }
            }
        }

        let names: Vec<&String> = state.state.keys().collect();
        for name in sort_node_names_desc(&names) {
            self.check_node(group, &name, &state.state[&name]).await;
        }
    }
}

/// Plan every runner of the cluster and report what differs
pub async fn check_state(
    client: &dyn ClusterClient,
    meta: &MetaConfig,
    infra: &InfrastructureContext,
) -> CheckReport {
    let mut checker = Checker {
        client,
        meta,
        infra,
        report: CheckReport::default(),
    };
    async {
        checker.check_cluster().await;
        let mut states = checker.node_states().await;
        checker.check_templates().await;

        for group in &meta.terra_node_groups {
            if states.contains_key(&group.name) {
                continue;
            }
            debug!(node_group = %group.name, "Node group has no infrastructure state");
            for i in 0..group.replicas {
                checker.missed_node(&group.name, meta.node_name(&group.name, i)).await;
            }
        }

        let keys: Vec<String> = states.keys().cloned().collect();
        for group in ordered_node_groups(meta, &keys) {
            if let Some(state) = states.remove(&group) {
                checker.check_group(&group, state).await;
            }
        }
    }
    .instrument(info_span!("check_state"))
    .await;

    let mut report = checker.report;
    match destructive_change_id(&report.statistics) {
        Ok(id) => report.statistics.destructive_change_id = id,
        Err(e) => report.errors.push(e),
    }
    info!(
        cluster = ?report.statistics.cluster.status,
        nodes = report.statistics.nodes.len(),
        errors = report.errors.len(),
        "Check finished"
    );
    report
}
