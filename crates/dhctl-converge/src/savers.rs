//! State saver destinations writing into the cluster

use std::sync::Arc;

use async_trait::async_trait;

use dhctl_common::Result;
use dhctl_infra::SaverDestination;

use crate::client::ClusterClient;
use crate::state::{patch_cluster_state, patch_or_create_node_state};

/// Mirrors intermediate base infrastructure states into the cluster state Secret
pub struct ClusterStateSaver {
    client: Arc<dyn ClusterClient>,
}

impl ClusterStateSaver {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SaverDestination for ClusterStateSaver {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        patch_cluster_state(self.client.as_ref(), state).await
    }
}

/// Mirrors intermediate node states into the node state Secret
pub struct NodeStateSaver {
    client: Arc<dyn ClusterClient>,
    node: String,
    node_group: String,
    settings: Option<Vec<u8>>,
}

impl NodeStateSaver {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        node: impl Into<String>,
        node_group: impl Into<String>,
        settings: Option<Vec<u8>>,
    ) -> Self {
        Self {
            client,
            node: node.into(),
            node_group: node_group.into(),
            settings,
        }
    }
}

#[async_trait]
impl SaverDestination for NodeStateSaver {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        patch_or_create_node_state(
            self.client.as_ref(),
            &self.node,
            &self.node_group,
            state,
            self.settings.as_deref(),
        )
        .await
    }
}
