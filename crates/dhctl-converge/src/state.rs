//! Infrastructure and converge state persisted in the cluster
//!
//! The base infrastructure state lives in `d8-cluster-terraform-state`, every
//! node has its own `d8-node-terraform-state-<node>` Secret labelled with its
//! group, and the converge progress of the master controller lives in
//! `d8-dhctl-converge-state`. In commander mode the node states come from the
//! local cache instead.

use std::collections::BTreeMap;

use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dhctl_common::cache::{StateCache, StateCacheExt};
use dhctl_common::config::{node_index, MetaConfig};
use dhctl_common::retry::{retry_with_backoff_if, RetryConfig};
use dhctl_common::secrets::*;
use dhctl_common::{
    Error, Result, CLOUD_INSTANCE_MANAGER_NAMESPACE, D8_SYSTEM_NAMESPACE, KUBE_SYSTEM_NAMESPACE,
    MASTER_NODE_GROUP_NAME,
};
use dhctl_infra::PipelineOutputs;

use crate::client::{secret_value, ClusterClient};

/// Cache key of the base infrastructure state
pub const BASE_INFRASTRUCTURE_CACHE_KEY: &str = "base-infrastructure.tfstate";

/// Cache key of the master hosts known to the last converge
pub const MASTER_HOSTS_CACHE_KEY: &str = "cluster-hosts";

const STATE_SUFFIX: &str = ".tfstate";
const CLOUD_CONFIG_SECRET_PREFIX: &str = "manual-bootstrap-for-";
const CLOUD_CONFIG_KEY: &str = "cloud-config";
const APISERVER_ENDPOINTS_KEY: &str = "apiserverEndpoints";

/// Infrastructure state of one node group, keyed by node name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeGroupInfrastructureState {
    pub state: BTreeMap<String, Vec<u8>>,
    /// Group settings the nodes were created with
    pub settings: Option<Vec<u8>>,
}

/// Step of the single-master migration the master controller is in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergePhase {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "base-infrastructure")]
    BaseInfrastructure,
    #[serde(rename = "all-nodes")]
    AllNodes,
    #[serde(rename = "scale-to-multi-master")]
    ScaleToMultiMaster,
    #[serde(rename = "scale-to-single-master")]
    ScaleToSingleMaster,
}

/// Credentials of the in-cluster user dhctl connects to masters with
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUserCredentials {
    pub name: String,
    /// PEM encoded private key
    pub private_key: String,
    pub password: String,
}

impl std::fmt::Debug for NodeUserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeUserCredentials")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergeState {
    #[serde(default)]
    pub phase: ConvergePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_user_credentials: Option<NodeUserCredentials>,
}

pub(crate) fn cluster_retry() -> RetryConfig {
    RetryConfig::state_save()
}

pub(crate) fn secret(
    namespace: &str,
    name: &str,
    data: BTreeMap<String, Vec<u8>>,
    labels: BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
        ..Default::default()
    }
}

/// Name of the Secret holding the state of `node`
pub fn node_state_secret_name(node: &str) -> String {
    format!("{NODE_STATE_PREFIX}{node}")
}

/// Secret holding the state of one node; masters have no settings key
pub fn node_state_secret(
    node: &str,
    node_group: &str,
    state: &[u8],
    settings: Option<&[u8]>,
) -> Secret {
    let mut data = BTreeMap::from([(NODE_STATE_KEY.to_string(), state.to_vec())]);
    if let Some(settings) = settings.filter(|s| !s.is_empty()) {
        data.insert(NODE_GROUP_SETTINGS_KEY.to_string(), settings.to_vec());
    }
    let labels = BTreeMap::from([
        (LABEL_TERRAFORM_STATE.to_string(), String::new()),
        (LABEL_NODE_NAME.to_string(), node.to_string()),
        (LABEL_NODE_GROUP.to_string(), node_group.to_string()),
    ]);
    secret(D8_SYSTEM_NAMESPACE, &node_state_secret_name(node), data, labels)
}

/// Base infrastructure state; `None` when the cluster has none
pub async fn cluster_state(client: &dyn ClusterClient) -> Result<Option<Vec<u8>>> {
    let secret = retry_with_backoff_if(
        &cluster_retry(),
        "get cluster infrastructure state",
        || client.get_secret(D8_SYSTEM_NAMESPACE, CLUSTER_STATE),
        Error::is_retryable,
    )
    .await?;
    Ok(secret
        .and_then(|s| secret_value(&s, CLUSTER_STATE_KEY))
        .filter(|state| !state.is_empty()))
}

/// Persist the base infrastructure outputs and the discovery data
pub async fn save_cluster_state(
    client: &dyn ClusterClient,
    outputs: &PipelineOutputs,
) -> Result<()> {
    if outputs.infrastructure_state.is_empty() {
        return Err(Error::NoInfrastructureState {
            what: "cluster".to_string(),
        });
    }
    let manifest = secret(
        D8_SYSTEM_NAMESPACE,
        CLUSTER_STATE,
        BTreeMap::from([(CLUSTER_STATE_KEY.to_string(), outputs.infrastructure_state.clone())]),
        BTreeMap::new(),
    );
    retry_with_backoff_if(
        &cluster_retry(),
        "save cluster infrastructure state",
        || client.create_or_update_secret(&manifest),
        Error::is_retryable,
    )
    .await?;

    let Some(discovery) = &outputs.cloud_discovery else {
        return Ok(());
    };
    let discovery = serde_json::to_vec(discovery)?;
    retry_with_backoff_if(
        &cluster_retry(),
        "update cloud discovery data",
        || {
            client.patch_secret_data(
                KUBE_SYSTEM_NAMESPACE,
                PROVIDER_CLUSTER_CONFIGURATION,
                BTreeMap::from([(PROVIDER_DISCOVERY_DATA_KEY.to_string(), discovery.clone())]),
            )
        },
        Error::is_retryable,
    )
    .await
}

/// Replace the base infrastructure state key only
pub async fn patch_cluster_state(client: &dyn ClusterClient, state: &[u8]) -> Result<()> {
    client
        .patch_secret_data(
            D8_SYSTEM_NAMESPACE,
            CLUSTER_STATE,
            BTreeMap::from([(CLUSTER_STATE_KEY.to_string(), state.to_vec())]),
        )
        .await
}

/// States of all nodes created by the infrastructure tool, by node group
pub async fn nodes_state(
    client: &dyn ClusterClient,
) -> Result<BTreeMap<String, NodeGroupInfrastructureState>> {
    let secrets = retry_with_backoff_if(
        &cluster_retry(),
        "get nodes infrastructure state",
        || client.list_secrets(D8_SYSTEM_NAMESPACE, LABEL_TERRAFORM_STATE),
        Error::is_retryable,
    )
    .await?;

    let mut groups: BTreeMap<String, NodeGroupInfrastructureState> = BTreeMap::new();
    for secret in secrets {
        let labels = secret.metadata.labels.clone().unwrap_or_default();
        let Some(group) = labels.get(LABEL_NODE_GROUP) else {
            warn!(
                secret = ?secret.metadata.name,
                "Node state secret has no node group label, skipping"
            );
            continue;
        };
        let node = labels.get(LABEL_NODE_NAME).cloned().or_else(|| {
            secret
                .metadata
                .name
                .as_deref()
                .and_then(|n| n.strip_prefix(NODE_STATE_PREFIX))
                .map(str::to_string)
        });
        let Some(node) = node else {
            continue;
        };

        let entry = groups.entry(group.clone()).or_default();
        if entry.settings.is_none() {
            entry.settings = secret_value(&secret, NODE_GROUP_SETTINGS_KEY)
                .filter(|s| !s.is_empty());
        }
        entry
            .state
            .insert(node, secret_value(&secret, NODE_STATE_KEY).unwrap_or_default());
    }
    Ok(groups)
}

/// Node states kept in the local cache (commander mode)
///
/// Every `<node>.tfstate` key except the base infrastructure one is a node
/// named `<prefix>-<group>-<index>`; settings come from the desired config.
pub fn nodes_state_from_cache(
    cache: &dyn StateCache,
    meta: &MetaConfig,
) -> Result<BTreeMap<String, NodeGroupInfrastructureState>> {
    let prefix = format!("{}-", meta.cluster_prefix);
    let mut groups: BTreeMap<String, NodeGroupInfrastructureState> = BTreeMap::new();
    cache.iterate(&mut |key, value| {
        let Some(node) = key.strip_suffix(STATE_SUFFIX) else {
            return Ok(());
        };
        if key == BASE_INFRASTRUCTURE_CACHE_KEY || node_index(node).is_err() {
            return Ok(());
        }
        let Some(group) = node
            .strip_prefix(&prefix)
            .and_then(|rest| rest.rsplit_once('-'))
            .map(|(group, _)| group.to_string())
        else {
            return Ok(());
        };
        let entry = groups.entry(group.clone()).or_default();
        if group != MASTER_NODE_GROUP_NAME && entry.settings.is_none() {
            entry.settings = meta
                .find_terra_node_group(&group)
                .map(|settings| serde_json::to_vec(&settings))
                .transpose()?;
        }
        entry.state.insert(node.to_string(), value.to_vec());
        Ok(())
    })?;
    Ok(groups)
}

/// Create or update the state Secret of a node
pub async fn save_node_state(
    client: &dyn ClusterClient,
    node: &str,
    node_group: &str,
    state: &[u8],
    settings: Option<&[u8]>,
) -> Result<()> {
    if state.is_empty() {
        return Err(Error::NoInfrastructureState {
            what: format!("node {node}"),
        });
    }
    let manifest = node_state_secret(node, node_group, state, settings);
    retry_with_backoff_if(
        &cluster_retry(),
        &format!("save infrastructure state for node {node}"),
        || client.create_or_update_secret(&manifest),
        Error::is_retryable,
    )
    .await
}

/// Patch the state key of a node Secret, creating the Secret for new nodes
pub async fn patch_or_create_node_state(
    client: &dyn ClusterClient,
    node: &str,
    node_group: &str,
    state: &[u8],
    settings: Option<&[u8]>,
) -> Result<()> {
    let patched = client
        .patch_secret_data(
            D8_SYSTEM_NAMESPACE,
            &node_state_secret_name(node),
            BTreeMap::from([(NODE_STATE_KEY.to_string(), state.to_vec())]),
        )
        .await;
    match patched {
        Err(e) if e.is_not_found() => {
            debug!(node, "Node state secret is absent, creating");
            client
                .create_or_update_secret(&node_state_secret(node, node_group, state, settings))
                .await
        }
        other => other,
    }
}

/// Save a master state together with its kubernetes data device path
pub async fn save_master_node_state(
    client: &dyn ClusterClient,
    node: &str,
    state: &[u8],
    device_path: &str,
) -> Result<()> {
    let mut errors = Vec::new();
    if let Err(e) = save_node_state(client, node, MASTER_NODE_GROUP_NAME, state, None).await {
        errors.push(e);
    }

    let data = &BTreeMap::from([(node.to_string(), device_path.as_bytes().to_vec())]);
    let saved = retry_with_backoff_if(
        &cluster_retry(),
        "save masters kubernetes data device path",
        || async move {
            match client
                .patch_secret_data(D8_SYSTEM_NAMESPACE, MASTERS_DEVICE_PATH, data.clone())
                .await
            {
                Err(e) if e.is_not_found() => {
                    client
                        .create_or_update_secret(&secret(
                            D8_SYSTEM_NAMESPACE,
                            MASTERS_DEVICE_PATH,
                            data.clone(),
                            BTreeMap::new(),
                        ))
                        .await
                }
                other => other,
            }
        },
        Error::is_retryable,
    )
    .await;
    if let Err(e) = saved {
        errors.push(e);
    }
    Error::from_many(errors)
}

/// Delete the state Secret of a node
pub async fn delete_node_state(client: &dyn ClusterClient, node: &str) -> Result<()> {
    let name = node_state_secret_name(node);
    retry_with_backoff_if(
        &cluster_retry(),
        &format!("delete infrastructure state {name}"),
        || client.delete_secret(D8_SYSTEM_NAMESPACE, &name),
        Error::is_retryable,
    )
    .await
}

/// Converge progress; the default state when none was saved
pub async fn converge_state(client: &dyn ClusterClient) -> Result<ConvergeState> {
    let secret = retry_with_backoff_if(
        &cluster_retry(),
        "get converge state",
        || client.get_secret(D8_SYSTEM_NAMESPACE, CONVERGE_STATE),
        Error::is_retryable,
    )
    .await?;
    match secret.and_then(|s| secret_value(&s, CONVERGE_STATE_KEY)) {
        Some(data) if !data.is_empty() => Ok(serde_json::from_slice(&data)?),
        _ => Ok(ConvergeState::default()),
    }
}

pub async fn set_converge_state(client: &dyn ClusterClient, state: &ConvergeState) -> Result<()> {
    let manifest = secret(
        D8_SYSTEM_NAMESPACE,
        CONVERGE_STATE,
        BTreeMap::from([(CONVERGE_STATE_KEY.to_string(), serde_json::to_vec(state)?)]),
        BTreeMap::new(),
    );
    info!(phase = ?state.phase, "Saving converge state");
    retry_with_backoff_if(
        &cluster_retry(),
        "save converge state",
        || client.create_or_update_secret(&manifest),
        Error::is_retryable,
    )
    .await
}

pub async fn delete_converge_state(client: &dyn ClusterClient) -> Result<()> {
    retry_with_backoff_if(
        &cluster_retry(),
        "delete converge state",
        || client.delete_secret(D8_SYSTEM_NAMESPACE, CONVERGE_STATE),
        Error::is_retryable,
    )
    .await
}

/// Cloud config for nodes of a group, base64 encoded as the layouts expect
pub async fn cloud_config(client: &dyn ClusterClient, node_group: &str) -> Result<String> {
    cloud_config_for_hosts(client, node_group, &[]).await
}

/// Cloud config that already lists every host in `apiserver_hosts` among its
/// API server endpoints; waits for the node manager to render it
pub async fn cloud_config_for_hosts(
    client: &dyn ClusterClient,
    node_group: &str,
    apiserver_hosts: &[String],
) -> Result<String> {
    let name = &format!("{CLOUD_CONFIG_SECRET_PREFIX}{node_group}");
    let data = retry_with_backoff_if(
        &cluster_retry(),
        &format!("get cloud config for node group {node_group}"),
        || async move {
            let secret = client
                .get_secret(CLOUD_INSTANCE_MANAGER_NAMESPACE, name)
                .await?
                .ok_or_else(|| {
                    Error::internal_with_context(
                        format!("node group {node_group}"),
                        format!("secret {name} not found"),
                    )
                })?;
            let data = secret_value(&secret, CLOUD_CONFIG_KEY).ok_or_else(|| {
                Error::internal_with_context(
                    format!("node group {node_group}"),
                    format!("secret {name} has no {CLOUD_CONFIG_KEY}"),
                )
            })?;
            if !apiserver_hosts.is_empty() {
                let endpoints = apiserver_endpoints(&secret)?;
                if let Some(missing) = apiserver_hosts
                    .iter()
                    .find(|host| !endpoints.iter().any(|e| endpoint_host(e) == host.as_str()))
                {
                    return Err(Error::internal_with_context(
                        format!("node group {node_group}"),
                        format!("apiserver endpoint for {missing} is not rendered yet"),
                    ));
                }
            }
            Ok(data)
        },
        Error::is_retryable,
    )
    .await?;
    Ok(base64::engine::general_purpose::STANDARD.encode(data))
}

fn apiserver_endpoints(secret: &Secret) -> Result<Vec<String>> {
    match secret_value(secret, APISERVER_ENDPOINTS_KEY) {
        Some(raw) if !raw.is_empty() => serde_yaml::from_slice(&raw)
            .map_err(|e| Error::serialization_for_kind(APISERVER_ENDPOINTS_KEY, e.to_string())),
        _ => Ok(Vec::new()),
    }
}

fn endpoint_host(endpoint: &str) -> &str {
    endpoint.rsplit_once(':').map(|(host, _)| host).unwrap_or(endpoint)
}

/// Node groups of `groups` in converge order: master first, then the
/// desired groups as declared, then the groups only the state knows about
pub fn ordered_node_groups<'a>(
    meta: &MetaConfig,
    groups: impl IntoIterator<Item = &'a String>,
) -> Vec<String> {
    let mut rest: Vec<String> = groups.into_iter().cloned().collect();
    let mut ordered = Vec::with_capacity(rest.len());
    let desired = std::iter::once(MASTER_NODE_GROUP_NAME)
        .chain(meta.terra_node_groups.iter().map(|g| g.name.as_str()));
    for name in desired {
        if let Some(pos) = rest.iter().position(|g| g == name) {
            ordered.push(rest.remove(pos));
        }
    }
    ordered.extend(rest);
    ordered
}

/// Remember the SSH addresses of masters for the next connection
pub fn save_master_hosts(cache: &dyn StateCache, hosts: &BTreeMap<String, String>) -> Result<()> {
    cache.save_struct(MASTER_HOSTS_CACHE_KEY, hosts)
}

pub fn master_hosts(cache: &dyn StateCache) -> Result<BTreeMap<String, String>> {
    Ok(cache.load_struct(MASTER_HOSTS_CACHE_KEY)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use dhctl_common::cache::MemoryCache;
    use serde_json::json;

    #[test]
    fn test_converge_state_wire_format() {
        let state = ConvergeState {
            phase: ConvergePhase::ScaleToMultiMaster,
            node_user_credentials: Some(NodeUserCredentials {
                name: "d8-dhctl-converge".into(),
                private_key: "pem".into(),
                password: "secret".into(),
            }),
        };
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "phase": "scale-to-multi-master",
                "nodeUserCredentials": {"name": "d8-dhctl-converge", "privateKey": "pem", "password": "secret"}
            })
        );
        assert_eq!(
            serde_json::to_value(ConvergeState::default()).unwrap(),
            json!({"phase": ""})
        );
        assert!(!format!("{:?}", state.node_user_credentials).contains("secret"));
    }

    #[tokio::test]
    async fn test_converge_state_defaults_when_absent() {
        let cluster = FakeCluster::default();
        assert_eq!(converge_state(&cluster).await.unwrap(), ConvergeState::default());

        let state = ConvergeState {
            phase: ConvergePhase::ScaleToSingleMaster,
            node_user_credentials: None,
        };
        set_converge_state(&cluster, &state).await.unwrap();
        assert_eq!(converge_state(&cluster).await.unwrap(), state);

        delete_converge_state(&cluster).await.unwrap();
        assert_eq!(converge_state(&cluster).await.unwrap(), ConvergeState::default());
    }

    #[tokio::test]
    async fn test_nodes_state_groups_by_label() {
        let cluster = FakeCluster::default();
        save_node_state(&cluster, "test-master-0", "master", b"m0", None).await.unwrap();
        save_node_state(&cluster, "test-worker-0", "worker", b"w0", Some(b"{\"name\":\"worker\"}"))
            .await
            .unwrap();
        save_node_state(&cluster, "test-worker-1", "worker", b"w1", Some(b"{\"name\":\"worker\"}"))
            .await
            .unwrap();

        let states = nodes_state(&cluster).await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states["master"].state["test-master-0"], b"m0".to_vec());
        assert_eq!(states["master"].settings, None);
        assert_eq!(states["worker"].state.len(), 2);
        assert_eq!(states["worker"].settings.as_deref(), Some(&b"{\"name\":\"worker\"}"[..]));
    }

    #[tokio::test]
    async fn test_empty_state_is_refused() {
        let cluster = FakeCluster::default();
        let err = save_node_state(&cluster, "test-master-0", "master", b"", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoInfrastructureState { .. }));
    }

    #[tokio::test]
    async fn test_patch_or_create_node_state() {
        let cluster = FakeCluster::default();
        patch_or_create_node_state(&cluster, "test-worker-0", "worker", b"one", Some(b"{}"))
            .await
            .unwrap();
        patch_or_create_node_state(&cluster, "test-worker-0", "worker", b"two", Some(b"{}"))
            .await
            .unwrap();
        let secret = cluster
            .secret(D8_SYSTEM_NAMESPACE, "d8-node-terraform-state-test-worker-0")
            .unwrap();
        assert_eq!(secret_value(&secret, NODE_STATE_KEY), Some(b"two".to_vec()));
        assert_eq!(secret_value(&secret, NODE_GROUP_SETTINGS_KEY), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_master_state_keeps_other_device_paths() {
        let cluster = FakeCluster::default();
        save_master_node_state(&cluster, "test-master-0", b"m0", "/dev/vdb").await.unwrap();
        save_master_node_state(&cluster, "test-master-1", b"m1", "/dev/vdc").await.unwrap();

        let secret = cluster.secret(D8_SYSTEM_NAMESPACE, MASTERS_DEVICE_PATH).unwrap();
        assert_eq!(secret_value(&secret, "test-master-0"), Some(b"/dev/vdb".to_vec()));
        assert_eq!(secret_value(&secret, "test-master-1"), Some(b"/dev/vdc".to_vec()));
    }

    #[tokio::test]
    async fn test_cluster_state_updates_discovery() {
        let cluster = FakeCluster::default();
        cluster.put_secret(KUBE_SYSTEM_NAMESPACE, PROVIDER_CLUSTER_CONFIGURATION, BTreeMap::new());
        let outputs = PipelineOutputs {
            infrastructure_state: b"{\"version\":4}".to_vec(),
            cloud_discovery: Some(json!({"zones": ["a"]})),
            ..Default::default()
        };
        save_cluster_state(&cluster, &outputs).await.unwrap();

        assert_eq!(cluster_state(&cluster).await.unwrap(), Some(b"{\"version\":4}".to_vec()));
        let provider = cluster
            .secret(KUBE_SYSTEM_NAMESPACE, PROVIDER_CLUSTER_CONFIGURATION)
            .unwrap();
        assert_eq!(
            secret_value(&provider, PROVIDER_DISCOVERY_DATA_KEY),
            Some(serde_json::to_vec(&json!({"zones": ["a"]})).unwrap())
        );
    }

    #[tokio::test]
    async fn test_cloud_config_is_base64() {
        let cluster = FakeCluster::default();
        cluster.put_cloud_config("worker", b"#cloud-config");
        assert_eq!(cloud_config(&cluster, "worker").await.unwrap(), "I2Nsb3VkLWNvbmZpZw==");
    }

    #[tokio::test]
    async fn test_cloud_config_lists_requested_hosts() {
        let cluster = FakeCluster::default();
        cluster.put_cloud_config_with_endpoints(
            "master",
            b"#cloud-config",
            &["192.168.0.1:6443", "192.168.0.2:6443"],
        );
        let hosts = vec!["192.168.0.2".to_string()];
        assert_eq!(
            cloud_config_for_hosts(&cluster, "master", &hosts).await.unwrap(),
            "I2Nsb3VkLWNvbmZpZw=="
        );
    }

    #[test]
    fn test_nodes_state_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(dir.path());
        cache.save(BASE_INFRASTRUCTURE_CACHE_KEY, b"base").unwrap();
        cache.save("test-master-0.tfstate", b"m0").unwrap();
        cache.save("test-khm-worker-2.tfstate", b"w2").unwrap();
        cache.save("uuid", b"\"x\"").unwrap();

        let meta = crate::testing::meta_config(1, &[("khm-worker", 3)]);
        let states = nodes_state_from_cache(&cache, &meta).unwrap();
        assert_eq!(states.keys().collect::<Vec<_>>(), vec!["khm-worker", "master"]);
        assert_eq!(states["khm-worker"].state["test-khm-worker-2"], b"w2".to_vec());
        assert_eq!(states["master"].settings, None);
        let settings: serde_json::Value =
            serde_json::from_slice(states["khm-worker"].settings.as_ref().unwrap()).unwrap();
        assert_eq!(settings["name"], "khm-worker");
    }

    #[rstest::rstest]
    #[case::master_first(
        &["back", "gone", "master", "front"],
        &["master", "front", "back", "gone"]
    )]
    #[case::unknown_keep_order(&["zeta", "front", "alpha"], &["front", "zeta", "alpha"])]
    #[case::only_master(&["master"], &["master"])]
    fn test_node_groups_order(#[case] groups: &[&str], #[case] expected: &[&str]) {
        let meta = crate::testing::meta_config(1, &[("front", 1), ("back", 1)]);
        let groups: Vec<String> = groups.iter().map(|s| s.to_string()).collect();
        assert_eq!(ordered_node_groups(&meta, &groups), expected);
    }
}
