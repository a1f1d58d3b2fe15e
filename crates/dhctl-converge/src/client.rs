//! Cluster access used by the converge operations
//!
//! Everything the controllers read or write in the cluster goes through
//! [`ClusterClient`], so that controllers and the engine are tested against
//! mocks or the in-memory cluster of the test module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tracing::debug;

use dhctl_common::{Error, Result, FIELD_MANAGER};

/// `deckhouse.io/v1` NodeGroup
pub fn node_group_resource() -> ApiResource {
    ApiResource {
        group: "deckhouse.io".to_string(),
        version: "v1".to_string(),
        api_version: "deckhouse.io/v1".to_string(),
        kind: "NodeGroup".to_string(),
        plural: "nodegroups".to_string(),
    }
}

/// `deckhouse.io/v1` NodeUser
pub fn node_user_resource() -> ApiResource {
    ApiResource {
        group: "deckhouse.io".to_string(),
        version: "v1".to_string(),
        api_version: "deckhouse.io/v1".to_string(),
        kind: "NodeUser".to_string(),
        plural: "nodeusers".to_string(),
    }
}

/// Trait abstracting the cluster API for testability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a Secret; `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// List Secrets matching a label selector
    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>>;

    /// Create a Secret, or merge it into the existing one
    async fn create_or_update_secret(&self, secret: &Secret) -> Result<()>;

    /// Merge `data` keys into an existing Secret (fails with not found)
    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()>;

    /// Delete a Secret; a missing Secret is not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a ConfigMap; `None` when it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a ConfigMap, or merge it into the existing one
    async fn create_or_update_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Get a Node; `None` when it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Delete a Node; a missing Node is not an error
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// List Pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Get a NodeGroup; `None` when it does not exist
    async fn get_node_group(&self, name: &str) -> Result<Option<DynamicObject>>;

    /// All NodeGroups of the cluster
    async fn list_node_groups(&self) -> Result<Vec<DynamicObject>>;

    /// Create a NodeGroup; an existing one is left untouched
    async fn create_node_group(&self, manifest: &Value) -> Result<()>;

    /// Replace a NodeGroup read before.
    ///
    /// Fails with [`Error::NodeGroupChanged`] when it was modified meanwhile.
    async fn update_node_group(&self, node_group: &DynamicObject) -> Result<()>;

    /// Delete a NodeGroup; a missing one is not an error
    async fn delete_node_group(&self, name: &str) -> Result<()>;

    /// Create or replace a NodeUser
    async fn create_or_update_node_user(&self, manifest: &Value) -> Result<()>;

    /// Delete a NodeUser; a missing one is not an error
    async fn delete_node_user(&self, name: &str) -> Result<()>;

    /// Get a Lease; `None` when it does not exist
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    /// Create a Lease; `false` when another holder created it first
    async fn create_lease(&self, lease: &Lease) -> Result<bool>;

    /// Replace a Lease by resource version; `false` on conflict
    async fn replace_lease(&self, lease: &Lease) -> Result<bool>;

    /// Delete a Lease; a missing one is not an error
    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterClient`] over a kube client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the ambient kubeconfig or in-cluster environment
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// Client from kubeconfig contents, using `context` or the current one
    pub async fn from_kubeconfig(kubeconfig: &str, context: Option<&str>) -> Result<Self> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::validation_for_field("kubeconfig", e.to_string()))?;
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::validation_for_field("kubeconfig", e.to_string()))?;
        Ok(Self::new(Client::try_from(config)?))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn node_groups(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &node_group_resource())
    }

    fn node_users(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &node_user_resource())
    }
}

fn object_name(metadata: &ObjectMeta, what: &str) -> Result<String> {
    metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation(format!("{what} has no name")))
}

fn dynamic_object(manifest: &Value, what: &str) -> Result<DynamicObject> {
    serde_json::from_value(manifest.clone())
        .map_err(|e| Error::serialization_for_kind(what, format!("invalid manifest: {e}")))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn create_or_update_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(dhctl_common::D8_SYSTEM_NAMESPACE);
        let name = object_name(&secret.metadata, "secret")?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(secret = %name, "Secret exists, updating");
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(secret))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let data: BTreeMap<String, ByteString> = data
            .into_iter()
            .map(|(k, v)| (k, ByteString(v)))
            .collect();
        let patch = serde_json::json!({ "data": data });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_or_update_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(dhctl_common::KUBE_SYSTEM_NAMESPACE);
        let name = object_name(&config_map.metadata, "config map")?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), config_map).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(config_map))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn get_node_group(&self, name: &str) -> Result<Option<DynamicObject>> {
        match self.node_groups().get(name).await {
            Ok(ng) => Ok(Some(ng)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_node_groups(&self) -> Result<Vec<DynamicObject>> {
        Ok(self.node_groups().list(&ListParams::default()).await?.items)
    }

    async fn create_node_group(&self, manifest: &Value) -> Result<()> {
        let obj = dynamic_object(manifest, "NodeGroup")?;
        match self.node_groups().create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(node_group = ?obj.metadata.name, "NodeGroup already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_node_group(&self, node_group: &DynamicObject) -> Result<()> {
        let name = object_name(&node_group.metadata, "NodeGroup")?;
        match self
            .node_groups()
            .replace(&name, &PostParams::default(), node_group)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::NodeGroupChanged { node_group: name })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node_group(&self, name: &str) -> Result<()> {
        match self.node_groups().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_or_update_node_user(&self, manifest: &Value) -> Result<()> {
        let obj = dynamic_object(manifest, "NodeUser")?;
        let name = object_name(&obj.metadata, "NodeUser")?;
        let api = self.node_users();
        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(manifest))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node_user(&self, name: &str) -> Result<()> {
        match self.node_users().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, lease: &Lease) -> Result<bool> {
        let namespace = lease
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(dhctl_common::D8_SYSTEM_NAMESPACE);
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<bool> {
        let namespace = lease
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(dhctl_common::D8_SYSTEM_NAMESPACE);
        let name = object_name(&lease.metadata, "lease")?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.replace(&name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Data of a Secret key, decoded
pub fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.clone())
}

/// `spec.nodeTemplate` of a NodeGroup
pub fn node_group_template(node_group: &DynamicObject) -> Option<&Value> {
    node_group
        .data
        .get("spec")
        .and_then(|spec| spec.get("nodeTemplate"))
        .filter(|template| !template.is_null())
}

/// Whether the Node reports `Ready=True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Whether the Pod is running with all containers ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}
