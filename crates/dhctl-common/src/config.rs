//! Cluster configuration (MetaConfig)
//!
//! The operator supplies multi-document YAML: a `ClusterConfiguration`, a
//! `<Provider>ClusterConfiguration` for cloud clusters and a
//! `StaticClusterConfiguration` for static ones. Documents are kept as JSON
//! trees (they are handed to the infrastructure tool verbatim) and the fields
//! dhctl itself needs are normalised into [`MetaConfig`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::cache::{StateCache, StateCacheExt};
use crate::{Error, Result, MASTER_NODE_GROUP_NAME};

/// Cache key of the generated cluster UUID
pub const UUID_CACHE_KEY: &str = "uuid";

/// Kind of the main configuration document
pub const CLUSTER_CONFIGURATION_KIND: &str = "ClusterConfiguration";
/// Kind of the static cluster document
pub const STATIC_CLUSTER_CONFIGURATION_KIND: &str = "StaticClusterConfiguration";
/// Kind of the init configuration document
pub const INIT_CONFIGURATION_KIND: &str = "InitConfiguration";

/// Cluster type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClusterType {
    /// Nodes ordered from a cloud provider
    #[default]
    Cloud,
    /// Pre-provisioned nodes
    Static,
}

/// Master node group spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MasterNodeGroupSpec {
    /// Number of masters
    #[serde(default)]
    pub replicas: u32,
    /// Provider specific instance class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_class: Option<Value>,
}

/// Cloud permanent node group spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TerraNodeGroupSpec {
    /// Node group name
    pub name: String,
    /// Number of nodes
    #[serde(default)]
    pub replicas: u32,
    /// Labels, annotations and taints applied to the nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_template: Option<Value>,
    /// Provider specific instance class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_class: Option<Value>,
}

/// Parsed, normalised desired state of the cluster
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaConfig {
    /// Cloud or static
    pub cluster_type: ClusterType,
    /// Provider layout in kebab case (e.g. `with-nat`)
    pub layout: String,
    /// Lowercase provider name
    pub provider_name: String,
    /// Provider name as written by the operator
    pub original_provider_name: String,
    /// Prefix of every cloud resource and node name
    pub cluster_prefix: String,
    /// Master node group
    pub master_node_group: MasterNodeGroupSpec,
    /// Cloud permanent node groups in declared order
    pub terra_node_groups: Vec<TerraNodeGroupSpec>,
    /// `ClusterConfiguration` document
    pub cluster_config: Map<String, Value>,
    /// `<Provider>ClusterConfiguration` document
    pub provider_cluster_config: Map<String, Value>,
    /// `StaticClusterConfiguration` document
    pub static_cluster_config: Map<String, Value>,
    /// `InitConfiguration` document
    pub init_config: Map<String, Value>,
    /// Cluster UUID (empty until generated or loaded)
    pub uuid: String,
    /// Timeout applied by the infrastructure tool to resource operations
    pub resource_management_timeout: Option<String>,
}

/// Split multi-document YAML into JSON trees, skipping empty documents
pub fn parse_documents(data: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// `kind` of a document, validating `apiVersion` is present
pub fn document_kind(doc: &Value) -> Result<&str> {
    let obj = doc
        .as_object()
        .ok_or_else(|| Error::validation("document must be a mapping"))?;
    if !obj.get("apiVersion").is_some_and(Value::is_string) {
        return Err(Error::validation_for_field("apiVersion", "apiVersion is required"));
    }
    obj.get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation_for_field("kind", "kind is required"))
}

fn into_map(doc: Value) -> Map<String, Value> {
    match doc {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Convert a CamelCase name into kebab case (`WithNAT` -> `with-nat`)
pub fn to_kebab(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' || c == '-' {
            if !out.ends_with('-') && !out.is_empty() {
                out.push('-');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 && !out.ends_with('-') {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

fn field<T: serde::de::DeserializeOwned>(
    map: &Map<String, Value>,
    key: &str,
    doc: &str,
) -> Result<T> {
    let value = map
        .get(key)
        .cloned()
        .ok_or_else(|| Error::validation_for_field(format!("{doc}.{key}"), "field is required"))?;
    serde_json::from_value(value)
        .map_err(|e| Error::validation_for_field(format!("{doc}.{key}"), e.to_string()))
}

impl MetaConfig {
    /// Parse multi-document YAML and normalise it
    pub fn parse(data: &str) -> Result<Self> {
        let mut config = MetaConfig::default();
        for doc in parse_documents(data)? {
            let kind = document_kind(&doc)?.to_string();
            match kind.as_str() {
                CLUSTER_CONFIGURATION_KIND => config.cluster_config = into_map(doc),
                STATIC_CLUSTER_CONFIGURATION_KIND => config.static_cluster_config = into_map(doc),
                INIT_CONFIGURATION_KIND => config.init_config = into_map(doc),
                k if k.ends_with(CLUSTER_CONFIGURATION_KIND) => {
                    config.provider_cluster_config = into_map(doc)
                }
                // resources and module configs are applied by other components
                _ => {}
            }
        }
        config.prepare()?;
        Ok(config)
    }

    /// Build from the documents stored in the cluster's configuration Secrets
    pub fn from_documents(
        cluster_config_yaml: &str,
        provider_cluster_config_yaml: Option<&str>,
        static_cluster_config_yaml: Option<&str>,
    ) -> Result<Self> {
        let mut data = cluster_config_yaml.to_string();
        for extra in [provider_cluster_config_yaml, static_cluster_config_yaml]
            .into_iter()
            .flatten()
        {
            data.push_str("\n---\n");
            data.push_str(extra);
        }
        Self::parse(&data)
    }

    /// Derive the normalised fields from the raw documents
    pub fn prepare(&mut self) -> Result<()> {
        if self.cluster_config.is_empty() {
            return Err(Error::validation("ClusterConfiguration document is required"));
        }

        let cluster_type: String = field(
            &self.cluster_config,
            "clusterType",
            "ClusterConfiguration",
        )?;
        self.cluster_type = match cluster_type.as_str() {
            "Cloud" => ClusterType::Cloud,
            "Static" => ClusterType::Static,
            other => {
                return Err(Error::validation_for_field(
                    "ClusterConfiguration.clusterType",
                    format!("unknown cluster type {other}"),
                ))
            }
        };

        if self.cluster_type != ClusterType::Cloud || self.provider_cluster_config.is_empty() {
            return Ok(());
        }

        let layout: String = field(
            &self.provider_cluster_config,
            "layout",
            "ProviderClusterConfiguration",
        )?;
        self.layout = to_kebab(&layout);

        let cloud: Map<String, Value> = field(
            &self.cluster_config,
            "cloud",
            "ClusterConfiguration",
        )?;
        let provider: String = field(&cloud, "provider", "ClusterConfiguration.cloud")?;
        self.original_provider_name = provider.clone();
        self.provider_name = provider.to_lowercase();
        self.cluster_prefix = cloud
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.master_node_group = field(
            &self.provider_cluster_config,
            "masterNodeGroup",
            "ProviderClusterConfiguration",
        )?;
        self.terra_node_groups = match self.provider_cluster_config.get("nodeGroups") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone()).map_err(|e| {
                Error::validation_for_field(
                    "ProviderClusterConfiguration.nodeGroups",
                    e.to_string(),
                )
            })?,
            _ => Vec::new(),
        };
        Ok(())
    }

    /// Check invariants dhctl relies on
    pub fn validate(&self) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }
        if self.provider_cluster_config.is_empty() {
            return Err(Error::validation(
                "cloud cluster requires a provider cluster configuration document",
            ));
        }
        if self.cluster_prefix.is_empty() {
            return Err(Error::validation_for_field(
                "ClusterConfiguration.cloud.prefix",
                "prefix is required for cloud clusters",
            ));
        }
        if self.master_node_group.replicas == 0 {
            return Err(Error::validation_for_field(
                "masterNodeGroup.replicas",
                "master replicas must be greater than 0 for cloud clusters",
            ));
        }
        let mut seen = HashSet::new();
        for group in &self.terra_node_groups {
            if group.name == MASTER_NODE_GROUP_NAME {
                return Err(Error::validation_for_field(
                    "nodeGroups.name",
                    "node group name master is reserved",
                ));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(Error::validation_for_field(
                    "nodeGroups.name",
                    format!("duplicate node group {}", group.name),
                ));
            }
        }
        Ok(())
    }

    /// Static cluster
    pub fn is_static(&self) -> bool {
        self.cluster_type == ClusterType::Static
    }

    /// Node name for a group slot: `<prefix>-<group>-<index>`
    pub fn node_name(&self, group: &str, index: u32) -> String {
        format!("{}-{}-{}", self.cluster_prefix, group, index)
    }

    /// Desired replicas of a node group (0 when unknown)
    pub fn replicas_for(&self, node_group: &str) -> u32 {
        if node_group == MASTER_NODE_GROUP_NAME {
            return self.master_node_group.replicas;
        }
        self.terra_node_groups
            .iter()
            .find(|g| g.name == node_group)
            .map(|g| g.replicas)
            .unwrap_or(0)
    }

    /// Spec of a cloud permanent group
    pub fn terra_node_group(&self, name: &str) -> Option<&TerraNodeGroupSpec> {
        self.terra_node_groups.iter().find(|g| g.name == name)
    }

    /// Raw `nodeGroups` entry as written in the provider document
    pub fn find_terra_node_group(&self, name: &str) -> Option<Value> {
        self.provider_cluster_config
            .get("nodeGroups")?
            .as_array()?
            .iter()
            .find(|g| g.get("name").and_then(Value::as_str) == Some(name))
            .cloned()
    }

    /// A copy with the given settings as the `nodeGroups` entry of `name`.
    ///
    /// Used to rebuild the configuration a node was created with when the
    /// group no longer exists in the desired config.
    pub fn with_node_group_settings(&self, name: &str, settings: &[u8]) -> Result<Self> {
        if settings.is_empty() {
            return Ok(self.clone());
        }
        let entry: Value = serde_json::from_slice(settings)?;
        let mut next = self.clone();
        let groups = next
            .provider_cluster_config
            .entry("nodeGroups")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !groups.is_array() {
            *groups = Value::Array(Vec::new());
        }
        if let Value::Array(items) = groups {
            match items
                .iter_mut()
                .find(|g| g.get("name").and_then(Value::as_str) == Some(name))
            {
                Some(existing) => *existing = entry,
                None => items.push(entry),
            }
        }
        next.prepare()?;
        Ok(next)
    }

    /// Variables for an infrastructure step of the whole cluster
    pub fn marshal_config(&self) -> Result<Vec<u8>> {
        let mut out = Map::new();
        out.insert("clusterConfiguration".into(), Value::Object(self.cluster_config.clone()));
        if !self.provider_cluster_config.is_empty() {
            out.insert(
                "providerClusterConfiguration".into(),
                Value::Object(self.provider_cluster_config.clone()),
            );
        }
        if !self.uuid.is_empty() {
            out.insert("clusterUUID".into(), Value::String(self.uuid.clone()));
        }
        if let Some(timeout) = &self.resource_management_timeout {
            out.insert("resourceManagementTimeout".into(), Value::String(timeout.clone()));
        }
        Ok(serde_json::to_vec(&out)?)
    }

    /// Variables for ordering one node of a group
    pub fn node_group_config(
        &self,
        node_group: &str,
        node_index: u32,
        cloud_config: &str,
    ) -> Result<Vec<u8>> {
        let mut out = Map::new();
        out.insert("clusterConfiguration".into(), Value::Object(self.cluster_config.clone()));
        out.insert(
            "providerClusterConfiguration".into(),
            Value::Object(self.provider_cluster_config.clone()),
        );
        out.insert("nodeIndex".into(), json!(node_index));
        out.insert("cloudConfig".into(), Value::String(cloud_config.to_string()));
        if node_group != MASTER_NODE_GROUP_NAME {
            out.insert("nodeGroupName".into(), Value::String(node_group.to_string()));
        }
        if !self.uuid.is_empty() {
            out.insert("clusterUUID".into(), Value::String(self.uuid.clone()));
        }
        if let Some(timeout) = &self.resource_management_timeout {
            out.insert("resourceManagementTimeout".into(), Value::String(timeout.clone()));
        }
        Ok(serde_json::to_vec(&out)?)
    }

    /// `NodeGroup` custom resource for a cloud permanent group
    pub fn node_group_manifest(&self, group: &TerraNodeGroupSpec) -> Value {
        json!({
            "apiVersion": "deckhouse.io/v1",
            "kind": "NodeGroup",
            "metadata": { "name": group.name },
            "spec": {
                "nodeType": "CloudPermanent",
                "disruptions": { "approvalMode": "Manual" },
                "nodeTemplate": group.node_template.clone().unwrap_or_else(|| json!({})),
            },
        })
    }

    /// `ClusterConfiguration` rendered as YAML
    pub fn cluster_config_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.cluster_config)?)
    }

    /// Provider document rendered as YAML (empty when absent)
    pub fn provider_cluster_config_yaml(&self) -> Result<String> {
        if self.provider_cluster_config.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_yaml::to_string(&self.provider_cluster_config)?)
    }

    /// Static document rendered as YAML (empty when absent)
    pub fn static_cluster_config_yaml(&self) -> Result<String> {
        if self.static_cluster_config.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_yaml::to_string(&self.static_cluster_config)?)
    }

    /// Make sure the UUID is set and recorded in the cache.
    ///
    /// A UUID already in the cache wins: it is never regenerated.
    pub fn ensure_uuid(&mut self, cache: &dyn StateCache) -> Result<&str> {
        if let Some(cached) = cache.load_struct::<String>(UUID_CACHE_KEY)? {
            self.uuid = cached;
            return Ok(&self.uuid);
        }
        if self.uuid.is_empty() {
            self.uuid = uuid::Uuid::new_v4().to_string();
        }
        cache.save_struct(UUID_CACHE_KEY, &self.uuid)?;
        Ok(&self.uuid)
    }
}

/// Index suffix of a node name (`prefix-group-3` -> 3)
pub fn node_index(name: &str) -> Result<u32> {
    let suffix = name.rsplit('-').next().unwrap_or(name);
    suffix
        .parse()
        .map_err(|_| Error::validation(format!("can't extract index from node name {name}")))
}

/// Node names sorted by integer index suffix, highest first
pub fn sort_node_names_desc<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
    sorted.sort_by(|a, b| {
        let ia = node_index(a).ok();
        let ib = node_index(b).ok();
        ib.cmp(&ia).then_with(|| b.cmp(a))
    });
    sorted
}
