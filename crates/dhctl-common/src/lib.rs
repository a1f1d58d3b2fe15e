//! Common types for dhctl: errors, retries, the state cache and cluster configuration

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod confirm;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod tomb;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding dhctl-owned Secrets and the converge lease
pub const D8_SYSTEM_NAMESPACE: &str = "d8-system";

/// Namespace holding cluster-wide configuration objects
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Namespace of the node manager (bootstrap cloud-config Secrets)
pub const CLOUD_INSTANCE_MANAGER_NAMESPACE: &str = "d8-cloud-instance-manager";

/// Name of the control plane node group
pub const MASTER_NODE_GROUP_NAME: &str = "master";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "dhctl";

/// Default root for temporary files, caches and sockets
pub const DEFAULT_TMP_DIR: &str = "/tmp/dhctl";

/// Secrets and keys persisted in the cluster
pub mod secrets {
    /// Base-infrastructure state Secret
    pub const CLUSTER_STATE: &str = "d8-cluster-terraform-state";
    /// Key of the base-infrastructure state inside its Secret
    pub const CLUSTER_STATE_KEY: &str = "cluster-tf-state.json";

    /// Prefix of the per-node state Secrets
    pub const NODE_STATE_PREFIX: &str = "d8-node-terraform-state-";
    /// Key of the node state inside its Secret
    pub const NODE_STATE_KEY: &str = "node-tf-state.json";
    /// Key of the node-group settings inside a node state Secret
    pub const NODE_GROUP_SETTINGS_KEY: &str = "node-group-settings.json";

    /// Label marking node state Secrets
    pub const LABEL_TERRAFORM_STATE: &str = "node.deckhouse.io/terraform-state";
    /// Label carrying the node name
    pub const LABEL_NODE_NAME: &str = "node.deckhouse.io/node-name";
    /// Label carrying the node group name
    pub const LABEL_NODE_GROUP: &str = "node.deckhouse.io/node-group";

    /// Per-master kubernetes data device paths
    pub const MASTERS_DEVICE_PATH: &str = "d8-masters-kubernetes-data-device-path";

    /// Converge protocol state
    pub const CONVERGE_STATE: &str = "d8-dhctl-converge-state";
    /// Key of the converge state inside its Secret
    pub const CONVERGE_STATE_KEY: &str = "state.json";

    /// Cluster configuration Secret
    pub const CLUSTER_CONFIGURATION: &str = "d8-cluster-configuration";
    /// Key of the cluster configuration document
    pub const CLUSTER_CONFIGURATION_KEY: &str = "cluster-configuration.yaml";

    /// Provider cluster configuration Secret
    pub const PROVIDER_CLUSTER_CONFIGURATION: &str = "d8-provider-cluster-configuration";
    /// Key of the provider cluster configuration document
    pub const PROVIDER_CLUSTER_CONFIGURATION_KEY: &str =
        "cloud-provider-cluster-configuration.yaml";
    /// Key of the provider discovery data
    pub const PROVIDER_DISCOVERY_DATA_KEY: &str = "cloud-provider-discovery-data.json";

    /// Static cluster configuration Secret
    pub const STATIC_CLUSTER_CONFIGURATION: &str = "d8-static-cluster-configuration";
    /// Key of the static cluster configuration document
    pub const STATIC_CLUSTER_CONFIGURATION_KEY: &str = "static-cluster-configuration.yaml";

    /// ConfigMap with the cluster UUID
    pub const CLUSTER_UUID_CONFIG_MAP: &str = "d8-cluster-uuid";
    /// Key of the cluster UUID
    pub const CLUSTER_UUID_KEY: &str = "cluster-uuid";
}
