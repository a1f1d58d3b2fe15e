//! Outputs extracted after an apply

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dhctl_common::{Error, Result};

use crate::runner::Runner;

pub const CLOUD_DISCOVERY_DATA: &str = "cloud_discovery_data";
pub const BASTION_IP_FOR_SSH: &str = "bastion_ip_address_for_ssh";
pub const MASTER_IP_FOR_SSH: &str = "master_ip_address_for_ssh";
pub const NODE_INTERNAL_IP: &str = "node_internal_ip_address";
pub const KUBE_DATA_DEVICE_PATH: &str = "kubernetes_data_device_path";

/// Result of an apply; only the fields of the step are populated
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutputs {
    /// Authoritative state after the apply
    #[serde(with = "state_bytes")]
    pub infrastructure_state: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_discovery: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_ip_for_ssh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_internal_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_data_device_path: Option<String>,
}

mod state_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(state: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(state))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(d).map(String::into_bytes)
    }
}

/// Collects the outputs of one step from an applied runner
#[async_trait]
pub trait OutputsExtractor: Send + Sync {
    async fn extract(&self, runner: &Runner) -> Result<PipelineOutputs>;
}

/// State only; used for worker nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct OnlyState;

/// State, discovery data and optional bastion address
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseInfraOutputs;

/// State, addresses and the kubernetes data device of a master
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterNodeOutputs;

#[async_trait]
impl OutputsExtractor for OnlyState {
    async fn extract(&self, runner: &Runner) -> Result<PipelineOutputs> {
        Ok(PipelineOutputs {
            infrastructure_state: runner.state()?,
            ..Default::default()
        })
    }
}

#[async_trait]
impl OutputsExtractor for BaseInfraOutputs {
    async fn extract(&self, runner: &Runner) -> Result<PipelineOutputs> {
        let discovery = runner.output(CLOUD_DISCOVERY_DATA).await?;
        let cloud_discovery = serde_json::from_slice(&discovery)
            .map_err(|e| Error::serialization_for_kind("cloud discovery data", e.to_string()))?;

        // layouts without a bastion have no such output
        let bastion_host = match runner.output(BASTION_IP_FOR_SSH).await {
            Ok(raw) => string_output(BASTION_IP_FOR_SSH, &raw)?.filter(|host| !host.is_empty()),
            Err(e) => {
                tracing::debug!(error = %e, "No bastion output");
                None
            }
        };

        Ok(PipelineOutputs {
            infrastructure_state: runner.state()?,
            cloud_discovery: Some(cloud_discovery),
            bastion_host,
            ..Default::default()
        })
    }
}

#[async_trait]
impl OutputsExtractor for MasterNodeOutputs {
    async fn extract(&self, runner: &Runner) -> Result<PipelineOutputs> {
        let master_ip_for_ssh = string_output(
            MASTER_IP_FOR_SSH,
            &runner.output(MASTER_IP_FOR_SSH).await?,
        )?;
        let node_internal_ip = string_output(
            NODE_INTERNAL_IP,
            &runner.output(NODE_INTERNAL_IP).await?,
        )?;
        let kube_data_device_path =
            string_output(KUBE_DATA_DEVICE_PATH, &runner.output(KUBE_DATA_DEVICE_PATH).await?)?;

        Ok(PipelineOutputs {
            infrastructure_state: runner.state()?,
            master_ip_for_ssh,
            node_internal_ip,
            kube_data_device_path,
            ..Default::default()
        })
    }
}

/// Decode a raw output that is a JSON string; `null` yields `None`
pub fn string_output(name: &str, raw: &[u8]) -> Result<Option<String>> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::String(s)) => Ok(Some(s)),
        Ok(Value::Null) => Ok(None),
        Ok(other) => Err(Error::serialization_for_kind(
            name,
            format!("expected a string output, got {other}"),
        )),
        Err(e) => Err(Error::serialization_for_kind(name, e.to_string())),
    }
}

/// IP of a master recorded in its state file
pub fn master_ip_from_state(state: &[u8]) -> Option<String> {
    let state: Value = serde_json::from_slice(state).ok()?;
    state
        .pointer(&format!("/outputs/{MASTER_IP_FOR_SSH}/value"))
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Value of an output recorded in a state file
pub fn state_output(state: &[u8], name: &str) -> Option<Value> {
    let state: Value = serde_json::from_slice(state).ok()?;
    state
        .pointer(&format!("/outputs/{name}/value"))
        .filter(|v| !v.is_null())
        .cloned()
}
