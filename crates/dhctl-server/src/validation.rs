//! Structural validation of configuration documents
//!
//! Every check returns the full list of field errors instead of stopping at
//! the first one. Fields are prefixed with the document index, e.g.
//! `1.masterNodeGroup.replicas`.

use serde_json::{json, Map, Value};
use tonic::{Request, Response, Status};
use tracing::debug;

use dhctl_common::config::{
    document_kind, parse_documents, MetaConfig, CLUSTER_CONFIGURATION_KIND, INIT_CONFIGURATION_KIND,
    STATIC_CLUSTER_CONFIGURATION_KIND,
};
use dhctl_common::{Error, MASTER_NODE_GROUP_NAME};
use dhctl_proto::validation_server::Validation;
use dhctl_proto::{
    FieldError, ParseConnectionConfigRequest, ParseConnectionConfigResponse, ValidateChangesRequest,
    ValidateChangesResponse, ValidateClusterConfigRequest, ValidateClusterConfigResponse,
    ValidateInitConfigRequest, ValidateInitConfigResponse,
    ValidateProviderSpecificClusterConfigRequest, ValidateProviderSpecificClusterConfigResponse,
    ValidateResourcesRequest, ValidateResourcesResponse, ValidateStaticClusterConfigRequest,
    ValidateStaticClusterConfigResponse, ValidationResult,
};

const SSH_CONFIG_KIND: &str = "SSHConfig";
const SSH_HOST_KIND: &str = "SSHHost";

/// `ClusterConfiguration` fields that cannot change on a running cluster
const IMMUTABLE_CLUSTER_FIELDS: &[&str] = &[
    "clusterType",
    "cloud.provider",
    "cloud.prefix",
    "podSubnetCIDR",
    "serviceSubnetCIDR",
    "clusterDomain",
];

fn field_error(field: impl Into<String>, message: impl Into<String>) -> FieldError {
    FieldError {
        field: field.into(),
        message: message.into(),
    }
}

fn prefixed(prefix: &str, field: &str) -> String {
    match (prefix.is_empty(), field.is_empty()) {
        (true, _) => field.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}.{field}"),
    }
}

/// Flatten an error into field errors
pub fn field_errors(prefix: &str, err: Error) -> Vec<FieldError> {
    match err {
        Error::Validation { message, field } => {
            vec![field_error(prefixed(prefix, field.as_deref().unwrap_or_default()), message)]
        }
        Error::Multiple(errors) => errors
            .into_iter()
            .flat_map(|e| field_errors(prefix, e))
            .collect(),
        other => vec![field_error(prefix, other.to_string())],
    }
}

fn result(errors: Vec<FieldError>) -> ValidationResult {
    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}

fn documents(config: &str) -> Result<Vec<Value>, Vec<FieldError>> {
    let docs = parse_documents(config).map_err(|e| field_errors("", e))?;
    if docs.is_empty() {
        return Err(vec![field_error("", "no documents found")]);
    }
    Ok(docs)
}

/// Documents whose kind satisfies `expected`; every other document is an error
fn documents_of_kind(
    config: &str,
    expected: impl Fn(&str) -> bool,
    kind_name: &str,
) -> Result<Vec<(usize, Value)>, Vec<FieldError>> {
    let docs = documents(config)?;
    let mut errors = Vec::new();
    let mut matched = Vec::new();
    for (index, doc) in docs.into_iter().enumerate() {
        let prefix = index.to_string();
        match document_kind(&doc) {
            Ok(kind) if expected(kind) => matched.push((index, doc)),
            Ok(kind) => errors.push(field_error(
                prefixed(&prefix, "kind"),
                format!("expected {kind_name}, got {kind}"),
            )),
            Err(e) => errors.extend(field_errors(&prefix, e)),
        }
    }
    if errors.is_empty() {
        Ok(matched)
    } else {
        Err(errors)
    }
}

/// Every document is a resource with `apiVersion`, `kind` and `metadata.name`
pub fn validate_resources(config: &str) -> Vec<FieldError> {
    let docs = match documents(config) {
        Ok(docs) => docs,
        Err(errors) => return errors,
    };
    let mut errors = Vec::new();
    for (index, doc) in docs.iter().enumerate() {
        let prefix = index.to_string();
        if let Err(e) = document_kind(doc) {
            errors.extend(field_errors(&prefix, e));
            continue;
        }
        let named = lookup(doc, "metadata.name")
            .is_some_and(|name| name.as_str().is_some_and(|s| !s.is_empty()));
        if !named {
            errors.push(
                field_error(prefixed(&prefix, "metadata.name"), "metadata.name is required"),
            );
        }
    }
    errors
}

pub fn validate_init_config(config: &str) -> Vec<FieldError> {
    match documents_of_kind(config, |k| k == INIT_CONFIGURATION_KIND, INIT_CONFIGURATION_KIND) {
        Ok(_) => Vec::new(),
        Err(errors) => errors,
    }
}

/// A single `ClusterConfiguration` normalising into a MetaConfig
pub fn validate_cluster_config(config: &str) -> Vec<FieldError> {
    let docs = match documents_of_kind(
        config,
        |k| k == CLUSTER_CONFIGURATION_KIND,
        CLUSTER_CONFIGURATION_KIND,
    ) {
        Ok(docs) => docs,
        Err(errors) => return errors,
    };
    if docs.len() > 1 {
        return vec![field_error("", "only one ClusterConfiguration document is allowed")];
    }
    match MetaConfig::parse(config) {
        Ok(_) => Vec::new(),
        Err(e) => field_errors("0", e),
    }
}

pub fn validate_static_cluster_config(config: &str) -> Vec<FieldError> {
    match documents_of_kind(
        config,
        |k| k == STATIC_CLUSTER_CONFIGURATION_KIND,
        STATIC_CLUSTER_CONFIGURATION_KIND,
    ) {
        Ok(_) => Vec::new(),
        Err(errors) => errors,
    }
}

fn validate_provider_document(prefix: &str, doc: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if !doc.get("layout").is_some_and(Value::is_string) {
        errors.push(field_error(prefixed(prefix, "layout"), "layout is required"));
    }
    match lookup(doc, "masterNodeGroup.replicas").and_then(Value::as_u64) {
        Some(0) => errors.push(field_error(
            prefixed(prefix, "masterNodeGroup.replicas"),
            "master replicas must be greater than 0",
        )),
        Some(_) => {}
        None => errors.push(field_error(
            prefixed(prefix, "masterNodeGroup.replicas"),
            "masterNodeGroup.replicas is required",
        )),
    }

    let groups = doc.get("nodeGroups").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut seen = std::collections::HashSet::new();
    for (i, group) in groups.iter().enumerate() {
        let field = prefixed(prefix, &format!("nodeGroups.{i}.name"));
        match group.get("name").and_then(Value::as_str) {
            None => errors.push(field_error(field, "name is required")),
            Some(MASTER_NODE_GROUP_NAME) => {
                errors.push(field_error(field, "node group name master is reserved"))
            }
            Some(name) if !seen.insert(name.to_string()) => {
                errors.push(field_error(field, format!("duplicate node group {name}")))
            }
            Some(_) => {}
        }
    }
    errors
}

/// `<Provider>ClusterConfiguration` of the named provider
pub fn validate_provider_specific_cluster_config(config: &str, provider: &str) -> Vec<FieldError> {
    let expected = format!("{provider}{CLUSTER_CONFIGURATION_KIND}");
    let docs = match documents_of_kind(config, |k| k.eq_ignore_ascii_case(&expected), &expected) {
        Ok(docs) => docs,
        Err(errors) => return errors,
    };
    docs.iter()
        .flat_map(|(index, doc)| validate_provider_document(&index.to_string(), doc))
        .collect()
}

fn find_kind(docs: &[Value], matches: impl Fn(&str) -> bool) -> Option<&Value> {
    docs.iter()
        .find(|doc| document_kind(doc).is_ok_and(|kind| matches(kind)))
}

fn is_provider_kind(kind: &str) -> bool {
    kind != CLUSTER_CONFIGURATION_KIND
        && kind != STATIC_CLUSTER_CONFIGURATION_KIND
        && kind.ends_with(CLUSTER_CONFIGURATION_KIND)
}

/// Changes of a running cluster's configuration that cannot be converged
pub fn validate_changes(old_config: &str, new_config: &str) -> Vec<FieldError> {
    let old = match documents(old_config) {
        Ok(docs) => docs,
        Err(errors) => return errors.into_iter().map(|e| prefix_error("old", e)).collect(),
    };
    let new = match documents(new_config) {
        Ok(docs) => docs,
        Err(errors) => return errors.into_iter().map(|e| prefix_error("new", e)).collect(),
    };

    let mut errors = Vec::new();
    let old_cluster = find_kind(&old, |k| k == CLUSTER_CONFIGURATION_KIND);
    let new_cluster = find_kind(&new, |k| k == CLUSTER_CONFIGURATION_KIND);
    match (old_cluster, new_cluster) {
        (Some(old_cluster), Some(new_cluster)) => {
            for field in IMMUTABLE_CLUSTER_FIELDS {
                let before = lookup(old_cluster, field);
                if before.is_some() && before != lookup(new_cluster, field) {
                    errors.push(field_error(
                        format!("{CLUSTER_CONFIGURATION_KIND}.{field}"),
                        "field is immutable",
                    ));
                }
            }
        }
        (Some(_), None) => errors.push(field_error(
            CLUSTER_CONFIGURATION_KIND,
            "ClusterConfiguration document cannot be removed",
        )),
        _ => {}
    }

    if let (Some(old_provider), Some(new_provider)) =
        (find_kind(&old, is_provider_kind), find_kind(&new, is_provider_kind))
    {
        let kind = document_kind(new_provider).unwrap_or_default().to_string();
        if document_kind(old_provider).ok() != Some(kind.as_str()) {
            errors.push(field_error(format!("{kind}.kind"), "provider cannot change"));
        } else {
            if old_provider.get("layout") != new_provider.get("layout") {
                errors.push(field_error(format!("{kind}.layout"), "field is immutable"));
            }
            if lookup(new_provider, "masterNodeGroup.replicas").and_then(Value::as_u64) == Some(0) {
                errors.push(field_error(
                    format!("{kind}.masterNodeGroup.replicas"),
                    Error::CannotDeleteAllMasters.to_string(),
                ));
            }
        }
    }
    errors
}

fn prefix_error(prefix: &str, err: FieldError) -> FieldError {
    field_error(prefixed(prefix, &err.field), err.message)
}

/// `SSHConfig` plus `SSHHost` documents, returned as one JSON document
pub fn parse_connection_config(config: &str) -> Result<Value, Vec<FieldError>> {
    let docs = documents_of_kind(
        config,
        |k| k == SSH_CONFIG_KIND || k == SSH_HOST_KIND,
        &format!("{SSH_CONFIG_KIND} or {SSH_HOST_KIND}"),
    )?;

    let mut errors = Vec::new();
    let mut ssh_config: Option<Map<String, Value>> = None;
    let mut hosts = Vec::new();
    for (index, doc) in docs {
        let prefix = index.to_string();
        let Value::Object(mut map) = doc else {
            continue;
        };
        if map.get("kind").and_then(Value::as_str) == Some(SSH_CONFIG_KIND) {
            if !map.get("sshUser").is_some_and(|u| u.as_str().is_some_and(|s| !s.is_empty())) {
                errors.push(field_error(prefixed(&prefix, "sshUser"), "sshUser is required"));
            }
            if map.get("sshPort").is_some_and(|p| !p.is_u64()) {
                errors.push(field_error(prefixed(&prefix, "sshPort"), "sshPort must be a number"));
            }
            if ssh_config.is_some() {
                errors.push(
                    field_error(prefixed(&prefix, "kind"), "only one SSHConfig is allowed"),
                );
            }
            map.remove("apiVersion");
            map.remove("kind");
            ssh_config = Some(map);
        } else {
            match map.get("host").and_then(Value::as_str) {
                Some(host) if !host.is_empty() => hosts.push(Value::String(host.to_string())),
                _ => errors.push(field_error(prefixed(&prefix, "host"), "host is required")),
            }
        }
    }
    if ssh_config.is_none() {
        errors.push(field_error("", "SSHConfig document is required"));
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(json!({ "config": ssh_config, "hosts": hosts }))
}

/// Validation service; not subject to the limiter
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationService;

#[tonic::async_trait]
impl Validation for ValidationService {
    async fn validate_resources(
        &self,
        request: Request<ValidateResourcesRequest>,
    ) -> Result<Response<ValidateResourcesResponse>, Status> {
        let errors = validate_resources(&request.into_inner().config);
        Ok(Response::new(ValidateResourcesResponse {
            result: Some(result(errors)),
        }))
    }

    async fn validate_init_config(
        &self,
        request: Request<ValidateInitConfigRequest>,
    ) -> Result<Response<ValidateInitConfigResponse>, Status> {
        let errors = validate_init_config(&request.into_inner().config);
        Ok(Response::new(ValidateInitConfigResponse {
            result: Some(result(errors)),
        }))
    }

    async fn validate_cluster_config(
        &self,
        request: Request<ValidateClusterConfigRequest>,
    ) -> Result<Response<ValidateClusterConfigResponse>, Status> {
        let errors = validate_cluster_config(&request.into_inner().config);
        debug!(errors = errors.len(), "Cluster configuration validated");
        Ok(Response::new(ValidateClusterConfigResponse {
            result: Some(result(errors)),
        }))
    }

    async fn validate_static_cluster_config(
        &self,
        request: Request<ValidateStaticClusterConfigRequest>,
    ) -> Result<Response<ValidateStaticClusterConfigResponse>, Status> {
        let errors = validate_static_cluster_config(&request.into_inner().config);
        Ok(Response::new(ValidateStaticClusterConfigResponse {
            result: Some(result(errors)),
        }))
    }

    async fn validate_provider_specific_cluster_config(
        &self,
        request: Request<ValidateProviderSpecificClusterConfigRequest>,
    ) -> Result<Response<ValidateProviderSpecificClusterConfigResponse>, Status> {
        let request = request.into_inner();
        let errors = validate_provider_specific_cluster_config(&request.config, &request.provider);
        Ok(Response::new(ValidateProviderSpecificClusterConfigResponse {
            result: Some(result(errors)),
        }))
    }

    async fn validate_changes(
        &self,
        request: Request<ValidateChangesRequest>,
    ) -> Result<Response<ValidateChangesResponse>, Status> {
        let request = request.into_inner();
        let errors = validate_changes(&request.old_config, &request.new_config);
        Ok(Response::new(ValidateChangesResponse {
            result: Some(result(errors)),
        }))
    }

    async fn parse_connection_config(
        &self,
        request: Request<ParseConnectionConfigRequest>,
    ) -> Result<Response<ParseConnectionConfigResponse>, Status> {
        let response = match parse_connection_config(&request.into_inner().config) {
            Ok(parsed) => ParseConnectionConfigResponse {
                result: parsed.to_string(),
                validation: Some(result(Vec::new())),
            },
            Err(errors) => ParseConnectionConfigResponse {
                result: String::new(),
                validation: Some(result(errors)),
            },
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CLUSTER: &str = r#"
apiVersion: deckhouse.io/v1
kind: ClusterConfiguration
clusterType: Cloud
cloud:
  provider: OpenStack
  prefix: test
podSubnetCIDR: 10.111.0.0/16
serviceSubnetCIDR: 10.222.0.0/16
clusterDomain: cluster.local
"#;

    const PROVIDER: &str = r#"
apiVersion: deckhouse.io/v1
kind: OpenStackClusterConfiguration
layout: Standard
masterNodeGroup:
  replicas: 1
nodeGroups:
  - name: worker
    replicas: 2
"#;

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_resources_require_metadata_name() {
        let config = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: apps
---
apiVersion: v1
kind: ConfigMap
metadata: {}
---
kind: Secret
"#;
        let errors = validate_resources(config);
        assert_eq!(fields(&errors), vec!["1.metadata.name", "2.apiVersion"]);
    }

    #[test]
    fn test_broken_yaml_is_reported() {
        let errors = validate_resources("a: [b");
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].message.is_empty());
    }

    #[test]
    fn test_valid_cluster_config() {
        assert!(validate_cluster_config(CLUSTER).is_empty());
    }

    #[test]
    fn test_cluster_config_with_unknown_type() {
        let config = CLUSTER.replace("clusterType: Cloud", "clusterType: Hybrid");
        let errors = validate_cluster_config(&config);
        assert_eq!(fields(&errors), vec!["0.ClusterConfiguration.clusterType"]);
    }

    #[rstest]
    #[case::init(INIT_CONFIGURATION_KIND)]
    #[case::static_cluster(STATIC_CLUSTER_CONFIGURATION_KIND)]
    fn test_wrong_document_kind(#[case] expected: &str) {
        let errors = match expected {
            INIT_CONFIGURATION_KIND => validate_init_config(CLUSTER),
            _ => validate_static_cluster_config(CLUSTER),
        };
        assert_eq!(fields(&errors), vec!["0.kind"]);
        assert!(errors[0].message.contains(expected));
    }

    #[test]
    fn test_provider_config_checks_node_groups() {
        assert!(validate_provider_specific_cluster_config(PROVIDER, "OpenStack").is_empty());

        let config = PROVIDER
            .replace("replicas: 1", "replicas: 0")
            .replace("name: worker", "name: master");
        let errors = validate_provider_specific_cluster_config(&config, "openstack");
        assert_eq!(
            fields(&errors),
            vec!["0.masterNodeGroup.replicas", "0.nodeGroups.0.name"]
        );
    }

    #[test]
    fn test_provider_config_of_another_provider() {
        let errors = validate_provider_specific_cluster_config(PROVIDER, "AWS");
        assert_eq!(fields(&errors), vec!["0.kind"]);
    }

    #[test]
    fn test_immutable_fields_cannot_change() {
        let old = format!("{CLUSTER}---{PROVIDER}");
        let new = old
            .replace("prefix: test", "prefix: prod")
            .replace("clusterDomain: cluster.local", "clusterDomain: example.com")
            .replace("replicas: 2", "replicas: 5");

        let errors = validate_changes(&old, &new);
        assert_eq!(
            fields(&errors),
            vec!["ClusterConfiguration.cloud.prefix", "ClusterConfiguration.clusterDomain"]
        );
    }

    #[test]
    fn test_masters_cannot_be_removed_by_changes() {
        let old = format!("{CLUSTER}---{PROVIDER}");
        let new = old.replace("replicas: 1", "replicas: 0");
        let errors = validate_changes(&old, &new);
        assert_eq!(fields(&errors), vec!["OpenStackClusterConfiguration.masterNodeGroup.replicas"]);
    }

    #[test]
    fn test_connection_config_is_parsed() {
        let config = r#"
apiVersion: dhctl.deckhouse.io/v1
kind: SSHConfig
sshUser: ubuntu
sshPort: 22
---
apiVersion: dhctl.deckhouse.io/v1
kind: SSHHost
host: 10.0.0.1
---
apiVersion: dhctl.deckhouse.io/v1
kind: SSHHost
host: 10.0.0.2
"#;
        let parsed = parse_connection_config(config).unwrap();
        assert_eq!(parsed["config"]["sshUser"], "ubuntu");
        assert_eq!(parsed["hosts"], json!(["10.0.0.1", "10.0.0.2"]));
    }

    #[test]
    fn test_connection_config_requires_user_and_hosts() {
        let config = r#"
apiVersion: dhctl.deckhouse.io/v1
kind: SSHConfig
sshPort: "22"
---
apiVersion: dhctl.deckhouse.io/v1
kind: SSHHost
"#;
        let errors = parse_connection_config(config).unwrap_err();
        assert_eq!(fields(&errors), vec!["0.sshUser", "0.sshPort", "1.host"]);
    }

    #[tokio::test]
    async fn test_service_reports_validity() {
        let response = ValidationService
            .validate_cluster_config(Request::new(ValidateClusterConfigRequest {
                config: CLUSTER.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.result, Some(ValidationResult { valid: true, errors: vec![] }));
    }
}
