//! Deckhouse configuration kept in the cluster

use std::collections::BTreeMap;

use tracing::{info, info_span, Instrument};

use dhctl_common::config::MetaConfig;
use dhctl_common::retry::retry_with_backoff_if;
use dhctl_common::secrets::*;
use dhctl_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};

use crate::client::ClusterClient;
use crate::state::{cluster_retry, secret};

async fn update_config_secret(
    client: &dyn ClusterClient,
    name: &str,
    key: &str,
    document: String,
) -> Result<()> {
    let manifest = secret(
        KUBE_SYSTEM_NAMESPACE,
        name,
        BTreeMap::from([(key.to_string(), document.into_bytes())]),
        BTreeMap::new(),
    );
    retry_with_backoff_if(
        &cluster_retry(),
        &format!("update {name}"),
        || client.create_or_update_secret(&manifest),
        Error::is_retryable,
    )
    .await
}

/// Write the cluster configuration and the provider (or static) one
pub async fn update_deckhouse_configuration(
    client: &dyn ClusterClient,
    meta: &MetaConfig,
) -> Result<()> {
    async {
        update_config_secret(
            client,
            CLUSTER_CONFIGURATION,
            CLUSTER_CONFIGURATION_KEY,
            meta.cluster_config_yaml()?,
        )
        .await?;

        let provider = meta.provider_cluster_config_yaml()?;
        if !provider.is_empty() {
            update_config_secret(
                client,
                PROVIDER_CLUSTER_CONFIGURATION,
                PROVIDER_CLUSTER_CONFIGURATION_KEY,
                provider,
            )
            .await?;
        }

        let static_config = meta.static_cluster_config_yaml()?;
        if !static_config.is_empty() {
            update_config_secret(
                client,
                STATIC_CLUSTER_CONFIGURATION,
                STATIC_CLUSTER_CONFIGURATION_KEY,
                static_config,
            )
            .await?;
        }
        info!("Deckhouse configuration updated");
        Ok(())
    }
    .instrument(info_span!("deckhouse_configuration"))
    .await
}

async fn config_document(
    client: &dyn ClusterClient,
    name: &str,
    key: &str,
) -> Result<Option<String>> {
    let secret = retry_with_backoff_if(
        &cluster_retry(),
        &format!("get {name}"),
        || client.get_secret(KUBE_SYSTEM_NAMESPACE, name),
        Error::is_retryable,
    )
    .await?;
    let Some(value) = secret.as_ref().and_then(|s| crate::client::secret_value(s, key)) else {
        return Ok(None);
    };
    String::from_utf8(value)
        .map(Some)
        .map_err(|e| Error::validation_for_field(format!("{name}.{key}"), e.to_string()))
}

/// Read the configuration the cluster was converged with
pub async fn load_meta_config(client: &dyn ClusterClient) -> Result<MetaConfig> {
    let cluster = config_document(client, CLUSTER_CONFIGURATION, CLUSTER_CONFIGURATION_KEY)
        .await?
        .ok_or_else(|| {
            Error::validation(format!(
                "{KUBE_SYSTEM_NAMESPACE}/{CLUSTER_CONFIGURATION} has no {CLUSTER_CONFIGURATION_KEY}"
            ))
        })?;
    let provider = config_document(
        client,
        PROVIDER_CLUSTER_CONFIGURATION,
        PROVIDER_CLUSTER_CONFIGURATION_KEY,
    ).await?;
    let static_config = config_document(
        client,
        STATIC_CLUSTER_CONFIGURATION,
        STATIC_CLUSTER_CONFIGURATION_KEY,
    ).await?;

    let meta = MetaConfig::from_documents(&cluster, provider.as_deref(), static_config.as_deref())?;
    meta.validate()?;
    Ok(meta)
}
