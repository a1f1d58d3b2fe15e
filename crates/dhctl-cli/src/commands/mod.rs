//! CLI commands

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{debug, info, warn};

use dhctl_common::cache::{
    cache_identity, init_with_options, CacheIdentitySource, DiskCache, InitOptions, StateCache,
};
use dhctl_common::config::MetaConfig;
use dhctl_common::confirm::Confirm;
use dhctl_common::tomb::Tomb;
use dhctl_common::DEFAULT_TMP_DIR;
use dhctl_converge::{
    load_meta_config, ClusterClient, ConvergeContext, ConvergeSettings, DirectTransport,
    KubeClusterClient,
};
use dhctl_infra::{ExecutorSettings, InfrastructureContext, ToolExecutorFactory};
use dhctl_phases::{write_progress, ContinueAlways, Operation, PhasedExecutionContext, Pipeline};

use crate::{Error, Result};

pub mod check;
pub mod converge;
pub mod destroy;
pub mod lock;
pub mod server;
pub mod worker;

/// Infrastructure modules shipped with the installer image
pub const DEFAULT_MODULES_DIR: &str = "/deckhouse/candi/cloud-providers";

/// How to reach the cluster
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Kubeconfig of the cluster (in-cluster or the default kubeconfig when unset)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long, env = "DHCTL_KUBE_CONTEXT")]
    pub kube_context: Option<String>,
}

impl ConnectionArgs {
    pub async fn client(&self) -> Result<Arc<dyn ClusterClient>> {
        let client = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
                KubeClusterClient::from_kubeconfig(&kubeconfig, self.kube_context.as_deref()).await?
            }
            None => KubeClusterClient::try_default().await?,
        };
        Ok(Arc::new(client))
    }

    /// Cache directory name of this connection
    pub fn cache_identity(&self) -> String {
        let source = match &self.kubeconfig {
            Some(path) => CacheIdentitySource::Kubeconfig {
                path: path.display().to_string(),
                context: self.kube_context.clone().unwrap_or_default(),
            },
            None => CacheIdentitySource::InCluster,
        };
        cache_identity(&source)
    }
}

/// Arguments shared by the operations on a cluster
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Configuration documents (read from the cluster when unset)
    #[arg(long = "config", env = "DHCTL_CONFIG", value_delimiter = ',')]
    pub config: Vec<PathBuf>,

    /// Root of state caches and temporary files
    #[arg(long, env = "DHCTL_TMP_DIR", default_value = DEFAULT_TMP_DIR)]
    pub tmp_dir: PathBuf,

    /// Infrastructure modules directory
    #[arg(long, env = "DHCTL_MODULES_DIR", default_value = DEFAULT_MODULES_DIR)]
    pub modules_dir: PathBuf,

    /// Drop the state cached by a previous run
    #[arg(long)]
    pub reset_cache: bool,

    /// Append progress reports to this file as JSON lines
    #[arg(long, env = "DHCTL_PROGRESS_FILE")]
    pub progress_file: Option<PathBuf>,
}

impl ClusterArgs {
    /// Documents of `--config`, joined into one multi-document YAML
    pub fn read_config(&self) -> Result<Option<String>> {
        if self.config.is_empty() {
            return Ok(None);
        }
        let mut documents = Vec::with_capacity(self.config.len());
        for path in &self.config {
            documents.push(std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?);
        }
        Ok(Some(documents.join("\n---\n")))
    }

    async fn meta_config(&self, client: &dyn ClusterClient) -> Result<MetaConfig> {
        match self.read_config()? {
            Some(data) => {
                let meta = MetaConfig::parse(&data)?;
                meta.validate()?;
                Ok(meta)
            }
            None => {
                info!("Reading the cluster configuration from the cluster");
                Ok(load_meta_config(client).await?)
            }
        }
    }

    fn cache(&self) -> Result<Arc<dyn StateCache>> {
        let cache = DiskCache::for_identity(&self.tmp_dir, &self.connection.cache_identity())?;
        init_with_options(
            &cache,
            InitOptions {
                initial_state: None,
                reset_initial_state: self.reset_cache,
            },
        )?;
        Ok(Arc::new(cache))
    }

    /// Connect, read the configuration and open the state cache
    pub async fn prepare(&self, confirm: Arc<dyn Confirm>) -> Result<Prepared> {
        let client = self.connection.client().await?;
        let meta = self.meta_config(client.as_ref()).await?;
        let cache = self.cache()?;
        let tomb = Tomb::new();
        let executors = Arc::new(ToolExecutorFactory::new(ExecutorSettings::new(&self.tmp_dir)));
        let infra = InfrastructureContext::new(
            &self.modules_dir,
            &self.tmp_dir,
            cache.clone(),
            confirm.clone(),
            tomb.clone(),
            executors,
        );
        debug!(
            prefix = %meta.cluster_prefix,
            tmp_dir = %self.tmp_dir.display(),
            "Cluster prepared"
        );
        Ok(Prepared {
            client,
            meta,
            cache,
            infra,
            tomb,
            confirm,
            progress_file: self.progress_file.clone(),
        })
    }
}

/// A connected cluster with its configuration
pub struct Prepared {
    pub client: Arc<dyn ClusterClient>,
    pub meta: MetaConfig,
    pub cache: Arc<dyn StateCache>,
    pub infra: InfrastructureContext,
    pub tomb: Arc<Tomb>,
    confirm: Arc<dyn Confirm>,
    progress_file: Option<PathBuf>,
}

impl Prepared {
    /// Pipeline running every phase without stopping between them
    pub fn pipeline(&self, operation: Operation) -> Pipeline {
        let on_progress = self.progress_file.clone().map(write_progress);
        let phases = PhasedExecutionContext::new(operation, Arc::new(ContinueAlways), on_progress);
        Pipeline::new(operation.as_str(), phases, self.cache.clone())
    }

    pub fn converge_context(self, settings: ConvergeSettings) -> Arc<ConvergeContext> {
        let transport = Arc::new(DirectTransport::new(self.client.clone()));
        ConvergeContext::new(self.meta, self.infra, self.client, transport, self.confirm, settings)
    }
}

/// Stop the operation on SIGINT; a second SIGINT exits at once
pub fn handle_interrupts(tomb: Arc<Tomb>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for interrupts");
                return;
            }
            if tomb.interrupt_count() > 0 {
                warn!("Interrupted again, exiting");
                std::process::exit(130);
            }
            let tomb = tomb.clone();
            tokio::spawn(async move {
                tomb.shutdown("interrupt").await;
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_args(config: Vec<PathBuf>) -> ClusterArgs {
        ClusterArgs {
            connection: ConnectionArgs::default(),
            config,
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            modules_dir: PathBuf::from(DEFAULT_MODULES_DIR),
            reset_cache: false,
            progress_file: None,
        }
    }

    #[test]
    fn test_config_files_are_joined_as_documents() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = dir.path().join("cluster.yaml");
        let provider = dir.path().join("provider.yaml");
        std::fs::write(&cluster, "kind: ClusterConfiguration\n").unwrap();
        std::fs::write(&provider, "kind: YandexClusterConfiguration\n").unwrap();

        let data = cluster_args(vec![cluster, provider]).read_config().unwrap().unwrap();
        assert_eq!(
            data,
            "kind: ClusterConfiguration\n\n---\nkind: YandexClusterConfiguration\n"
        );
        assert!(cluster_args(vec![]).read_config().unwrap().is_none());
    }

    #[test]
    fn test_missing_config_file_names_the_path() {
        let err = cluster_args(vec![PathBuf::from("/nonexistent/cluster.yaml")])
            .read_config()
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cluster.yaml"), "{err}");
    }

    #[test]
    fn test_cache_identity_depends_on_the_context() {
        let connection = |context: Option<&str>| ConnectionArgs {
            kubeconfig: Some(PathBuf::from("/root/.kube/config")),
            kube_context: context.map(str::to_string),
        };
        assert_eq!(
            connection(Some("prod")).cache_identity(),
            connection(Some("prod")).cache_identity()
        );
        assert_ne!(
            connection(Some("prod")).cache_identity(),
            connection(Some("stage")).cache_identity()
        );
        assert_ne!(
            connection(None).cache_identity(),
            ConnectionArgs::default().cache_identity()
        );
    }
}
