//! Operations run by a worker
//!
//! [`DhctlOperations`] turns a start message into the contexts of one
//! invocation (configuration, state cache, infrastructure runners, cluster
//! client) and runs the matching operation inside the stream's phased
//! execution context.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};

use dhctl_common::cache::{init_with_options, DiskCache, InitOptions, StateCache};
use dhctl_common::config::MetaConfig;
use dhctl_common::confirm::{AutoAnswer, Confirm};
use dhctl_common::tomb::Tomb;
use dhctl_common::{Error, Result};
use dhctl_converge::{
    abort_bootstrap, bootstrap_cluster, check_state, commander_attach, commander_detach,
    destroy_cluster, ClusterClient, ConvergeContext, ConvergeEngine, ConvergeSettings,
    DirectTransport, KubeClusterClient, LockConfig,
};
use dhctl_infra::{ExecutorSettings, InfrastructureContext, ToolExecutorFactory};
use dhctl_phases::{OperationPhase, PhasedExecutionContext, Pipeline};
use dhctl_proto as proto;

use crate::config::WorkerConfig;
use crate::messages::StartRequest;

/// What a running operation shares with its stream
#[derive(Debug, Clone)]
pub struct OperationSession {
    pub phases: Arc<PhasedExecutionContext>,
    pub tomb: Arc<Tomb>,
}

/// Runs one operation to completion
#[async_trait]
pub trait Operations: Send + Sync {
    /// Never fails: errors are reported in the result's `err`
    async fn run(&self, start: StartRequest, session: OperationSession) -> proto::OperationResult;
}

/// Fields every start message carries
struct Invocation {
    cluster_config: String,
    provider_specific_cluster_config: String,
    state: HashMap<String, Vec<u8>>,
    options: proto::OperationOptions,
    connection: Option<proto::ConnectionConfig>,
}

impl Invocation {
    fn of(start: &StartRequest) -> Self {
        macro_rules! with_connection {
            ($s:expr) => {
                Invocation {
                    cluster_config: $s.cluster_config.clone(),
                    provider_specific_cluster_config: $s.provider_specific_cluster_config.clone(),
                    state: $s.state.clone(),
                    options: $s.options.clone().unwrap_or_default(),
                    connection: Some($s.connection_config.clone().unwrap_or_default()),
                }
            };
        }
        match start {
            StartRequest::Check(s) => with_connection!(s),
            StartRequest::Destroy(s) => with_connection!(s),
            StartRequest::Converge(s) => with_connection!(s),
            StartRequest::Bootstrap(s) => Invocation {
                cluster_config: s.cluster_config.clone(),
                provider_specific_cluster_config: s.provider_specific_cluster_config.clone(),
                state: s.state.clone(),
                options: s.options.clone().unwrap_or_default(),
                connection: None,
            },
            StartRequest::Abort(s) => Invocation {
                cluster_config: s.cluster_config.clone(),
                provider_specific_cluster_config: s.provider_specific_cluster_config.clone(),
                state: s.state.clone(),
                options: s.options.clone().unwrap_or_default(),
                connection: None,
            },
            StartRequest::CommanderAttach(s) => Invocation {
                cluster_config: s.cluster_config.clone(),
                provider_specific_cluster_config: s.provider_specific_cluster_config.clone(),
                state: HashMap::new(),
                options: s.options.clone().unwrap_or_default(),
                connection: Some(s.connection_config.clone().unwrap_or_default()),
            },
            StartRequest::CommanderDetach(s) => Invocation {
                cluster_config: s.cluster_config.clone(),
                provider_specific_cluster_config: s.provider_specific_cluster_config.clone(),
                state: HashMap::new(),
                options: s.options.clone().unwrap_or_default(),
                connection: Some(s.connection_config.clone().unwrap_or_default()),
            },
        }
    }

    fn meta_config(&self) -> Result<MetaConfig> {
        let provider = Some(self.provider_specific_cluster_config.as_str())
            .filter(|s| !s.trim().is_empty());
        let meta = MetaConfig::from_documents(&self.cluster_config, provider, None)?;
        meta.validate()?;
        Ok(meta)
    }

    fn lock_config(&self) -> LockConfig {
        let mut config = LockConfig::default();
        if self.options.lock_lease_duration_seconds > 0 {
            config.lease_duration = Duration::from_secs(
                u64::from(self.options.lock_lease_duration_seconds),
            );
            config.renew_interval = config.lease_duration * 3 / 5;
        }
        if !self.options.commander_uuid.is_empty() {
            config.identity_prefix = Some(self.options.commander_uuid.clone());
        }
        config
    }

    fn commander_uuid(&self) -> Option<String> {
        Some(self.options.commander_uuid.clone()).filter(|s| !s.is_empty())
    }
}

/// Operations backed by the infrastructure tool and a Kubernetes cluster
#[derive(Debug, Clone)]
pub struct DhctlOperations {
    config: WorkerConfig,
}

impl DhctlOperations {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn cache(&self, invocation: &Invocation) -> Result<Arc<dyn StateCache>> {
        let dir: PathBuf = self.config.tmp_dir.join(format!("cache_{}", uuid::Uuid::new_v4()));
        let cache: Arc<dyn StateCache> = Arc::new(DiskCache::open(dir)?);
        let initial_state: BTreeMap<String, Vec<u8>> = invocation
            .state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        init_with_options(
            cache.as_ref(),
            InitOptions {
                initial_state: Some(initial_state).filter(|s| !s.is_empty()),
                reset_initial_state: invocation.options.reset_initial_state,
            },
        )?;
        Ok(cache)
    }

    fn infra(
        &self,
        invocation: &Invocation,
        cache: Arc<dyn StateCache>,
        confirm: Arc<dyn Confirm>,
        tomb: Arc<Tomb>,
    ) -> InfrastructureContext {
        let executors = Arc::new(
            ToolExecutorFactory::new(ExecutorSettings::new(&self.config.tmp_dir)),
        );
        InfrastructureContext::new(
            &self.config.modules_dir,
            &self.config.tmp_dir,
            cache,
            confirm,
            tomb,
            executors,
        )
        .with_commander_mode(invocation.options.commander_mode)
    }

    async fn client(connection: &proto::ConnectionConfig) -> Result<Arc<dyn ClusterClient>> {
        let client = if connection.kubeconfig.trim().is_empty() {
            KubeClusterClient::try_default().await?
        } else {
            let context = Some(connection.kubeconfig_context.as_str()).filter(|s| !s.is_empty());
            KubeClusterClient::from_kubeconfig(&connection.kubeconfig, context).await?
        };
        Ok(Arc::new(client))
    }

    async fn converge_context(
        &self,
        invocation: &Invocation,
        meta: MetaConfig,
        infra: InfrastructureContext,
        confirm: Arc<dyn Confirm>,
        settings: ConvergeSettings,
    ) -> Result<Arc<ConvergeContext>> {
        let connection = invocation.connection.clone().unwrap_or_default();
        let client = Self::client(&connection).await?;
        let transport = Arc::new(DirectTransport::new(client.clone()));
        Ok(ConvergeContext::new(meta, infra, client, transport, confirm, settings))
    }

    async fn execute(
        &self,
        start: StartRequest,
        session: &OperationSession,
        cache: Arc<dyn StateCache>,
    ) -> Result<Option<Value>> {
        let invocation = Invocation::of(&start);
        let meta = invocation.meta_config()?;
        // destructive changes are gated by the approval id, never by prompts
        let confirm: Arc<dyn Confirm> = Arc::new(AutoAnswer::yes());
        let infra = self.infra(&invocation, cache.clone(), confirm.clone(), session.tomb.clone());
        let operation = start.operation();
        let pipeline = Pipeline::new(operation.as_str(), session.phases.clone(), cache);
        let lock_config = invocation.lock_config();
        let settings = ConvergeSettings {
            commander_uuid: invocation.commander_uuid(),
            ..Default::default()
        };

        match start {
            StartRequest::Bootstrap(_) => {
                let result = Mutex::new(None);
                let out = &result;
                let (meta, infra) = (&meta, &infra);
                let pipeline_ref = &pipeline;
                pipeline
                    .run(move |_| async move {
                        let phase = OperationPhase::BaseInfrastructure;
                        pipeline_ref
                            .run_phase(phase, true, move || async move {
                                let bootstrapped = bootstrap_cluster(meta, infra).await?;
                                let data = serde_json::to_value(&bootstrapped)?;
                                *out.lock() = Some(data.clone());
                                Ok(Some(data))
                            })
                            .await
                    })
                    .await?;
                Ok(result.into_inner())
            }
            StartRequest::Abort(_) => {
                abort_bootstrap(&meta, &infra, &pipeline).await?;
                Ok(None)
            }
            StartRequest::Check(_) => {
                let ctx = self
                    .converge_context(&invocation, meta, infra, confirm, settings)
                    .await?;
                let result = Mutex::new(None);
                let out = &result;
                let ctx_ref: &ConvergeContext = &ctx;
                let pipeline_ref = &pipeline;
                pipeline
                    .run(move |_| async move {
                        pipeline_ref
                            .run_phase(OperationPhase::Check, false, move || async move {
                                let statistics = check_state(
                                    ctx_ref.client().as_ref(),
                                    ctx_ref.meta(),
                                    ctx_ref.infra(),
                                )
                                    .await
                                    .into_result()?;
                                let data = serde_json::to_value(&statistics)?;
                                *out.lock() = Some(data.clone());
                                Ok(Some(data))
                            })
                            .await
                    })
                    .await?;
                Ok(result.into_inner())
            }
            StartRequest::Destroy(_) => {
                let settings = ConvergeSettings {
                    auto_approve: true,
                    ..settings
                };
                let ctx = self
                    .converge_context(&invocation, meta, infra, confirm, settings)
                    .await?;
                destroy_cluster(&ctx, &pipeline, lock_config).await?;
                Ok(None)
            }
            StartRequest::Converge(start) => {
                let settings = converge_settings(&start, settings)?;
                let ctx = self
                    .converge_context(&invocation, meta, infra, confirm, settings)
                    .await?;
                ConvergeEngine::new(ctx, lock_config).run(&pipeline).await?;
                Ok(None)
            }
            StartRequest::CommanderAttach(_) => {
                let ctx = self
                    .converge_context(&invocation, meta, infra, confirm, settings)
                    .await?;
                let attached = commander_attach(&ctx, &pipeline, lock_config).await?;
                Ok(Some(json!({ "statistics": attached.statistics })))
            }
            StartRequest::CommanderDetach(_) => {
                let ctx = self
                    .converge_context(&invocation, meta, infra, confirm, settings)
                    .await?;
                commander_detach(&ctx, &pipeline, lock_config).await?;
                Ok(None)
            }
        }
    }
}

/// Operator choices carried by a converge start message
pub fn converge_settings(
    start: &proto::ConvergeStart,
    base: ConvergeSettings,
) -> Result<ConvergeSettings> {
    let skip_phases = start
        .skip_phases
        .iter()
        .map(|name| {
            OperationPhase::parse(name)
                .ok_or_else(|| {
                    Error::validation_for_field("skip_phases", format!("unknown phase {name}"))
                })
        })
        .collect::<Result<HashSet<_>>>()?;
    Ok(ConvergeSettings {
        auto_approve: false,
        auto_dismiss_destructive: false,
        excluded_nodes: start.excluded_nodes.iter().cloned().collect::<BTreeSet<_>>(),
        skip_phases,
        sequential_bootstrap: start.sequential_bootstrap,
        approve_destruction_change_id: Some(start.approve_destruction_change_id.clone()),
        ..base
    })
}

fn state_of(cache: &dyn StateCache, session: &OperationSession) -> HashMap<String, Vec<u8>> {
    let state = cache.snapshot().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read the state cache, reporting the last phase state");
        session.phases.last_state()
    });
    state.into_iter().collect()
}

#[async_trait]
impl Operations for DhctlOperations {
    async fn run(&self, start: StartRequest, session: OperationSession) -> proto::OperationResult {
        let operation = start.operation();
        let invocation = Invocation::of(&start);
        let cache = match self.cache(&invocation) {
            Ok(cache) => cache,
            Err(e) => {
                return proto::OperationResult {
                    state: invocation.state,
                    result: String::new(),
                    err: e.to_string(),
                }
            }
        };

        let outcome = self
            .execute(start, &session, cache.clone())
            .instrument(info_span!("operation", operation = %operation))
            .await;
        let state = state_of(cache.as_ref(), &session);
        match outcome {
            Ok(result) => {
                info!(operation = %operation, "Operation finished");
                proto::OperationResult {
                    state,
                    result: result.map(|v| v.to_string()).unwrap_or_default(),
                    err: String::new(),
                }
            }
            Err(e) => {
                warn!(operation = %operation, error = %e, "Operation failed");
                proto::OperationResult {
                    state,
                    result: String::new(),
                    err: e.to_string(),
                }
            }
        }
    }
}
