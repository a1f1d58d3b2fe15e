//! Shared state of one converge operation

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use dhctl_common::cache::StateCache;
use dhctl_common::config::MetaConfig;
use dhctl_common::confirm::Confirm;
use dhctl_common::tomb::Tomb;
use dhctl_common::{Error, Result};
use dhctl_infra::InfrastructureContext;
use dhctl_phases::OperationPhase;

use crate::client::ClusterClient;
use crate::lock::{ConvergeLock, LockConfig};
use crate::readiness::ReadinessSettings;
use crate::state::{set_converge_state, ConvergeState};

/// Operator choices for a converge
#[derive(Debug, Clone, Default)]
pub struct ConvergeSettings {
    /// Apply every change without asking
    pub auto_approve: bool,
    /// Never apply destructive changes, never delete nodes or groups
    pub auto_dismiss_destructive: bool,
    /// Commander instance that owns the cluster, used as lock identity prefix
    pub commander_uuid: Option<String>,
    /// Nodes left untouched by updates
    pub excluded_nodes: BTreeSet<String>,
    pub skip_phases: HashSet<OperationPhase>,
    /// Bootstrap new node groups one after another
    pub sequential_bootstrap: bool,
    pub readiness: ReadinessSettings,
    /// Destructive change id the operator reviewed
    pub approve_destruction_change_id: Option<String>,
}

/// A master reachable over SSH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterHost {
    pub name: String,
    pub host: String,
}

/// Credentials and hosts of a node connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSession {
    pub user: String,
    pub private_key_path: PathBuf,
    pub hosts: Vec<MasterHost>,
}

/// Connection to the cluster through its masters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Reconnect as `session.user`; the returned client goes over the new connection
    async fn switch_user(&self, session: &NodeSession) -> Result<Arc<dyn ClusterClient>>;

    /// Masters the connection may use from now on
    async fn set_hosts(&self, hosts: &[MasterHost]) -> Result<()>;
}

/// Cluster reached directly (kubeconfig or in-cluster); nothing to switch
pub struct DirectTransport {
    client: Arc<dyn ClusterClient>,
}

impl DirectTransport {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeTransport for DirectTransport {
    async fn switch_user(&self, session: &NodeSession) -> Result<Arc<dyn ClusterClient>> {
        debug!(user = %session.user, "Direct cluster access, keeping the current client");
        Ok(self.client.clone())
    }

    async fn set_hosts(&self, hosts: &[MasterHost]) -> Result<()> {
        debug!(hosts = hosts.len(), "Direct cluster access, hosts are not used");
        Ok(())
    }
}

/// Everything the engine and the controllers of one converge share
pub struct ConvergeContext {
    meta: MetaConfig,
    infra: InfrastructureContext,
    client: RwLock<Arc<dyn ClusterClient>>,
    transport: Arc<dyn NodeTransport>,
    lock: Mutex<Option<Arc<ConvergeLock>>>,
    confirm: Arc<dyn Confirm>,
    settings: ConvergeSettings,
    auto_approve: AtomicBool,
    converge_state: Mutex<ConvergeState>,
}

impl std::fmt::Debug for ConvergeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergeContext")
            .field("cluster_prefix", &self.meta.cluster_prefix)
            .field("infra", &self.infra)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ConvergeContext {
    pub fn new(
        meta: MetaConfig,
        infra: InfrastructureContext,
        client: Arc<dyn ClusterClient>,
        transport: Arc<dyn NodeTransport>,
        confirm: Arc<dyn Confirm>,
        settings: ConvergeSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            infra,
            client: RwLock::new(client),
            transport,
            lock: Mutex::new(None),
            confirm,
            auto_approve: AtomicBool::new(settings.auto_approve),
            settings,
            converge_state: Mutex::new(ConvergeState::default()),
        })
    }

    pub fn meta(&self) -> &MetaConfig {
        &self.meta
    }

    pub fn infra(&self) -> &InfrastructureContext {
        &self.infra
    }

    pub fn settings(&self) -> &ConvergeSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<dyn NodeTransport> {
        &self.transport
    }

    pub fn cache(&self) -> &Arc<dyn StateCache> {
        self.infra.cache()
    }

    pub fn tomb(&self) -> &Arc<Tomb> {
        self.infra.tomb()
    }

    pub fn commander_mode(&self) -> bool {
        self.infra.commander_mode()
    }

    /// Client of the current connection
    pub fn client(&self) -> Arc<dyn ClusterClient> {
        self.client.read().clone()
    }

    pub fn check_interrupted(&self) -> Result<()> {
        if self.tomb().is_interrupted() {
            return Err(Error::ConvergeInterrupted);
        }
        Ok(())
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve.load(Ordering::Relaxed)
    }

    /// Approve every change from now on
    pub fn enable_auto_approve(&self) {
        self.auto_approve.store(true, Ordering::Relaxed);
    }

    /// Yes when auto approved, the operator's answer otherwise
    pub fn approve(&self, question: &str) -> bool {
        self.auto_approve() || self.confirm.ask(question, false)
    }

    /// Like [`Self::approve`] with yes as the default answer
    pub fn approve_by_default(&self, question: &str) -> bool {
        self.auto_approve() || self.confirm.ask(question, true)
    }

    /// State a runner is seeded with; commander mode reads it from the cache
    pub fn runner_state(&self, state: Option<&Vec<u8>>) -> Option<Vec<u8>> {
        if self.commander_mode() {
            return None;
        }
        state.cloned()
    }

    pub fn converge_state(&self) -> ConvergeState {
        self.converge_state.lock().clone()
    }

    /// Use `state` loaded from the cluster without saving it back
    pub fn restore_converge_state(&self, state: ConvergeState) {
        *self.converge_state.lock() = state;
    }

    pub async fn save_converge_state(&self, state: ConvergeState) -> Result<()> {
        set_converge_state(self.client().as_ref(), &state).await?;
        *self.converge_state.lock() = state;
        Ok(())
    }

    /// Lock held by this operation
    pub fn set_lock(&self, lock: Arc<ConvergeLock>) {
        *self.lock.lock() = Some(lock);
    }

    pub fn lock(&self) -> Option<Arc<ConvergeLock>> {
        self.lock.lock().clone()
    }

    /// Take the converge lease for the rest of the operation
    pub async fn take_lock(&self, config: LockConfig) -> Result<Arc<ConvergeLock>> {
        let lock = Arc::new(ConvergeLock::new(self.client(), self.cache().as_ref(), config)?);
        lock.acquire().await?;
        self.tomb().register_on_shutdown("converge lock", lock.clone());
        self.set_lock(lock.clone());
        Ok(lock)
    }

    /// Full unlock of the lease taken by [`Self::take_lock`]
    pub async fn release_lock(&self) -> Result<()> {
        let lock = self.lock.lock().take();
        match lock {
            Some(lock) => lock.release().await,
            None => Ok(()),
        }
    }

    /// Continue over another client, moving the lock to it
    pub async fn switch_client(&self, client: Arc<dyn ClusterClient>) -> Result<()> {
        let current = self.lock();
        if let Some(lock) = &current {
            lock.stop_auto_renew();
        }
        *self.client.write() = client.clone();

        if let Some(lock) = current {
            let rebound = Arc::new(lock.rebind(client));
            rebound.acquire().await?;
            self.tomb()
                .register_on_shutdown("converge lock", rebound.clone());
            info!(identity = %rebound.identity(), "Converge lock moved to the new connection");
            self.set_lock(rebound);
        }
        Ok(())
    }
}
