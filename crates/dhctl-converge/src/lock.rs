//! Converge lock over a Kubernetes Lease
//!
//! Only one dhctl may change a cluster at a time. The holder of the
//! `d8-system/d8-converge-lock` Lease is that dhctl; it renews the lease in
//! the background and interrupts itself when a renewal fails.
//!
//! # Atomicity
//!
//! Renewals and takeovers replace the Lease with the resourceVersion it was
//! read with, so two processes can never both believe they hold it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dhctl_common::cache::StateCache;
use dhctl_common::tomb::Stoppable;
use dhctl_common::{Error, Result, D8_SYSTEM_NAMESPACE};

use crate::client::ClusterClient;

/// Name of the converge Lease
pub const LOCK_LEASE_NAME: &str = "d8-converge-lock";

/// Cache key of the persisted lock identity
pub const LOCK_IDENTITY_CACHE_KEY: &str = "lock-identifier";

/// Annotation with the holder's connection details
pub const LOCK_INFO_ANNOTATION: &str = "dhctl.deckhouse.io/lock-info";

/// Timing and identity of the converge lock
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub name: String,
    pub namespace: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_wait: Duration,
    /// Acquire attempts before giving up with [`Error::LockHeld`]
    pub acquire_attempts: u32,
    /// Prepended to the persisted identity
    pub identity_prefix: Option<String>,
    /// Recorded on the Lease for whoever finds it held (e.g. `{"ssh_user": ...}`)
    pub additional_info: Option<Value>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: LOCK_LEASE_NAME.to_string(),
            namespace: D8_SYSTEM_NAMESPACE.to_string(),
            lease_duration: Duration::from_secs(300),
            renew_interval: Duration::from_secs(180),
            retry_wait: Duration::from_secs(3),
            acquire_attempts: 3,
            identity_prefix: None,
            additional_info: None,
        }
    }
}

/// Called once when the lease could not be renewed
pub type OnLockLost = Arc<dyn Fn() + Send + Sync>;

/// Interrupt the own process, like an operator pressing Ctrl-C
pub fn interrupt_self() -> OnLockLost {
    Arc::new(|| {
        let interrupted =
            nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGINT);
        if let Err(e) = interrupted {
            warn!(error = %e, "Failed to interrupt self after losing the converge lock");
        }
    })
}

/// Identity persisted in the cache, created on first use
pub fn lock_identity(cache: &dyn StateCache, prefix: Option<&str>) -> Result<String> {
    let id = match cache.load(LOCK_IDENTITY_CACHE_KEY)? {
        Some(raw) if !raw.is_empty() => String::from_utf8_lossy(&raw).trim().to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            cache.save(LOCK_IDENTITY_CACHE_KEY, id.as_bytes())?;
            id
        }
    };
    Ok(match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}-{id}"),
        None => id,
    })
}

enum Claim {
    Held,
    Busy(String),
}

/// Lease operations shared with the renewal task
struct LeaseClaim {
    client: Arc<dyn ClusterClient>,
    config: LockConfig,
    identity: String,
}

impl LeaseClaim {
    fn lease(&self, resource_version: Option<String>, transitions: i32) -> Result<Lease> {
        let now = MicroTime(Utc::now());
        let annotations = match &self.config.additional_info {
            Some(info) => Some(BTreeMap::from([(
                LOCK_INFO_ANNOTATION.to_string(),
                serde_json::to_string(info)?,
            )])),
            None => None,
        };
        Ok(Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                namespace: Some(self.config.namespace.clone()),
                resource_version,
                annotations,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        })
    }

    async fn try_acquire_or_renew(&self) -> Result<Claim> {
        let Some(existing) = self
            .client
            .get_lease(&self.config.namespace, &self.config.name)
            .await?
        else {
            if self.client.create_lease(&self.lease(None, 0)?).await? {
                info!(identity = %self.identity, "Converge lock created");
                return Ok(Claim::Held);
            }
            return Ok(Claim::Busy("unknown".to_string()));
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();
        let resource_version = existing.metadata.resource_version.clone();

        if holder == self.identity {
            let mut renewed = existing.clone();
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(Utc::now()));
            }
            if self.client.replace_lease(&renewed).await? {
                debug!(identity = %self.identity, "Converge lock renewed");
                return Ok(Claim::Held);
            }
            return Ok(Claim::Busy(holder));
        }

        let expired = match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
            (Some(renewed), Some(duration)) => {
                Utc::now() > renewed.0 + chrono::Duration::seconds(duration as i64)
            }
            _ => true,
        };
        if !expired && !holder.is_empty() {
            return Ok(Claim::Busy(holder));
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        if self
            .client
            .replace_lease(&self.lease(resource_version, transitions)?)
            .await?
        {
            info!(identity = %self.identity, previous = %holder, "Took over expired converge lock");
            return Ok(Claim::Held);
        }
        Ok(Claim::Busy(holder))
    }

    async fn renewal_loop(self: Arc<Self>, on_lost: OnLockLost) {
        loop {
            tokio::time::sleep(self.config.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(Claim::Held) => {}
                Ok(Claim::Busy(holder)) => {
                    warn!(identity = %self.identity, holder = %holder, "Converge lock lost");
                    on_lost();
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Converge lock renewal failed");
                    on_lost();
                    return;
                }
            }
        }
    }
}

/// The converge lock of one operation
pub struct ConvergeLock {
    claim: Arc<LeaseClaim>,
    on_lost: OnLockLost,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConvergeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergeLock")
            .field("identity", &self.claim.identity)
            .field("lease", &self.claim.config.name)
            .field("renewing", &self.renewal.lock().is_some())
            .finish()
    }
}

impl ConvergeLock {
    /// Lock with the identity persisted in `cache`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        cache: &dyn StateCache,
        config: LockConfig,
    ) -> Result<Self> {
        let identity = lock_identity(cache, config.identity_prefix.as_deref())?;
        Ok(Self::with_identity(client, identity, config))
    }

    pub fn with_identity(
        client: Arc<dyn ClusterClient>,
        identity: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            claim: Arc::new(LeaseClaim {
                client,
                config,
                identity: identity.into(),
            }),
            on_lost: interrupt_self(),
            renewal: Mutex::new(None),
        }
    }

    /// Replace what happens when a renewal fails
    pub fn on_lost(mut self, on_lost: OnLockLost) -> Self {
        self.on_lost = on_lost;
        self
    }

    /// Same identity and timing over another client
    pub fn rebind(&self, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            claim: Arc::new(LeaseClaim {
                client,
                config: self.claim.config.clone(),
                identity: self.claim.identity.clone(),
            }),
            on_lost: self.on_lost.clone(),
            renewal: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.claim.identity
    }

    pub fn is_renewing(&self) -> bool {
        self.renewal.lock().is_some()
    }

    /// Take the lease and start renewing it.
    ///
    /// Fails with [`Error::LockHeld`] when someone else keeps holding it
    /// for all attempts.
    pub async fn acquire(&self) -> Result<()> {
        let config = &self.claim.config;
        let mut holder = String::new();
        for attempt in 1..=config.acquire_attempts.max(1) {
            match self.claim.try_acquire_or_renew().await {
                Ok(Claim::Held) => {
                    info!(
                        identity = %self.claim.identity,
                        lease = %config.name,
                        "Converge lock acquired"
                    );
                    self.start_auto_renew();
                    return Ok(());
                }
                Ok(Claim::Busy(current)) => {
                    info!(holder = %current, attempt, "Converge lock is held, waiting");
                    holder = current;
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, attempt, "Failed to acquire converge lock, retrying");
                }
                Err(e) => return Err(e),
            }
            if attempt < config.acquire_attempts {
                tokio::time::sleep(config.retry_wait).await;
            }
        }
        Err(Error::LockHeld { holder })
    }

    fn start_auto_renew(&self) {
        let mut renewal = self.renewal.lock();
        if renewal.is_some() {
            return;
        }
        let claim = self.claim.clone();
        let on_lost = self.on_lost.clone();
        *renewal = Some(tokio::spawn(claim.renewal_loop(on_lost)));
    }

    /// Partial unlock: stop renewing, leave the lease in place
    pub fn stop_auto_renew(&self) {
        if let Some(task) = self.renewal.lock().take() {
            task.abort();
            debug!(identity = %self.claim.identity, "Converge lock auto renew stopped");
        }
    }

    /// Full unlock: stop renewing and delete the lease if it is ours
    pub async fn release(&self) -> Result<()> {
        self.stop_auto_renew();
        let config = &self.claim.config;
        let Some(lease) = self.claim.client.get_lease(&config.namespace, &config.name).await? else {
            debug!("Converge lock is absent, nothing to release");
            return Ok(());
        };
        let holder = lease.spec.and_then(|s| s.holder_identity).unwrap_or_default();
        if holder != self.claim.identity {
            debug!(holder = %holder, "Converge lock is held by another, not releasing");
            return Ok(());
        }
        self.claim
            .client
            .delete_lease(&config.namespace, &config.name)
            .await?;
        info!(identity = %self.claim.identity, "Converge lock released");
        Ok(())
    }
}

/// Delete the lease whoever holds it
pub async fn force_release(client: &dyn ClusterClient, config: &LockConfig) -> Result<()> {
    client.delete_lease(&config.namespace, &config.name).await?;
    info!(lease = %config.name, "Converge lock removed");
    Ok(())
}

#[async_trait]
impl Stoppable for ConvergeLock {
    async fn stop(&self) {
        if let Err(e) = self.release().await {
            warn!(error = %e, "Failed to release converge lock");
        }
    }
}

impl Drop for ConvergeLock {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.get_mut().take() {
            task.abort();
        }
    }
}
