//! Intermediate state saver
//!
//! While an apply or destroy runs, the tool rewrites its state file many
//! times. The saver follows those writes through filesystem events and ships
//! every complete state to its destinations, so that an interrupted
//! operation leaves the latest state in the cluster. It never writes the
//! file itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dhctl_common::cache::StateCache;
use dhctl_common::retry::{retry_with_backoff, RetryConfig};
use dhctl_common::{Error, Result};

/// Receives every new state observed during apply or destroy
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SaverDestination: Send + Sync {
    /// Persist one state snapshot
    async fn save_state(&self, state: &[u8]) -> Result<()>;
}

/// Destination writing into the local state cache
pub struct CacheDestination {
    cache: Arc<dyn StateCache>,
    key: String,
}

impl CacheDestination {
    pub fn new(cache: Arc<dyn StateCache>, key: impl Into<String>) -> Self {
        Self { cache, key: key.into() }
    }
}

#[async_trait]
impl SaverDestination for CacheDestination {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        self.cache.save(&self.key, state)
    }
}

/// Returns the state bytes when `data` is a complete state document.
///
/// The tool truncates the file before rewriting it, so empty or partially
/// written content is expected and yields `None`.
pub fn only_state(data: &[u8]) -> Option<&[u8]> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .filter(serde_json::Value::is_object)
        .map(|_| data)
}

struct Active {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Watches a state file and forwards its content to destinations
pub struct StateSaver {
    destinations: Mutex<Vec<Arc<dyn SaverDestination>>>,
    retry: RetryConfig,
    active: Mutex<Option<Active>>,
}

impl std::fmt::Debug for StateSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSaver")
            .field("destinations", &self.destinations.lock().len())
            .field("started", &self.is_started())
            .finish()
    }
}

impl StateSaver {
    pub fn new(destinations: Vec<Arc<dyn SaverDestination>>) -> Self {
        Self {
            destinations: Mutex::new(destinations),
            retry: RetryConfig::state_save().silent(),
            active: Mutex::new(None),
        }
    }

    /// Override the per-destination retry loop
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn add_destinations(
        &self,
        destinations: impl IntoIterator<Item = Arc<dyn SaverDestination>>,
    ) {
        self.destinations.lock().extend(destinations);
    }

    pub fn destinations_count(&self) -> usize {
        self.destinations.lock().len()
    }

    pub fn is_started(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start following `state_path`; a no-op when already started
    pub fn start(&self, state_path: &Path) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Ok(());
        }
        let destinations = self.destinations.lock().clone();
        if destinations.is_empty() {
            debug!(path = %state_path.display(), "No saver destinations, state saver not started");
            return Ok(());
        }

        let watch_dir = state_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })
        .map_err(|e| {
            Error::internal_with_context("state saver", format!("cannot create watcher: {e}"))
        })?;
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::internal_with_context(
                    "state saver",
                    format!("cannot watch {}: {e}", watch_dir.display()),
                )
            })?;

        let stop = CancellationToken::new();
        let worker = SaverWorker {
            path: state_path.to_path_buf(),
            destinations,
            retry: self.retry.clone(),
            last_saved: None,
        };
        let task = tokio::spawn(worker.run(watcher, rx, stop.clone()));
        info!(path = %state_path.display(), "Intermediate state saver started");
        *active = Some(Active { stop, task });
        Ok(())
    }

    /// Stop watching and wait until pending saves are flushed
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        active.stop.cancel();
        if let Err(e) = active.task.await {
            error!(error = %e, "State saver task failed");
        }
        debug!("Intermediate state saver stopped");
    }
}

struct SaverWorker {
    path: PathBuf,
    destinations: Vec<Arc<dyn SaverDestination>>,
    retry: RetryConfig,
    last_saved: Option<Vec<u8>>,
}

impl SaverWorker {
    async fn run(
        mut self,
        watcher: RecommendedWatcher,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(Ok(event)) if self.is_write_of_state(&event) => self.save_current().await,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(error = %e, "State file watcher error"),
                },
            }
        }

        drop(watcher);
        // writes that were not delivered as events yet
        self.save_current().await;
    }

    fn is_write_of_state(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name().is_some() && p.file_name() == self.path.file_name())
    }

    async fn save_current(&mut self) {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read state file");
                return;
            }
        };
        let Some(state) = only_state(&data) else {
            debug!(
                path = %self.path.display(),
                bytes = data.len(),
                "Incomplete state file, skipping"
            );
            return;
        };
        if self.last_saved.as_deref() == Some(state) {
            return;
        }

        for destination in &self.destinations {
            let result = retry_with_backoff(&self.retry, "save intermediate state", || {
                destination.save_state(state)
            })
            .await;
            if let Err(e) = result {
                error!(path = %self.path.display(), error = %e, "Intermediate state was not saved");
            }
        }
        debug!(path = %self.path.display(), bytes = state.len(), "Intermediate state saved");
        self.last_saved = Some(state.to_vec());
    }
}
