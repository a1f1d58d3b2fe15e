//! Operation-wide interruption
//!
//! A [`Tomb`] is created per operation. Signals, a lost converge lease and
//! client cancels all end up in [`Tomb::shutdown`], which cancels the token
//! polled between pipeline steps and stops every registered [`Stoppable`]
//! (runners, the lease renewer) in reverse registration order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Something that must be stopped when the operation is interrupted
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Stop and wait until in-flight work is flushed
    async fn stop(&self);
}

struct Registered {
    name: String,
    target: Arc<dyn Stoppable>,
}

/// Interruption hub of one operation
#[derive(Default)]
pub struct Tomb {
    token: CancellationToken,
    interrupts: AtomicU32,
    registered: Mutex<Vec<Registered>>,
}

impl std::fmt::Debug for Tomb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tomb")
            .field("interrupted", &self.is_interrupted())
            .field("registered", &self.registered.lock().len())
            .finish()
    }
}

impl Tomb {
    /// Create a tomb
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a tomb cancelled together with a parent token
    pub fn with_parent(parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            token: parent.child_token(),
            ..Default::default()
        })
    }

    /// Register a target stopped on shutdown
    pub fn register_on_shutdown(&self, name: impl Into<String>, target: Arc<dyn Stoppable>) {
        let name = name.into();
        debug!(target_name = %name, "Registered on shutdown");
        self.registered.lock().push(Registered { name, target });
    }

    /// Whether shutdown was requested
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once shutdown was requested
    pub async fn interrupted(&self) {
        self.token.cancelled().await
    }

    /// Number of shutdown requests received so far
    pub fn interrupt_count(&self) -> u32 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Request shutdown and stop registered targets.
    ///
    /// Returns how many times shutdown has been requested, including this
    /// call; callers treat a second request as "exit immediately".
    pub async fn shutdown(&self, reason: &str) -> u32 {
        let count = self.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reason = %reason, count, "Shutdown requested");
        self.token.cancel();

        let targets: Vec<Registered> = std::mem::take(&mut *self.registered.lock());
        for registered in targets.into_iter().rev() {
            debug!(target_name = %registered.name, "Stopping");
            registered.target.stop().await;
        }
        count
    }
}
