//! Bound on concurrently running operations

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tonic::Status;
use tracing::warn;

/// Semaphore guarding operation slots
#[derive(Debug, Clone)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    timeout: Duration,
}

impl Limiter {
    pub fn new(limit: usize, timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            timeout,
        }
    }

    /// Take a slot, waiting at most the configured timeout.
    ///
    /// The slot is held until the returned permit is dropped.
    pub async fn acquire(&self, method: &str) -> Result<OwnedSemaphorePermit, Status> {
        match tokio::time::timeout(self.timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Status::unavailable("server is shutting down")),
            Err(_) => {
                warn!(method = %method, limit = self.limit, "Too many parallel operations");
                Err(Status::resource_exhausted(format!(
                    "too many parallel operations, limit is {}",
                    self.limit
                )))
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots taken right now
    pub fn running(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Fail every pending and future acquire
    pub fn close(&self) {
        self.semaphore.close();
    }
}
