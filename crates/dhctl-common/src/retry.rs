//! Retry utilities with backoff and jitter.
//!
//! Cluster writes (state Secrets, NodeGroups) and stream sends may fail
//! transiently. Every such call goes through [`retry_with_backoff`] or
//! [`retry_with_backoff_if`] with a [`RetryConfig`] describing the loop.
//!
//! ```ignore
//! use dhctl_common::retry::{retry_with_backoff, RetryConfig};
//!
//! retry_with_backoff(&RetryConfig::state_save(), "save cluster state", || async {
//!     client.create_or_update_secret(&secret).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = linear)
    pub backoff_multiplier: f64,
    /// Randomize each delay by 0.5x to 1.5x
    pub jitter: bool,
    /// Log intermediate failures at debug instead of warn
    pub silent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            silent: false,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Fixed-interval retries without jitter
    pub fn linear(attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
            silent: false,
        }
    }

    /// Loop used when persisting infrastructure state into the cluster
    pub fn state_save() -> Self {
        Self::linear(45, Duration::from_secs(10))
    }

    /// Loop used when sending a message over an RPC stream
    pub fn stream_send() -> Self {
        Self::linear(10, Duration::from_millis(100))
    }

    /// Suppress warn-level logging of intermediate failures
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Execute an async operation with backoff until success or exhaustion.
///
/// Returns the result of the operation, or the last error once
/// `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but stops at the first error for which
/// `should_retry` returns false.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                } else {
                    delay
                };

                if config.silent {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        delay_ms = sleep_for.as_millis(),
                        "Operation failed, retrying"
                    );
                } else {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        delay_ms = sleep_for.as_millis(),
                        "Operation failed, retrying"
                    );
                }

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::linear(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_state_save_eventually_succeeds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<&str, String> = retry_with_backoff(&fast(5), "save", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("apiserver unavailable".to_string())
                } else {
                    Ok("saved")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("saved"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> = retry_with_backoff(&fast(3), "send", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("stream closed")
            }
        })
        .await;

        assert_eq!(result, Err("stream closed"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> = retry_with_backoff_if(
            &fast(10),
            "update",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("conflict")
                }
            },
            |e| *e != "conflict",
        )
        .await;

        assert_eq!(result, Err("conflict"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_presets() {
        let save = RetryConfig::state_save();
        assert_eq!(save.max_attempts, 45);
        assert_eq!(save.initial_delay, Duration::from_secs(10));
        assert!(!save.jitter);

        let send = RetryConfig::stream_send();
        assert_eq!(send.max_attempts, 10);
        assert_eq!(send.max_delay, Duration::from_millis(100));
        assert!(RetryConfig::stream_send().silent().silent);
    }
}
