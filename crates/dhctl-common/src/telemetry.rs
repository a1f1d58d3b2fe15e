//! Tracing subscriber initialization
//!
//! Sets up a `tracing-subscriber` registry with an `EnvFilter` (overridable via
//! `RUST_LOG`) and either a human readable or a JSON formatter. The worker
//! process passes an extra layer that forwards log lines into the active RPC
//! stream.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// Unknown log format name
    #[error("unknown log format: {0} (expected text or json)")]
    UnknownFormat(String),
}

/// Output format of the process logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(TelemetryError::UnknownFormat(other.to_string())),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log line format
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Lower the default filter to debug
    pub debug: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            default_filter: "info,kube=warn,tower=warn,hyper=warn,h2=warn".to_string(),
            debug: false,
        }
    }
}

impl TelemetryConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if self.debug {
                EnvFilter::new("debug,kube=info,tower=warn,hyper=warn,h2=warn")
            } else {
                EnvFilter::new(&self.default_filter)
            }
        })
    }
}

/// A layer installed next to the formatter, e.g. the RPC log forwarder
pub type ExtraLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize tracing for the process
pub fn init_tracing(config: TelemetryConfig) -> Result<(), TelemetryError> {
    init_tracing_with_layer(config, None)
}

/// Initialize tracing with an additional layer sharing the same filter
pub fn init_tracing_with_layer(
    config: TelemetryConfig,
    extra: Option<ExtraLayer>,
) -> Result<(), TelemetryError> {
    let extra = extra.map(|layer| layer.with_filter(config.filter()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(extra)
        .with(fmt_layer.with_filter(config.filter()))
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}
