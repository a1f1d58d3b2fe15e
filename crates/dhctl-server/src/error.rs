//! Errors of the gateway and worker processes

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tonic::Status;

/// Errors of the RPC surface
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listening or connecting failed
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Socket or temp directory handling failed
    #[error("io error [{context}]: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker process could not be spawned
    #[error("failed to start worker: {0}")]
    WorkerStart(String),

    /// The worker did not report SERVING in time
    #[error("worker at {socket} did not become healthy within {timeout:?}")]
    WorkerUnhealthy { socket: PathBuf, timeout: Duration },

    /// Failure of the operation itself
    #[error(transparent)]
    Operation(#[from] dhctl_common::Error),
}

impl ServerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<ServerError> for Status {
    fn from(err: ServerError) -> Self {
        match &err {
            ServerError::WorkerStart(_) | ServerError::WorkerUnhealthy { .. } => {
                Status::unavailable(err.to_string())
            }
            ServerError::Operation(dhctl_common::Error::Validation { .. }) => {
                Status::invalid_argument(err.to_string())
            }
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Result type alias of the server crate
pub type Result<T> = std::result::Result<T, ServerError>;
