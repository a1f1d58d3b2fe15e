//! Error types for dhctl operations
//!
//! Errors are structured with fields to aid debugging in production. Sentinel
//! conditions that callers branch on (interruption, aborted applies, the
//! single-master migration trigger) are dedicated variants rather than strings.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for dhctl operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for user supplied configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "masterNodeGroup.replicas")
        field: Option<String>,
    },

    /// The external infrastructure tool failed
    #[error("infrastructure error [{step}]: {message}")]
    Infrastructure {
        /// Runner step (base-infrastructure, master-node, static-node)
        step: String,
        /// Captured stderr or a description of the failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being accessed
        context: String,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },

    /// The operation was interrupted; saved state is left intact for resume
    #[error("Interrupted.")]
    ConvergeInterrupted,

    /// A runner command was requested after the runner was stopped
    #[error("infrastructure runner {runner} was stopped")]
    RunnerStopped {
        /// Runner instance name
        runner: String,
    },

    /// The user (or check mode) declined to apply a plan with changes
    #[error("infrastructure apply aborted")]
    ApplyAborted,

    /// The user declined to destroy infrastructure
    #[error("infrastructure destroy aborted")]
    DestroyAborted,

    /// A cached state exists and the user refused to reuse it
    #[error(
        "infrastructure pipeline aborted: cached state {path} was declined; drop the cache and run again",
    )]
    CachedStateDeclined {
        /// Path of the cached state file
        path: String,
    },

    /// Destructive changes require an explicit approval token
    #[error("destructive changes need approval, change id: {change_id}")]
    NeedApproveForDestructiveChange {
        /// The computed DestructiveChangeID the caller has to send back
        change_id: String,
    },

    /// A single-master cluster produced a destructive plan for its master
    #[error("single master cluster plan for {node} has destructive changes")]
    SingleMasterDestructiveChanges {
        /// Master node name
        node: String,
    },

    /// The NodeGroup object changed while it was being updated
    #[error("node group {node_group} changed during update")]
    NodeGroupChanged {
        /// Node group name
        node_group: String,
    },

    /// Expected infrastructure state is missing
    #[error("no infrastructure state found for {what}")]
    NoInfrastructureState {
        /// What the state was looked up for
        what: String,
    },

    /// Master replicas may not be reduced to zero
    #[error(
        "Cannot delete ALL master nodes. If you want to remove cluster use 'dhctl destroy' command",
    )]
    CannotDeleteAllMasters,

    /// The user declined a master deletion that breaks quorum
    #[error(
        "deleting masters to {desired} replicas breaks etcd quorum (required {required}); aborted",
    )]
    QuorumNotConfirmed {
        /// Desired master replicas
        desired: u32,
        /// Replicas required to keep quorum
        required: u32,
    },

    /// The phase handler asked to stop the operation at a phase boundary
    #[error("operation stopped at phase boundary")]
    StopOperation,

    /// A pipeline action was run outside of a running pipeline
    #[error("pipeline did not start")]
    PipelineDidNotStart,

    /// Pipeline::run was called while the pipeline is running
    #[error("pipeline already started")]
    PipelineAlreadyStarted,

    /// Pipeline::run was called after the pipeline finished
    #[error("pipeline already finished")]
    PipelineAlreadyFinished,

    /// The converge lease is held by someone else
    #[error("converge lock is held by {holder}")]
    LockHeld {
        /// Current lease holder identity
        holder: String,
    },

    /// Errors accumulated over several independent steps
    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an infrastructure tool error for a step
    pub fn infrastructure(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Infrastructure {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse accumulated errors: none is success, one is returned as is
    pub fn from_many(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes errors are retryable unless they are 4xx responses.
    /// Sentinels and user input errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Internal { .. } | Error::Io { .. } => true,
            Error::Multiple(errors) => errors.iter().all(Error::is_retryable),
            _ => false,
        }
    }

    /// The API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// The API server answered 409
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// The error stems from an interruption (signal, cancel, lost lease)
    pub fn is_interrupted(&self) -> bool {
        match self {
            Error::ConvergeInterrupted | Error::RunnerStopped { .. } => true,
            Error::Multiple(errors) => errors.iter().any(Error::is_interrupted),
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } | Error::Io { context, .. } => Some(context),
            Error::Infrastructure { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
