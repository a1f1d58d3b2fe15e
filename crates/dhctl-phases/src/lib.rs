//! Phased execution for dhctl operations
//!
//! Operations are split into named phases. The [`PhasedExecutionContext`]
//! snapshots the state cache at every phase boundary, reports progress, and
//! lets a [`PhaseHandler`] stop the operation between phases. [`Pipeline`]
//! wraps an operation body so nested bodies share one context.

pub mod context;
pub mod phase;
pub mod pipeline;
pub mod progress;

pub use context::{
    ContinueAlways, DhctlState, PhaseBoundary, PhaseHandler, PhaseOutcome, PhasedExecutionContext,
};
pub use phase::{Operation, OperationPhase, PhaseAction, PhaseWithSubPhases, SubPhase};
pub use pipeline::{PhaseSwitcher, Pipeline};
pub use progress::{write_progress, OnProgress, Progress, ProgressOpts, ProgressTracker};
