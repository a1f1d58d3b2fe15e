//! Progress tracking
//!
//! Progress is the fraction of completed phases of the operation. A phase
//! with sub-phases splits its share evenly between them. Every transition is
//! reported through the tracker's callback.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use dhctl_common::{Error, Result};

use crate::phase::{Operation, OperationPhase, PhaseAction, PhaseWithSubPhases, SubPhase};

/// Progress report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Operation being tracked
    pub operation: Operation,
    /// Completed fraction in [0, 1]
    pub progress: f64,
    /// Last completed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_phase: Option<OperationPhase>,
    /// Phase running now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<OperationPhase>,
    /// Phase after the current one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<OperationPhase>,
    /// Last completed sub-phase of the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_sub_phase: Option<SubPhase>,
    /// Sub-phase running now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_sub_phase: Option<SubPhase>,
    /// Sub-phase after the current one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sub_phase: Option<SubPhase>,
    /// Every phase with its action
    pub phases: Vec<PhaseWithSubPhases>,
}

/// Callback receiving every progress report
pub type OnProgress = Box<dyn Fn(&Progress) -> Result<()> + Send + Sync>;

/// Options of a progress transition
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressOpts {
    /// How the completed phase was left
    pub action: PhaseAction,
}

impl ProgressOpts {
    /// Transition marking the phase as skipped
    pub fn skip() -> Self {
        Self {
            action: PhaseAction::Skip,
        }
    }
}

/// Computes and reports progress of one operation
pub struct ProgressTracker {
    operation: Operation,
    phases: Vec<PhaseWithSubPhases>,
    on_progress: Option<OnProgress>,
    last: Option<Progress>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("operation", &self.operation)
            .field("last", &self.last)
            .finish()
    }
}

impl ProgressTracker {
    /// Tracker for an operation's phase list
    pub fn new(operation: Operation, on_progress: Option<OnProgress>) -> Self {
        Self {
            operation,
            phases: operation.phases(),
            on_progress,
            last: None,
        }
    }

    /// Last reported progress
    pub fn last(&self) -> Option<&Progress> {
        self.last.as_ref()
    }

    fn index_of(&self, phase: OperationPhase) -> Option<usize> {
        self.phases.iter().position(|p| p.phase == phase)
    }

    fn last_completed_index(&self) -> Option<usize> {
        self.last
            .as_ref()
            .and_then(|p| p.completed_phase)
            .and_then(|phase| self.index_of(phase))
    }

    fn emit(&mut self, progress: Progress) -> Result<()> {
        self.last = Some(progress.clone());
        match &self.on_progress {
            Some(callback) => callback(&progress),
            None => Ok(()),
        }
    }

    /// Report a transition.
    ///
    /// With `completed_sub_phase` set, the sub-phase of the current phase is
    /// completed and `completed_phase` is ignored. Otherwise `completed_phase`
    /// is completed (`None` reports the start of the operation).
    pub fn progress(
        &mut self,
        completed_phase: Option<OperationPhase>,
        completed_sub_phase: Option<SubPhase>,
        opts: ProgressOpts,
    ) -> Result<()> {
        if let Some(sub) = completed_sub_phase {
            return self.sub_phase_progress(sub);
        }

        let total = self.phases.len();
        let completed_idx = match completed_phase {
            Some(phase) => Some(self.index_of(phase).ok_or_else(|| {
                Error::internal_with_context(
                    "progress",
                    format!("phase {phase} is not part of {}", self.operation),
                )
            })?),
            None => None,
        };

        if let (Some(idx), PhaseAction::Skip) = (completed_idx, opts.action) {
            let from = self.last_completed_index().map(|i| i + 1).unwrap_or(0);
            for phase in self.phases.iter_mut().take(idx + 1).skip(from) {
                phase.action = Some(PhaseAction::Skip);
            }
        }

        let next_idx = completed_idx.map(|i| i + 1).unwrap_or(0);
        let current = self.phases.get(next_idx).cloned();
        let (current_sub, next_sub) = match &current {
            Some(p) => (p.sub_phases.first().copied(), p.sub_phases.get(1).copied()),
            None => (None, None),
        };

        let progress = Progress {
            operation: self.operation,
            progress: next_idx as f64 / total as f64,
            completed_phase,
            current_phase: current.map(|p| p.phase),
            next_phase: self.phases.get(next_idx + 1).map(|p| p.phase),
            completed_sub_phase: None,
            current_sub_phase: current_sub,
            next_sub_phase: next_sub,
            phases: self.phases.clone(),
        };
        self.emit(progress)
    }

    fn sub_phase_progress(&mut self, sub: SubPhase) -> Result<()> {
        let last = self.last.clone().ok_or_else(|| {
            Error::internal_with_context(
                "progress",
                "sub-phase completed before the operation started",
            )
        })?;
        let current = last
            .current_phase
            .ok_or_else(|| {
                Error::internal_with_context(
                    "progress",
                    "sub-phase completed without a current phase",
                )
            })?;
        let idx = self
            .index_of(current)
            .ok_or_else(|| {
                Error::internal_with_context("progress", format!("unknown phase {current}"))
            })?;
        let subs = self.phases[idx].sub_phases.clone();
        let sub_idx = subs.iter().position(|s| *s == sub).ok_or_else(|| {
            Error::internal_with_context(
                "progress",
                format!("{} is not a sub-phase of {current}", sub.as_str()),
            )
        })?;

        let total = self.phases.len() as f64;
        let share = 1.0 / total;
        let progress = Progress {
            operation: self.operation,
            progress: idx as f64 / total + (sub_idx + 1) as f64 / subs.len() as f64 * share,
            completed_phase: last.completed_phase,
            current_phase: Some(current),
            next_phase: last.next_phase,
            completed_sub_phase: Some(sub),
            current_sub_phase: subs.get(sub_idx + 1).copied(),
            next_sub_phase: subs.get(sub_idx + 2).copied(),
            phases: self.phases.clone(),
        };
        self.emit(progress)
    }

    /// Report the operation as finished, skipping what did not run
    pub fn complete(&mut self) -> Result<()> {
        if self.last.as_ref().is_some_and(|p| p.progress >= 1.0) {
            return Ok(());
        }

        let from = self.last_completed_index().map(|i| i + 1).unwrap_or(0);
        for phase in self.phases.iter_mut().skip(from) {
            phase.action = Some(PhaseAction::Skip);
        }

        let progress = Progress {
            operation: self.operation,
            progress: 1.0,
            completed_phase: self.phases.last().map(|p| p.phase),
            current_phase: None,
            next_phase: None,
            completed_sub_phase: None,
            current_sub_phase: None,
            next_sub_phase: None,
            phases: self.phases.clone(),
        };
        self.emit(progress)
    }

    /// Resolve the phase to resume after.
    ///
    /// Returns the last completed phase and whether it was derived from the
    /// current phase rather than given directly.
    pub fn find_last_completed_phase(
        &self,
        last_completed: Option<OperationPhase>,
        current: Option<OperationPhase>,
    ) -> (Option<OperationPhase>, bool) {
        if last_completed.is_some() {
            return (last_completed, false);
        }
        let Some(current) = current else {
            return (None, false);
        };
        match self.index_of(current) {
            Some(0) => (None, true),
            Some(k) => (Some(self.phases[k - 1].phase), true),
            None => (None, false),
        }
    }
}

/// Callback appending every report as one JSON line to a file
pub fn write_progress(path: impl Into<PathBuf>) -> OnProgress {
    let path = path.into();
    Box::new(move |progress: &Progress| {
        let ctx = || path.display().to_string();
        let mut line = serde_json::to_vec(progress)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(ctx(), e))?;
        file.write_all(&line).map_err(|e| Error::io(ctx(), e))
    })
}
