//! Phased execution context
//!
//! Tracks the phases of one operation, snapshots the state cache at every
//! phase boundary and hands each boundary to a [`PhaseHandler`]. The RPC
//! worker implements the handler by sending `PhaseEnd` and waiting for the
//! client's `Continue`; the CLI continues unconditionally.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use dhctl_common::cache::StateCache;
use dhctl_common::Result;

use crate::phase::{Operation, OperationPhase, SubPhase};
use crate::progress::{OnProgress, ProgressOpts, ProgressTracker};

/// Snapshot of every key of the state cache
pub type DhctlState = BTreeMap<String, Vec<u8>>;

/// A phase boundary reported to the handler
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseBoundary {
    /// Phase that just completed (`None` before the first one)
    pub completed_phase: Option<OperationPhase>,
    /// Cache snapshot taken when it completed
    pub completed_phase_state: DhctlState,
    /// Data the completed phase produced
    pub completed_phase_data: Option<Value>,
    /// Phase about to start (`None` at the end of the pipeline)
    pub next_phase: Option<OperationPhase>,
    /// Whether interrupting the next phase can leave the cluster broken
    pub next_phase_critical: bool,
}

/// What to do after a phase boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Go on with the next phase
    Continue,
    /// Stop the operation; no further phase runs
    StopOperation,
}

/// Receives phase boundaries
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Decide how to go on after a boundary
    async fn on_phase(&self, boundary: PhaseBoundary) -> Result<PhaseOutcome>;
}

/// Handler that always continues
#[derive(Debug, Default, Clone, Copy)]
pub struct ContinueAlways;

#[async_trait]
impl PhaseHandler for ContinueAlways {
    async fn on_phase(&self, _boundary: PhaseBoundary) -> Result<PhaseOutcome> {
        Ok(PhaseOutcome::Continue)
    }
}

#[derive(Debug, Default)]
struct ContextState {
    current_phase: Option<OperationPhase>,
    completed_phase: Option<OperationPhase>,
    completed_phase_data: Option<Value>,
    last_state: DhctlState,
    pipeline_depth: u32,
    stopped: bool,
}

/// Phase state machine of one operation
pub struct PhasedExecutionContext {
    operation: Operation,
    handler: Arc<dyn PhaseHandler>,
    progress: Mutex<ProgressTracker>,
    state: Mutex<ContextState>,
}

impl std::fmt::Debug for PhasedExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhasedExecutionContext")
            .field("operation", &self.operation)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PhasedExecutionContext {
    /// Context for an operation
    pub fn new(
        operation: Operation,
        handler: Arc<dyn PhaseHandler>,
        on_progress: Option<OnProgress>,
    ) -> Arc<Self> {
        Arc::new(Self {
            operation,
            handler,
            progress: Mutex::new(ProgressTracker::new(operation, on_progress)),
            state: Mutex::new(ContextState::default()),
        })
    }

    /// Operation tracked by the context
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Snapshot the cache and enter a (possibly nested) pipeline
    pub fn init_pipeline(&self, cache: &dyn StateCache) -> Result<()> {
        let snapshot = cache.snapshot()?;
        let first = {
            let mut state = self.state.lock();
            state.last_state = snapshot;
            state.pipeline_depth += 1;
            state.pipeline_depth == 1 && state.completed_phase.is_none()
        };
        if first {
            self.progress.lock().progress(None, None, ProgressOpts::default())?;
        }
        Ok(())
    }

    /// Enter a phase. Returns true when the operation must stop instead.
    pub async fn start_phase(
        &self,
        phase: OperationPhase,
        critical: bool,
        _cache: &dyn StateCache,
    ) -> Result<bool> {
        let boundary = {
            let mut state = self.state.lock();
            if state.stopped {
                return Ok(true);
            }
            state.current_phase = Some(phase);
            if state.completed_phase.is_none() {
                None
            } else {
                Some(PhaseBoundary {
                    completed_phase: state.completed_phase,
                    completed_phase_state: state.last_state.clone(),
                    completed_phase_data: state.completed_phase_data.clone(),
                    next_phase: Some(phase),
                    next_phase_critical: critical,
                })
            }
        };

        info!(operation = %self.operation, phase = %phase, critical, "Starting phase");
        let Some(boundary) = boundary else {
            return Ok(false);
        };

        match self.handler.on_phase(boundary).await? {
            PhaseOutcome::Continue => Ok(false),
            PhaseOutcome::StopOperation => {
                info!(
                    operation = %self.operation,
                    phase = %phase,
                    "Operation stopped before phase"
                );
                self.state.lock().stopped = true;
                Ok(true)
            }
        }
    }

    /// Complete the current phase, snapshotting the cache
    pub fn complete_phase(&self, cache: &dyn StateCache, data: Option<Value>) -> Result<()> {
        let snapshot = cache.snapshot()?;
        let completed = {
            let mut state = self.state.lock();
            let completed = state.current_phase.take();
            if completed.is_some() {
                state.completed_phase = completed;
            }
            state.completed_phase_data = data;
            state.last_state = snapshot;
            completed
        };
        if let Some(phase) = completed {
            debug!(operation = %self.operation, phase = %phase, "Phase completed");
            self.progress.lock().progress(Some(phase), None, ProgressOpts::default())?;
        }
        Ok(())
    }

    /// Report a phase that will not run
    pub fn skip_phase(&self, phase: OperationPhase) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Ok(());
            }
            // a skipped phase produces no boundary for the handler
            state.current_phase = None;
        }
        info!(operation = %self.operation, phase = %phase, "Phase skipped");
        self.progress.lock().progress(Some(phase), None, ProgressOpts::skip())
    }

    /// Report a completed sub-phase of the current phase
    pub fn complete_sub_phase(&self, sub_phase: SubPhase) -> Result<()> {
        self.progress.lock().progress(None, Some(sub_phase), ProgressOpts::default())
    }

    /// Complete the current phase and start the next one
    pub async fn switch_phase(
        &self,
        phase: OperationPhase,
        critical: bool,
        cache: &dyn StateCache,
        data: Option<Value>,
    ) -> Result<bool> {
        if self.is_stopped() {
            return Ok(true);
        }
        self.complete_phase(cache, data)?;
        self.start_phase(phase, critical, cache).await
    }

    /// Leave a pipeline; the outermost one reports the final boundary
    pub async fn complete_pipeline(&self, _cache: &dyn StateCache) -> Result<()> {
        let boundary = {
            let mut state = self.state.lock();
            state.pipeline_depth = state.pipeline_depth.saturating_sub(1);
            if state.pipeline_depth > 0 || state.stopped {
                return Ok(());
            }
            state.completed_phase.map(|completed| PhaseBoundary {
                completed_phase: Some(completed),
                completed_phase_state: state.last_state.clone(),
                completed_phase_data: state.completed_phase_data.clone(),
                next_phase: None,
                next_phase_critical: false,
            })
        };

        if let Some(boundary) = boundary {
            // the pipeline is over, stopping changes nothing
            self.handler.on_phase(boundary).await?;
        }
        self.progress.lock().complete()
    }

    /// Refresh the last state unless the operation was stopped
    pub fn finalize(&self, cache: &dyn StateCache) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let snapshot = cache.snapshot()?;
        self.state.lock().last_state = snapshot;
        Ok(())
    }

    /// State at the last successful snapshot
    pub fn last_state(&self) -> DhctlState {
        self.state.lock().last_state.clone()
    }

    /// Whether the handler stopped the operation
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Phase running now
    pub fn current_phase(&self) -> Option<OperationPhase> {
        self.state.lock().current_phase
    }

    /// Last completed phase
    pub fn completed_phase(&self) -> Option<OperationPhase> {
        self.state.lock().completed_phase
    }

    #[cfg(test)]
    pub(crate) fn force_stop(&self) {
        self.state.lock().stopped = true;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dhctl_common::cache::MemoryCache;

    /// Handler recording boundaries and answering from a script
    pub(crate) struct ScriptedHandler {
        pub(crate) seen: Mutex<Vec<PhaseBoundary>>,
        pub(crate) stop_before: Option<OperationPhase>,
    }

    impl ScriptedHandler {
        pub(crate) fn new(stop_before: Option<OperationPhase>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                stop_before,
            })
        }
    }

    #[async_trait]
    impl PhaseHandler for ScriptedHandler {
        async fn on_phase(&self, boundary: PhaseBoundary) -> Result<PhaseOutcome> {
            let stop = boundary.next_phase.is_some() && boundary.next_phase == self.stop_before;
            self.seen.lock().push(boundary);
            Ok(if stop {
                PhaseOutcome::StopOperation
            } else {
                PhaseOutcome::Continue
            })
        }
    }

    // ==========================================================================
    // Story Tests: Converge Phase Boundaries
    // ==========================================================================

    /// Story: every phase boundary carries the state of the phase before it
    #[tokio::test]
    async fn story_converge_reports_each_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(dir.path());
        let handler = ScriptedHandler::new(None);
        let ctx = PhasedExecutionContext::new(Operation::Converge, handler.clone(), None);

        ctx.init_pipeline(&cache).unwrap();
        assert!(!ctx.start_phase(OperationPhase::BaseInfrastructure, true, &cache).await.unwrap());
        cache.save("base-infrastructure.tfstate", b"v1").unwrap();
        let data = Some(serde_json::json!({"ok": true}));
        assert!(!ctx
            .switch_phase(OperationPhase::AllNodes, false, &cache, data)
            .await
            .unwrap());
        cache.save("master-0.tfstate", b"m0").unwrap();
        assert!(!ctx
            .switch_phase(OperationPhase::DeckhouseConfiguration, false, &cache, None)
            .await
            .unwrap());
        ctx.complete_phase(&cache, None).unwrap();
        ctx.complete_pipeline(&cache).await.unwrap();
        ctx.finalize(&cache).unwrap();

        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].completed_phase, Some(OperationPhase::BaseInfrastructure));
        assert_eq!(seen[0].next_phase, Some(OperationPhase::AllNodes));
        assert_eq!(seen[0].completed_phase_state.len(), 1);
        assert_eq!(seen[0].completed_phase_data, Some(serde_json::json!({"ok": true})));
        assert_eq!(seen[1].completed_phase_state.len(), 2);
        // end of pipeline
        assert_eq!(seen[2].completed_phase, Some(OperationPhase::DeckhouseConfiguration));
        assert_eq!(seen[2].next_phase, None);
        assert!(!seen[2].next_phase_critical);
    }

    /// Story: once the client stops the operation no later phase runs and
    /// the last state stays at the last committed snapshot
    #[tokio::test]
    async fn story_stop_operation_skips_remaining_phases() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(dir.path());
        let handler = ScriptedHandler::new(Some(OperationPhase::AllNodes));
        let ctx = PhasedExecutionContext::new(Operation::Converge, handler.clone(), None);

        ctx.init_pipeline(&cache).unwrap();
        assert!(!ctx.start_phase(OperationPhase::BaseInfrastructure, true, &cache).await.unwrap());
        cache.save("base", b"v1").unwrap();
        let should_stop = ctx
            .switch_phase(OperationPhase::AllNodes, false, &cache, None)
            .await
            .unwrap();
        assert!(should_stop);
        assert!(ctx.is_stopped());

        // later writes never make it into the last state
        cache.save("nodes", b"n").unwrap();
        assert!(ctx
            .start_phase(OperationPhase::DeckhouseConfiguration, false, &cache)
            .await
            .unwrap());
        ctx.complete_pipeline(&cache).await.unwrap();
        ctx.finalize(&cache).unwrap();

        assert_eq!(handler.seen.lock().len(), 1);
        let last = ctx.last_state();
        assert_eq!(last.keys().collect::<Vec<_>>(), vec!["base"]);
    }

    #[tokio::test]
    async fn test_nested_pipeline_reports_end_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(dir.path());
        let handler = ScriptedHandler::new(None);
        let ctx = PhasedExecutionContext::new(Operation::Check, handler.clone(), None);

        ctx.init_pipeline(&cache).unwrap();
        ctx.init_pipeline(&cache).unwrap();
        ctx.start_phase(OperationPhase::Check, false, &cache).await.unwrap();
        ctx.complete_phase(&cache, None).unwrap();
        ctx.complete_pipeline(&cache).await.unwrap();
        assert!(handler.seen.lock().is_empty());
        ctx.complete_pipeline(&cache).await.unwrap();
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_first_phase_has_no_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(dir.path());
        let handler = ScriptedHandler::new(Some(OperationPhase::BaseInfrastructure));
        let ctx = PhasedExecutionContext::new(Operation::Converge, handler.clone(), None);

        ctx.init_pipeline(&cache).unwrap();
        assert!(!ctx.start_phase(OperationPhase::BaseInfrastructure, true, &cache).await.unwrap());
        assert!(handler.seen.lock().is_empty());
        assert_eq!(ctx.current_phase(), Some(OperationPhase::BaseInfrastructure));
    }
}
