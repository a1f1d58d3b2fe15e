//! Pipeline wrapper around the phased execution context
//!
//! A [`Pipeline`] brackets an operation body with `init_pipeline`,
//! `complete_pipeline` and `finalize`, and runs phases inside it. A stop
//! requested at a phase boundary surfaces as [`Error::StopOperation`] inside
//! the body and as success from [`Pipeline::run`].

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use dhctl_common::cache::StateCache;
use dhctl_common::{Error, Result};

use crate::context::{DhctlState, PhasedExecutionContext};
use crate::phase::OperationPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineStatus {
    NotStarted,
    Running,
    Finished,
}

/// Moves a running pipeline to its next phase
#[derive(Clone)]
pub struct PhaseSwitcher {
    ctx: Option<Arc<PhasedExecutionContext>>,
    cache: Arc<dyn StateCache>,
}

impl PhaseSwitcher {
    /// Complete the current phase and start `phase`
    pub async fn switch(
        &self,
        phase: OperationPhase,
        critical: bool,
        data: Option<Value>,
    ) -> Result<()> {
        let Some(ctx) = &self.ctx else {
            return Ok(());
        };
        if ctx.switch_phase(phase, critical, self.cache.as_ref(), data).await? {
            return Err(Error::StopOperation);
        }
        Ok(())
    }
}

/// One run of an operation body
pub struct Pipeline {
    name: String,
    ctx: Option<Arc<PhasedExecutionContext>>,
    cache: Arc<dyn StateCache>,
    status: Mutex<PipelineStatus>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl Pipeline {
    /// Pipeline tracked by a phased execution context
    pub fn new(
        name: impl Into<String>,
        ctx: Arc<PhasedExecutionContext>,
        cache: Arc<dyn StateCache>,
    ) -> Self {
        Self {
            name: name.into(),
            ctx: Some(ctx),
            cache,
            status: Mutex::new(PipelineStatus::NotStarted),
        }
    }

    /// Pipeline that runs its body without tracking phases
    pub fn dummy(name: impl Into<String>, cache: Arc<dyn StateCache>) -> Self {
        Self {
            name: name.into(),
            ctx: None,
            cache,
            status: Mutex::new(PipelineStatus::NotStarted),
        }
    }

    /// Run the body once
    pub async fn run<F, Fut>(&self, action: F) -> Result<()>
    where
        F: FnOnce(PhaseSwitcher) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        {
            let mut status = self.status.lock();
            match *status {
                PipelineStatus::Running => return Err(Error::PipelineAlreadyStarted),
                PipelineStatus::Finished => return Err(Error::PipelineAlreadyFinished),
                PipelineStatus::NotStarted => *status = PipelineStatus::Running,
            }
        }
        debug!(pipeline = %self.name, "Pipeline started");

        let result = self.run_tracked(action).await;
        *self.status.lock() = PipelineStatus::Finished;
        debug!(pipeline = %self.name, ok = result.is_ok(), "Pipeline finished");

        match result {
            Err(Error::StopOperation) => Ok(()),
            other => other,
        }
    }

    async fn run_tracked<F, Fut>(&self, action: F) -> Result<()>
    where
        F: FnOnce(PhaseSwitcher) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let switcher = PhaseSwitcher {
            ctx: self.ctx.clone(),
            cache: self.cache.clone(),
        };
        let Some(ctx) = &self.ctx else {
            return action(switcher).await;
        };

        ctx.init_pipeline(self.cache.as_ref())?;
        let mut result = action(switcher).await;
        if result.is_ok() {
            result = ctx.complete_pipeline(self.cache.as_ref()).await;
        }
        ctx.finalize(self.cache.as_ref())?;
        result
    }

    /// Run one phase of the running pipeline.
    ///
    /// The action returns the data reported with the phase boundary.
    pub async fn run_phase<F, Fut>(
        &self,
        phase: OperationPhase,
        critical: bool,
        action: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        if *self.status.lock() != PipelineStatus::Running {
            return Err(Error::PipelineDidNotStart);
        }
        let Some(ctx) = &self.ctx else {
            action().await?;
            return Ok(());
        };

        if ctx.start_phase(phase, critical, self.cache.as_ref()).await? {
            return Err(Error::StopOperation);
        }
        let data = action().await?;
        ctx.complete_phase(self.cache.as_ref(), data)
    }

    /// Report a phase of the running pipeline that will not run
    pub fn skip_phase(&self, phase: OperationPhase) -> Result<()> {
        if *self.status.lock() != PipelineStatus::Running {
            return Err(Error::PipelineDidNotStart);
        }
        match &self.ctx {
            Some(ctx) => ctx.skip_phase(phase),
            None => Ok(()),
        }
    }

    /// Whether a phase handler stopped the operation
    pub fn is_stopped(&self) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.is_stopped())
    }

    /// State at the last snapshot (empty for untracked pipelines)
    pub fn last_state(&self) -> DhctlState {
        self.ctx.as_ref().map(|ctx| ctx.last_state()).unwrap_or_default()
    }
}
