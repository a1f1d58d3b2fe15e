//! Infrastructure runner for dhctl
//!
//! Wraps the external declarative infrastructure tool: runs init, plan,
//! apply and destroy for one layout step, classifies plans, and mirrors the
//! tool's state file into its destinations while it changes.

pub mod context;
pub mod executor;
pub mod hook;
pub mod outputs;
pub mod pipelines;
pub mod plan;
pub mod runner;
pub mod saver;

pub use context::{
    BaseInfraRunnerOptions, ExecutorFactory, InfrastructureContext, NodeRunnerOptions,
    ToolExecutorFactory,
};
pub use executor::{Executor, ExecutorSettings, ToolExecutor};
pub use hook::InfraActionHook;
pub use outputs::{
    master_ip_from_state, state_output, BaseInfraOutputs, MasterNodeOutputs, OnlyState,
    OutputsExtractor, PipelineOutputs,
};
pub use pipelines::{
    apply_pipeline, check_base_infrastructure_pipeline, check_destroy_pipeline, check_pipeline,
    destroy_pipeline, BaseInfraCheck, BaseInfrastructureDestructiveChanges, PlanCheck,
};
pub use plan::{PlanChanges, PlanDestructiveChanges, PlanReport, ValueChange};
pub use runner::{step_working_dir, ChangeSettings, Runner, RunnerParams, Step};
pub use saver::{only_state, CacheDestination, SaverDestination, StateSaver};
