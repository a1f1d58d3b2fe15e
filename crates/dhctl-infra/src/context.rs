//! Runner factories
//!
//! [`InfrastructureContext`] is the only place runners are constructed. Each
//! factory fixes the change settings for one kind of operation so callers
//! cannot build, for instance, a check runner that applies.

use std::path::PathBuf;
use std::sync::Arc;

use dhctl_common::cache::{DummyCache, StateCache};
use dhctl_common::config::MetaConfig;
use dhctl_common::confirm::Confirm;
use dhctl_common::tomb::Tomb;
use dhctl_common::Result;

use crate::executor::{Executor, ExecutorSettings, ToolExecutor};
use crate::hook::InfraActionHook;
use crate::runner::{step_working_dir, ChangeSettings, Runner, RunnerParams, Step};
use crate::saver::SaverDestination;

/// Options of a base-infrastructure runner
#[derive(Default)]
pub struct BaseInfraRunnerOptions {
    /// State held in the cluster; `None` uses the cache
    pub state: Option<Vec<u8>>,
    pub auto_approve: bool,
    pub destinations: Vec<Arc<dyn SaverDestination>>,
}

/// Options of a node runner
#[derive(Default)]
pub struct NodeRunnerOptions {
    pub node_group: String,
    pub node_index: u32,
    pub node_name: String,
    pub cloud_config: String,
    /// State held in the cluster; `None` uses the cache
    pub state: Option<Vec<u8>>,
    /// Historical node-group settings overlaid into the config
    pub node_group_settings: Option<Vec<u8>>,
    pub auto_approve: bool,
    pub destinations: Vec<Arc<dyn SaverDestination>>,
    pub hook: Option<Arc<dyn InfraActionHook>>,
}

/// Builds executors for a step working directory
pub trait ExecutorFactory: Send + Sync {
    fn executor(&self, step: Step, working_dir: PathBuf) -> Arc<dyn Executor>;
}

/// Spawns the real tool binary
#[derive(Debug, Clone)]
pub struct ToolExecutorFactory {
    settings: ExecutorSettings,
}

impl ToolExecutorFactory {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }
}

impl ExecutorFactory for ToolExecutorFactory {
    fn executor(&self, step: Step, working_dir: PathBuf) -> Arc<dyn Executor> {
        Arc::new(ToolExecutor::new(self.settings.clone(), step.as_str(), working_dir))
    }
}

/// Creates runners of one operation and registers them on its tomb
pub struct InfrastructureContext {
    modules_dir: PathBuf,
    tmp_dir: PathBuf,
    cache: Arc<dyn StateCache>,
    confirm: Arc<dyn Confirm>,
    tomb: Arc<Tomb>,
    executors: Arc<dyn ExecutorFactory>,
    commander_mode: bool,
}

impl std::fmt::Debug for InfrastructureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfrastructureContext")
            .field("modules_dir", &self.modules_dir)
            .field("tmp_dir", &self.tmp_dir)
            .field("commander_mode", &self.commander_mode)
            .finish()
    }
}

impl InfrastructureContext {
    pub fn new(
        modules_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        cache: Arc<dyn StateCache>,
        confirm: Arc<dyn Confirm>,
        tomb: Arc<Tomb>,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            tmp_dir: tmp_dir.into(),
            cache,
            confirm,
            tomb,
            executors,
            commander_mode: false,
        }
    }

    /// Cluster state lives in the local cache only
    pub fn with_commander_mode(mut self, commander_mode: bool) -> Self {
        self.commander_mode = commander_mode;
        self
    }

    pub fn commander_mode(&self) -> bool {
        self.commander_mode
    }

    pub fn cache(&self) -> &Arc<dyn StateCache> {
        &self.cache
    }

    pub fn tomb(&self) -> &Arc<Tomb> {
        &self.tomb
    }

    fn build(&self, params: RunnerParams, cache: Arc<dyn StateCache>) -> Result<Arc<Runner>> {
        let executor = self.executors.executor(params.step, params.working_dir.clone());
        let runner = Arc::new(Runner::new(params, cache, self.confirm.clone(), executor)?);
        self.tomb
            .register_on_shutdown(
                format!("infrastructure runner {}", runner.name()),
                runner.clone(),
            );
        Ok(runner)
    }

    fn params(&self, meta: &MetaConfig, step: Step, variables: Vec<u8>) -> RunnerParams {
        let working_dir = step_working_dir(
            &self.modules_dir,
            &meta.provider_name,
            &meta.layout,
            step,
        );
        RunnerParams::new(step, working_dir, self.tmp_dir.clone(), variables)
    }

    fn base_params(&self, meta: &MetaConfig) -> Result<RunnerParams> {
        Ok(self.params(meta, Step::BaseInfrastructure, meta.marshal_config()?))
    }

    fn node_params(&self, meta: &MetaConfig, opts: &NodeRunnerOptions) -> Result<RunnerParams> {
        let variables = match &opts.node_group_settings {
            Some(settings) => meta
                .with_node_group_settings(&opts.node_group, settings)?
                .node_group_config(&opts.node_group, opts.node_index, &opts.cloud_config)?,
            None => meta.node_group_config(&opts.node_group, opts.node_index, &opts.cloud_config)?,
        };
        let mut params = self.params(meta, Step::for_node_group(&opts.node_group), variables);
        params.name = Some(opts.node_name.clone());
        Ok(params)
    }

    /// Check runners never touch the cache outside commander mode
    fn check_cache(&self) -> Arc<dyn StateCache> {
        if self.commander_mode {
            self.cache.clone()
        } else {
            Arc::new(DummyCache::new(self.cache.dir()))
        }
    }

    fn check_settings() -> ChangeSettings {
        ChangeSettings {
            auto_approve: false,
            auto_dismiss_destructive: true,
            auto_dismiss_changes: true,
            skip_changes_on_deny: true,
        }
    }

    pub fn base_infra_runner_for_converge(
        &self,
        meta: &MetaConfig,
        opts: BaseInfraRunnerOptions,
    ) -> Result<Arc<Runner>> {
        let mut params = self.base_params(meta)?;
        params.state = opts.state;
        params.destinations = opts.destinations;
        params.settings = ChangeSettings {
            auto_approve: opts.auto_approve,
            skip_changes_on_deny: true,
            ..Default::default()
        };
        self.build(params, self.cache.clone())
    }

    pub fn base_infra_runner_for_check(
        &self,
        meta: &MetaConfig,
        state: Option<Vec<u8>>,
    ) -> Result<Arc<Runner>> {
        let mut params = self.base_params(meta)?;
        params.state = state;
        params.settings = Self::check_settings();
        params.allowed_cached_state = true;
        self.build(params, self.check_cache())
    }

    pub fn base_infra_runner_for_destroy(
        &self,
        meta: &MetaConfig,
        state: Option<Vec<u8>>,
        auto_approve: bool,
    ) -> Result<Arc<Runner>> {
        let mut params = self.base_params(meta)?;
        params.state = state;
        params.allowed_cached_state = true;
        params.settings.auto_approve = auto_approve;
        self.build(params, self.cache.clone())
    }

    pub fn base_infra_runner_for_bootstrap(&self, meta: &MetaConfig) -> Result<Arc<Runner>> {
        let mut params = self.base_params(meta)?;
        params.settings.auto_approve = true;
        self.build(params, self.cache.clone())
    }

    pub fn node_runner_for_converge(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> Result<Arc<Runner>> {
        let mut params = self.node_params(meta, &opts)?;
        params.state = opts.state;
        params.destinations = opts.destinations;
        params.hook = opts.hook;
        params.settings = ChangeSettings {
            auto_approve: opts.auto_approve,
            skip_changes_on_deny: true,
            ..Default::default()
        };
        self.build(params, self.cache.clone())
    }

    pub fn node_runner_for_check(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> Result<Arc<Runner>> {
        let mut params = self.node_params(meta, &opts)?;
        params.state = opts.state;
        params.settings = Self::check_settings();
        params.allowed_cached_state = true;
        self.build(params, self.check_cache())
    }

    /// Runner destroying a node that is no longer wanted
    pub fn node_runner_for_delete(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> Result<Arc<Runner>> {
        let mut params = self.node_params(meta, &opts)?;
        params.state = opts.state;
        params.destinations = opts.destinations;
        params.hook = opts.hook;
        params.allowed_cached_state = true;
        params.settings = ChangeSettings {
            auto_approve: opts.auto_approve,
            skip_changes_on_deny: true,
            ..Default::default()
        };
        self.build(params, self.cache.clone())
    }

    pub fn node_runner_for_destroy(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> Result<Arc<Runner>> {
        let mut params = self.node_params(meta, &opts)?;
        params.state = opts.state;
        params.allowed_cached_state = true;
        params.settings.auto_approve = opts.auto_approve;
        self.build(params, self.cache.clone())
    }

    pub fn node_runner_for_bootstrap(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> Result<Arc<Runner>> {
        let mut params = self.node_params(meta, &opts)?;
        params.destinations = opts.destinations;
        params.settings.auto_approve = true;
        self.build(params, self.cache.clone())
    }
}
