//! Infrastructure runner
//!
//! A [`Runner`] drives the external tool for one (step, instance) pair: it
//! chooses the state file, computes and classifies a plan, decides whether
//! the plan may be applied, and keeps the intermediate state saver running
//! while the tool mutates the cloud.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use dhctl_common::cache::StateCache;
use dhctl_common::confirm::Confirm;
use dhctl_common::tomb::Stoppable;
use dhctl_common::{Error, Result, MASTER_NODE_GROUP_NAME};

use crate::executor::{ApplyOpts, DestroyOpts, Executor, PlanOpts, HAS_CHANGES_EXIT_CODE};
use crate::hook::InfraActionHook;
use crate::plan::{PlanChanges, PlanDestructiveChanges, PlanReport};
use crate::saver::{SaverDestination, StateSaver};

const STATE_SUFFIX: &str = ".tfstate";
const PLAN_SUFFIX: &str = ".tfplan";
const VARIABLES_PREFIX: &str = "cluster-config.auto.";
const VARIABLES_SUFFIX: &str = ".tfvars.json";
const PROVIDER_LOCK_FILE: &str = ".terraform.lock.hcl";

/// Layout step a runner executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    BaseInfrastructure,
    MasterNode,
    StaticNode,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::BaseInfrastructure => "base-infrastructure",
            Step::MasterNode => "master-node",
            Step::StaticNode => "static-node",
        }
    }

    /// Step creating nodes of `node_group`
    pub fn for_node_group(node_group: &str) -> Self {
        if node_group == MASTER_NODE_GROUP_NAME {
            Step::MasterNode
        } else {
            Step::StaticNode
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<modules>/<provider>/layouts/<layout>/<step>`
pub fn step_working_dir(modules_dir: &Path, provider: &str, layout: &str, step: Step) -> PathBuf {
    modules_dir
        .join(provider)
        .join("layouts")
        .join(layout)
        .join(step.as_str())
}

/// What the runner may do with a plan without asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSettings {
    /// Apply and destroy without confirmation
    pub auto_approve: bool,
    /// Silently skip plans that delete resources
    pub auto_dismiss_destructive: bool,
    /// Never apply a plan with changes (check mode)
    pub auto_dismiss_changes: bool,
    /// A denied confirmation skips the apply instead of failing
    pub skip_changes_on_deny: bool,
}

/// Everything a runner is configured with
pub struct RunnerParams {
    pub step: Step,
    /// Instance name; defaults to the step name
    pub name: Option<String>,
    pub working_dir: PathBuf,
    /// Directory for temporary state, plan and variable files
    pub tmp_dir: PathBuf,
    /// Variables passed to the tool as a JSON var-file
    pub variables: Vec<u8>,
    /// Prior state; when absent the state lives in the cache
    pub state: Option<Vec<u8>>,
    pub settings: ChangeSettings,
    /// Reuse a cached state without asking
    pub allowed_cached_state: bool,
    /// Additional destinations of the intermediate state saver
    pub destinations: Vec<Arc<dyn SaverDestination>>,
    pub hook: Option<Arc<dyn InfraActionHook>>,
}

impl RunnerParams {
    pub fn new(
        step: Step,
        working_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        variables: Vec<u8>,
    ) -> Self {
        Self {
            step,
            name: None,
            working_dir: working_dir.into(),
            tmp_dir: tmp_dir.into(),
            variables,
            state: None,
            settings: ChangeSettings::default(),
            allowed_cached_state: false,
            destinations: Vec::new(),
            hook: None,
        }
    }
}

#[derive(Default)]
struct RunnerFiles {
    state_path: Option<PathBuf>,
    plan_path: Option<PathBuf>,
    changes: Option<PlanChanges>,
    plan: Option<PlanReport>,
}

/// Runs the infrastructure tool for one instance
pub struct Runner {
    name: String,
    step: Step,
    tmp_dir: PathBuf,
    variables_path: PathBuf,
    settings: ChangeSettings,
    allowed_cached_state: bool,
    cache: Arc<dyn StateCache>,
    confirm: Arc<dyn Confirm>,
    executor: Arc<dyn Executor>,
    hook: Option<Arc<dyn InfraActionHook>>,
    saver: StateSaver,
    files: Mutex<RunnerFiles>,
    stopped: AtomicBool,
    busy: watch::Sender<bool>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.name)
            .field("step", &self.step)
            .field("settings", &self.settings)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct BusyGuard<'a>(&'a watch::Sender<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

fn temp_file(dir: &Path, prefix: &str, suffix: &str, content: Option<&[u8]>) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|e| Error::io(format!("create temp file in {}", dir.display()), e))?;
    if let Some(content) = content {
        std::fs::write(file.path(), content)
            .map_err(|e| Error::io(format!("write {}", file.path().display()), e))?;
    }
    let (_, path) = file.keep().map_err(|e| Error::io("keep temp file", e.error))?;
    Ok(path)
}

fn write_if_needed(path: &Path, content: &[u8]) -> Result<()> {
    if std::fs::read(path).map(|current| current == content).unwrap_or(false) {
        return Ok(());
    }
    std::fs::write(path, content).map_err(|e| Error::io(format!("write {}", path.display()), e))
}

fn release_provider_lock(working_dir: &Path) -> Result<()> {
    let lock = working_dir.join(PROVIDER_LOCK_FILE);
    match std::fs::remove_file(&lock) {
        Ok(()) => {
            debug!(path = %lock.display(), "Provider lock file removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("remove {}", lock.display()), e)),
    }
}

impl Runner {
    /// Build a runner; writes the variables (and the prior state) to temp files
    pub fn new(
        params: RunnerParams,
        cache: Arc<dyn StateCache>,
        confirm: Arc<dyn Confirm>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let step = params.step;
        let name = params.name.unwrap_or_else(|| step.as_str().to_string());
        release_provider_lock(&params.working_dir)?;

        let variables_path = temp_file(
            &params.tmp_dir,
            VARIABLES_PREFIX,
            VARIABLES_SUFFIX,
            Some(&params.variables),
        )?;
        let state_path = match &params.state {
            Some(state) => Some(temp_file(
                &params.tmp_dir,
                &format!("{step}-dhctl."),
                STATE_SUFFIX,
                Some(state),
            )?),
            None => None,
        };

        let (busy, _) = watch::channel(false);
        Ok(Self {
            name,
            step,
            tmp_dir: params.tmp_dir,
            variables_path,
            settings: params.settings,
            allowed_cached_state: params.allowed_cached_state,
            cache,
            confirm,
            executor,
            hook: params.hook,
            saver: StateSaver::new(params.destinations),
            files: Mutex::new(RunnerFiles {
                state_path,
                ..Default::default()
            }),
            stopped: AtomicBool::new(false),
            busy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn settings(&self) -> ChangeSettings {
        self.settings
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Key of this runner's state in the cache
    pub fn state_key(&self) -> String {
        format!("{}{STATE_SUFFIX}", self.name)
    }

    /// Register additional saver destinations
    pub fn add_destinations(
        &self,
        destinations: impl IntoIterator<Item = Arc<dyn SaverDestination>>,
    ) {
        self.saver.add_destinations(destinations);
    }

    fn begin(&self) -> Result<BusyGuard<'_>> {
        let mut result = Ok(());
        self.busy.send_if_modified(|busy| {
            if self.stopped.load(Ordering::SeqCst) {
                result = Err(Error::RunnerStopped {
                    runner: self.name.clone(),
                });
                return false;
            }
            if *busy {
                result = Err(Error::internal_with_context(
                    self.name.clone(),
                    "infrastructure tool is already running",
                ));
                return false;
            }
            *busy = true;
            true
        });
        result.map(|_| BusyGuard(&self.busy))
    }

    /// Current state path; set once the runner was initialised
    pub fn state_path(&self) -> Option<PathBuf> {
        self.files.lock().state_path.clone()
    }

    fn require_state_path(&self) -> Result<PathBuf> {
        self.state_path().ok_or_else(|| Error::NoInfrastructureState {
            what: format!("{}; run infrastructure apply first", self.name),
        })
    }

    /// Prepare the working tree and choose the state path
    pub async fn init(&self) -> Result<()> {
        let _busy = self.begin()?;
        if self.state_path().is_none() {
            let path = self.state_from_cache()?;
            self.files.lock().state_path = Some(path);
        }
        if let Some(path) = self.state_path() {
            info!(runner = %self.name, path = %path.display(), "State path chosen");
        }

        self.executor
            .init(&self.variables_path)
            .instrument(info_span!("infrastructure_init", runner = %self.name))
            .await
    }

    fn state_from_cache(&self) -> Result<PathBuf> {
        let key = self.state_key();
        let path = self.cache.get_path(&key);
        if !self.cache.in_cache(&key)? {
            return Ok(path);
        }

        info!(runner = %self.name, path = %path.display(), "Cached infrastructure state found");
        if !self.allowed_cached_state
            && !self
                .confirm
                .ask("Do you want to continue with infrastructure state from local cache?", true)
        {
            return Err(Error::CachedStateDeclined {
                path: path.display().to_string(),
            });
        }

        if let Some(data) = self.cache.load(&key)? {
            if !data.is_empty() {
                write_if_needed(&path, &data)?;
            }
        }
        Ok(path)
    }

    /// Compute a plan and classify it
    pub async fn plan(&self, destroy: bool) -> Result<PlanChanges> {
        let _busy = self.begin()?;
        let state_path = self.require_state_path()?;
        async {
            let plan_path = temp_file(
                &self.tmp_dir,
                &format!("{}-dhctl.", self.step),
                PLAN_SUFFIX,
                None,
            )?;
            let code = self
                .executor
                .plan(PlanOpts {
                    state_path,
                    variables_path: self.variables_path.clone(),
                    out_path: Some(plan_path.clone()),
                    destroy,
                    detailed_exit_code: true,
                })
                .await?;

            let report = if code == HAS_CHANGES_EXIT_CODE {
                let shown = self.executor.show(&plan_path).await.map_err(|e| {
                    Error::infrastructure(
                        self.step.as_str(),
                        format!("can't get infrastructure plan for {}: {e}", plan_path.display()),
                    )
                })?;
                Some(PlanReport::parse(&shown)?)
            } else {
                None
            };
            let changes = report.as_ref().map(PlanReport::changes).unwrap_or_default();
            info!(runner = %self.name, changes = ?changes, "Infrastructure plan computed");

            let mut files = self.files.lock();
            files.plan_path = Some(plan_path);
            files.changes = Some(changes);
            files.plan = report;
            Ok::<_, Error>(changes)
        }
        .instrument(info_span!("infrastructure_plan", runner = %self.name))
        .await
    }

    /// Plans that are skipped or refused without asking
    fn dismiss_changes(&self) -> Result<bool> {
        match self.files.lock().changes {
            Some(PlanChanges::DestructiveChanges) if self.settings.auto_dismiss_destructive => {
                return Ok(true)
            }
            Some(PlanChanges::NoChanges) => return Ok(true),
            _ => {}
        }
        if self.settings.auto_dismiss_changes {
            return Err(Error::ApplyAborted);
        }
        Ok(false)
    }

    /// Whether a denied confirmation skips the apply
    fn denied_changes(&self) -> Result<bool> {
        if self.settings.skip_changes_on_deny {
            return Ok(true);
        }
        Err(Error::ApplyAborted)
    }

    fn changes_confirmed(&self) -> bool {
        self.settings.auto_approve
            || self
                .confirm
                .ask("Do you want to CHANGE objects state in the cloud?", false)
    }

    async fn before_action(&self, changes: PlanChanges) -> Result<bool> {
        let Some(hook) = &self.hook else {
            return Ok(false);
        };
        let run_after = hook.before_action(&self.name, changes).await?;
        if let Err(e) = hook.is_ready().await {
            let mut errors = vec![e];
            if run_after {
                if let Err(e) = hook.after_action(&self.name).await {
                    errors.push(e);
                }
            }
            return Error::from_many(errors).map(|_| false);
        }
        Ok(run_after)
    }

    async fn after_action(&self, run_after: bool, errors: &mut Vec<Error>) {
        if !run_after {
            return;
        }
        if let Some(hook) = &self.hook {
            if let Err(e) = hook.after_action(&self.name).await {
                errors.push(e);
            }
        }
    }

    /// Fails with [`Error::RunnerStopped`] when `stop` arrived meanwhile
    async fn ensure_running(&self, run_after: bool) -> Result<()> {
        if !self.is_stopped() {
            return Ok(());
        }
        info!(runner = %self.name, "Runner stopped before the tool started");
        let mut errors = vec![Error::RunnerStopped {
            runner: self.name.clone(),
        }];
        self.after_action(run_after, &mut errors).await;
        Error::from_many(errors)
    }

    /// Start the saver unless the runner was stopped while it started
    async fn start_saver(&self, state_path: &Path, run_after: bool) -> Result<()> {
        self.ensure_running(run_after).await?;
        self.saver.start(state_path)?;
        if self.is_stopped() {
            self.saver.stop().await;
            return self.ensure_running(run_after).await;
        }
        Ok(())
    }

    /// Apply the computed plan (or the working directory when not planned)
    pub async fn apply(&self) -> Result<()> {
        let _busy = self.begin()?;
        let state_path = self.require_state_path()?;
        async {
            if self.dismiss_changes()? {
                info!(runner = %self.name, "Skip infrastructure apply");
                return Ok(());
            }
            let changes = self.changes_in_plan();

            // a destructive plan may be redirected by the hook before anyone is asked
            let run_after = if changes == PlanChanges::DestructiveChanges {
                let run_after = self.before_action(changes).await?;
                if !self.changes_confirmed() {
                    let mut errors = Vec::new();
                    self.after_action(run_after, &mut errors).await;
                    Error::from_many(errors)?;
                    info!(runner = %self.name, "Skip infrastructure apply");
                    return self.denied_changes().map(|_| ());
                }
                run_after
            } else {
                if !self.changes_confirmed() {
                    info!(runner = %self.name, "Skip infrastructure apply");
                    return self.denied_changes().map(|_| ());
                }
                self.before_action(changes).await?
            };

            self.start_saver(&state_path, run_after).await?;
            let plan_path = self.files.lock().plan_path.clone();
            let applied = self
                .executor
                .apply(ApplyOpts {
                    state_path: state_path.clone(),
                    plan_path,
                    variables_path: self.variables_path.clone(),
                })
                .await;
            self.saver.stop().await;

            let mut errors = Vec::new();
            if let Err(e) = applied {
                errors.push(e);
            }
            self.after_action(run_after, &mut errors).await;

            // the state is kept in the cache even when the tool failed
            match std::fs::read(&state_path) {
                Ok(data) => {
                    if let Err(e) = self.cache.save(&self.state_key(), &data) {
                        errors.push(e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(Error::io(format!("read {}", state_path.display()), e)),
            }
            Error::from_many(errors)
        }
        .instrument(info_span!("infrastructure_apply", runner = %self.name))
        .await
    }

    /// Destroy everything recorded in the state
    pub async fn destroy(&self) -> Result<()> {
        let _busy = self.begin()?;
        let state_path = self.require_state_path()?;
        if self.settings.auto_dismiss_changes {
            return Err(Error::ApplyAborted);
        }
        if self.settings.auto_dismiss_destructive {
            info!(runner = %self.name, "Infrastructure destroy skipped");
            return Ok(());
        }
        if !self.settings.auto_approve
            && !self
                .confirm
                .ask("Do you want to DELETE objects from the cloud?", false)
        {
            return Err(Error::DestroyAborted);
        }

        async {
            let run_after = self.before_action(PlanChanges::DestructiveChanges).await?;
            self.start_saver(&state_path, run_after).await?;
            let destroyed = self
                .executor
                .destroy(DestroyOpts {
                    state_path: state_path.clone(),
                    variables_path: self.variables_path.clone(),
                })
                .await;
            self.saver.stop().await;

            let mut errors = Vec::new();
            if let Err(e) = destroyed {
                errors.push(e);
            }
            self.after_action(run_after, &mut errors).await;
            Error::from_many(errors)
        }
        .instrument(info_span!("infrastructure_destroy", runner = %self.name))
        .await
    }

    /// Raw JSON value of one output
    pub async fn output(&self, name: &str) -> Result<Vec<u8>> {
        let _busy = self.begin()?;
        let state_path = self.require_state_path()?;
        self.executor.output(&state_path, name).await.map_err(|e| {
            Error::infrastructure(
                self.step.as_str(),
                format!("can't get infrastructure output for {name:?}: {e}"),
            )
        })
    }

    /// Number of resources in the state; zero means destroy is a no-op
    pub fn resources_quantity_in_state(&self) -> usize {
        let Some(path) = self.state_path() else {
            return 0;
        };
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "State file is not readable");
                return 0;
            }
        };
        match serde_json::from_slice::<Value>(&data) {
            Ok(state) => state
                .get("resources")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file is not valid json");
                0
            }
        }
    }

    /// Current state bytes
    pub fn state(&self) -> Result<Vec<u8>> {
        let path = self.require_state_path()?;
        std::fs::read(&path).map_err(|e| Error::io(format!("read {}", path.display()), e))
    }

    /// Classification of the last plan
    pub fn changes_in_plan(&self) -> PlanChanges {
        self.files.lock().changes.unwrap_or_default()
    }

    pub fn plan_destructive_changes(&self) -> Option<PlanDestructiveChanges> {
        self.files.lock().plan.as_ref().and_then(|p| p.destructive.clone())
    }

    pub fn plan_report(&self) -> Option<PlanReport> {
        self.files.lock().plan.clone()
    }

    pub fn plan_path(&self) -> Option<PathBuf> {
        self.files.lock().plan_path.clone()
    }

    /// Interrupt the running command and refuse further ones.
    ///
    /// Returns once the tool exited and the saver flushed its last write.
    pub async fn stop(&self) {
        let mut was_busy = false;
        self.busy.send_if_modified(|busy| {
            self.stopped.store(true, Ordering::SeqCst);
            was_busy = *busy;
            false
        });
        if was_busy {
            debug!(runner = %self.name, "Runner stop requested while the tool is running");
            self.executor.stop();
        }
        let mut busy = self.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
        self.saver.stop().await;
    }
}

#[async_trait]
impl Stoppable for Runner {
    async fn stop(&self) {
        Runner::stop(self).await
    }
}
