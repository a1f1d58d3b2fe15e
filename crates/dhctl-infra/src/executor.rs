//! External infrastructure tool invocation
//!
//! The tool runs in its own process group so that a Ctrl-C in the operator's
//! shell does not reach it twice; [`Executor::stop`] interrupts the whole
//! group with SIGINT, which lets the tool write its state before exiting.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use dhctl_common::{Error, Result};

/// Exit code of `plan -detailed-exitcode` when the plan has changes
pub const HAS_CHANGES_EXIT_CODE: i32 = 2;

const DEBUG_FAILURE_MESSAGE: &str =
    "infrastructure tool has failed in DEBUG mode, search in the output above for an error";

/// How the tool binary is launched
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Tool binary, looked up in `PATH` when relative
    pub binary: PathBuf,
    /// Operation tmp dir; the tool's data dir lives inside it
    pub tmp_dir: PathBuf,
    /// Pre-installed provider plugins
    pub plugins_dir: Option<PathBuf>,
    /// Stream stderr live and ask the tool for debug logs
    pub debug: bool,
}

impl ExecutorSettings {
    /// Default settings for `terraform` inside `tmp_dir`
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            tmp_dir: tmp_dir.into(),
            plugins_dir: None,
            debug: false,
        }
    }

    /// Per-process data directory of the tool
    pub fn data_dir(&self) -> PathBuf {
        self.tmp_dir.join("tf_dhctl")
    }
}

/// Arguments of `plan`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOpts {
    pub state_path: PathBuf,
    pub variables_path: PathBuf,
    pub out_path: Option<PathBuf>,
    pub destroy: bool,
    pub detailed_exit_code: bool,
}

/// Arguments of `apply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOpts {
    pub state_path: PathBuf,
    pub plan_path: Option<PathBuf>,
    pub variables_path: PathBuf,
}

/// Arguments of `destroy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyOpts {
    pub state_path: PathBuf,
    pub variables_path: PathBuf,
}

/// Verbs of the external infrastructure tool for one working directory
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Prepare the working directory
    async fn init(&self, variables_path: &Path) -> Result<()>;

    /// Compute a plan; returns the exit code (0 or [`HAS_CHANGES_EXIT_CODE`])
    async fn plan(&self, opts: PlanOpts) -> Result<i32>;

    /// Apply a plan file, or the working directory with variables
    async fn apply(&self, opts: ApplyOpts) -> Result<()>;

    /// Destroy everything recorded in the state
    async fn destroy(&self, opts: DestroyOpts) -> Result<()>;

    /// Raw JSON of one output
    async fn output(&self, state_path: &Path, name: &str) -> Result<Vec<u8>>;

    /// JSON rendering of a plan file
    async fn show(&self, plan_path: &Path) -> Result<Vec<u8>>;

    /// Interrupt the running command, if any
    fn stop(&self);
}

struct ExecOutput {
    code: i32,
    stdout: Vec<u8>,
}

/// [`Executor`] spawning the tool binary
pub struct ToolExecutor {
    settings: ExecutorSettings,
    step: String,
    working_dir: PathBuf,
    pgid: Mutex<Option<i32>>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("step", &self.step)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

impl ToolExecutor {
    /// Executor of `step` running in `working_dir`
    pub fn new(
        settings: ExecutorSettings,
        step: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            step: step.into(),
            working_dir: working_dir.into(),
            pgid: Mutex::new(None),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(args)
            .env("TF_IN_AUTOMATION", "yes")
            .env("TF_DATA_DIR", self.settings.data_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if self.settings.debug {
            cmd.env("TF_LOG", "DEBUG");
        }
        cmd
    }

    /// Run one command; `capture` collects stdout instead of logging it
    async fn exec(&self, verb: &str, args: Vec<String>, capture: bool) -> Result<ExecOutput> {
        debug!(step = %self.step, command = ?args, "Running infrastructure tool");
        let mut child = self
            .command(&args)
            .spawn()
            .map_err(|e| Error::io(format!("spawn {}", self.settings.binary.display()), e))?;
        *self.pgid.lock() = child.id().map(|pid| pid as i32);

        let debug_mode = self.settings.debug;
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if debug_mode {
                        debug!("{line}");
                    } else {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
                buf
            })
        });

        let stdout = match child.stdout.take() {
            Some(stdout) => read_stdout(stdout, capture).await,
            None => Vec::new(),
        };

        let status = child.wait().await;
        *self.pgid.lock() = None;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let status = status.map_err(|e| Error::io(format!("wait for {verb}"), e))?;
        info!(step = %self.step, verb, "Infrastructure tool process exited");

        // killed by a signal reports no exit code
        let code = status.code().unwrap_or(-1);
        if code == 0 || code == HAS_CHANGES_EXIT_CODE {
            return Ok(ExecOutput { code, stdout });
        }

        warn!(step = %self.step, verb, code, "Infrastructure tool failed");
        let message = if debug_mode {
            DEBUG_FAILURE_MESSAGE.to_string()
        } else if stderr.trim().is_empty() {
            format!("{verb} exited with code {code}")
        } else {
            stderr.trim_end().to_string()
        };
        Err(Error::infrastructure(&self.step, message))
    }
}

async fn read_stdout<R: AsyncRead + Unpin>(stdout: R, capture: bool) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if capture {
            captured.extend_from_slice(line.as_bytes());
            captured.push(b'\n');
        } else {
            info!("{line}");
        }
    }
    captured
}

fn flag(name: &str, path: &Path) -> String {
    format!("-{name}={}", path.display())
}

fn init_args(plugins_dir: Option<&Path>, variables_path: &Path, working_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "init".to_string(),
        "-get-plugins=false".to_string(),
        "-no-color".to_string(),
        "-input=false".to_string(),
    ];
    if let Some(dir) = plugins_dir {
        args.push(flag("plugin-dir", dir));
    }
    args.push(flag("var-file", variables_path));
    args.push(working_dir.display().to_string());
    args
}

fn plan_args(opts: &PlanOpts, working_dir: &Path) -> Vec<String> {
    let mut args = vec!["plan".to_string(), "-input=false".to_string(), "-no-color".to_string()];
    if opts.destroy {
        args.push("-destroy".to_string());
    }
    if opts.detailed_exit_code {
        args.push("-detailed-exitcode".to_string());
    }
    args.push(flag("var-file", &opts.variables_path));
    args.push(flag("state", &opts.state_path));
    if let Some(out) = &opts.out_path {
        args.push(flag("out", out));
    }
    args.push(working_dir.display().to_string());
    args
}

fn apply_args(opts: &ApplyOpts, working_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "apply".to_string(),
        "-input=false".to_string(),
        "-no-color".to_string(),
        "-auto-approve".to_string(),
        flag("state", &opts.state_path),
        flag("state-out", &opts.state_path),
    ];
    match &opts.plan_path {
        Some(plan) => args.push(plan.display().to_string()),
        None => {
            args.push(flag("var-file", &opts.variables_path));
            args.push(working_dir.display().to_string());
        }
    }
    args
}

fn destroy_args(opts: &DestroyOpts, working_dir: &Path) -> Vec<String> {
    vec![
        "destroy".to_string(),
        "-no-color".to_string(),
        "-auto-approve".to_string(),
        flag("var-file", &opts.variables_path),
        flag("state", &opts.state_path),
        working_dir.display().to_string(),
    ]
}

#[async_trait]
impl Executor for ToolExecutor {
    async fn init(&self, variables_path: &Path) -> Result<()> {
        let args = init_args(
            self.settings.plugins_dir.as_deref(),
            variables_path,
            &self.working_dir,
        );
        self.exec("init", args, false).await.map(|_| ())
    }

    async fn plan(&self, opts: PlanOpts) -> Result<i32> {
        let args = plan_args(&opts, &self.working_dir);
        self.exec("plan", args, false).await.map(|out| out.code)
    }

    async fn apply(&self, opts: ApplyOpts) -> Result<()> {
        let args = apply_args(&opts, &self.working_dir);
        self.exec("apply", args, false).await.map(|_| ())
    }

    async fn destroy(&self, opts: DestroyOpts) -> Result<()> {
        let args = destroy_args(&opts, &self.working_dir);
        self.exec("destroy", args, false).await.map(|_| ())
    }

    async fn output(&self, state_path: &Path, name: &str) -> Result<Vec<u8>> {
        let args = vec![
            "output".to_string(),
            "-no-color".to_string(),
            "-json".to_string(),
            flag("state", state_path),
            name.to_string(),
        ];
        self.exec("output", args, true).await.map(|out| out.stdout)
    }

    async fn show(&self, plan_path: &Path) -> Result<Vec<u8>> {
        let args = vec!["show".to_string(), "-json".to_string(), plan_path.display().to_string()];
        self.exec("show", args, true).await.map(|out| out.stdout)
    }

    fn stop(&self) {
        let Some(pgid) = *self.pgid.lock() else {
            return;
        };
        debug!(step = %self.step, pgid, "Interrupting infrastructure tool");
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGINT) {
            warn!(step = %self.step, pgid, error = %e, "Failed to interrupt infrastructure tool");
        }
    }
}
