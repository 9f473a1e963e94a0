//! Pipeline execution engine.
//!
//! Runs a pipeline's steps in one environment with fail-fast semantics:
//! provision, restore caches, execute steps in order until one fails, then
//! save caches (unless the run was cancelled).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use super::{render_lenient, EnvironmentDescriptor, Pipeline, Step, TemplateContext, TriggerEvent};
use crate::cache::{resolve_target, CacheReport, CacheSession, CacheStore};
use crate::core::{CancelToken, Executor, Provisioner, ShellCommand};

/// Position of a run in the fail-fast state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started.
    Pending,
    /// Executing the step at this (0-based) index.
    Running(usize),
    /// Every step succeeded.
    Succeeded,
    /// The step at this index failed; later steps never run.
    Failed(usize),
    /// Cancelled while the step at this index was current.
    Cancelled(usize),
}

impl RunState {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled(_))
    }

    /// Start a run of `step_count` steps.
    pub fn start(step_count: usize) -> Self {
        if step_count == 0 {
            Self::Succeeded
        } else {
            Self::Running(0)
        }
    }

    /// Transition after the current step finished.
    pub fn advance(self, step_succeeded: bool, step_count: usize) -> Self {
        match self {
            Self::Running(i) if !step_succeeded => Self::Failed(i),
            Self::Running(i) if i + 1 >= step_count => Self::Succeeded,
            Self::Running(i) => Self::Running(i + 1),
            other => other,
        }
    }

    /// Final status and the 0-based index of the failed step.
    ///
    /// Only terminal states have an outcome; a run that stopped in `Pending`
    /// or `Running` is reported as failed.
    pub fn outcome(self) -> (RunStatus, Option<usize>) {
        match self {
            Self::Succeeded => (RunStatus::Succeeded, None),
            Self::Failed(i) => (RunStatus::Failed, Some(i)),
            Self::Cancelled(_) => (RunStatus::Cancelled, None),
            Self::Pending | Self::Running(_) => {
                tracing::error!(state = ?self, "Run stopped in a non-terminal state");
                (RunStatus::Failed, None)
            }
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run succeeded.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Result of executing a step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name
    pub name: String,

    /// Whether the step succeeded
    pub success: bool,

    /// Exit code
    pub exit_code: Option<i32>,

    /// Time the step took
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,

    /// Captured standard output
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,

    /// Captured standard error
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,

    /// Error message when the command could not run at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the step was interrupted by cancellation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl StepResult {
    /// A step that exited normally.
    pub fn exited(name: impl Into<String>, exit_code: i32, duration: Duration) -> Self {
        Self {
            name: name.into(),
            success: exit_code == 0,
            exit_code: Some(exit_code),
            duration,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            cancelled: false,
        }
    }

    /// A step whose command could not be run.
    pub fn errored(name: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            success: false,
            exit_code: None,
            duration,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            cancelled: false,
        }
    }

    /// Combined output, stdout first.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Result of one run (one environment).
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// The environment the run executed in
    pub environment: EnvironmentDescriptor,

    /// Terminal status
    pub status: RunStatus,

    /// Results of the steps that executed, in order
    pub steps: Vec<StepResult>,

    /// 1-based index of the failing step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_index: Option<usize>,

    /// Name of the failing step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_name: Option<String>,

    /// Why the environment could not be provisioned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision_error: Option<String>,

    /// Cache restore/save outcomes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<CacheReport>,

    /// Total time of the run
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl RunResult {
    /// A run that failed before any step because provisioning failed.
    pub fn provision_failed(environment: EnvironmentDescriptor, reason: impl Into<String>) -> Self {
        Self {
            environment,
            status: RunStatus::Failed,
            steps: Vec::new(),
            failed_step_index: None,
            failed_step_name: None,
            provision_error: Some(reason.into()),
            caches: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// The failing step's result, if a step failed.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.failed_step_index.and_then(|i| self.steps.get(i - 1))
    }

    /// Exit code of the failing step.
    pub fn failed_exit_code(&self) -> Option<i32> {
        self.failed_step().and_then(|s| s.exit_code)
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Everything a step needs to know about the run it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// The environment being run
    pub environment: &'a EnvironmentDescriptor,

    /// Directory steps run in
    pub workspace: &'a Path,

    /// Operating system of the environment
    pub runner_os: &'a str,

    /// Pipeline-level environment variables
    pub env: &'a IndexMap<String, String>,

    /// The event that started the run
    pub trigger: &'a TriggerEvent,
}

impl<'a> StepContext<'a> {
    /// Template context for expressions in this run.
    pub fn template(&self) -> TemplateContext<'a> {
        TemplateContext {
            matrix: self.environment,
            runner_os: self.runner_os,
            env: self.env,
            workspace: self.workspace,
        }
    }
}

/// Runs a single step.
pub trait StepExecutor: Send + Sync {
    /// Execute `step`, blocking until it finishes or `cancel` is set.
    fn run_step(&self, step: &Step, ctx: &StepContext<'_>, cancel: &CancelToken) -> StepResult;
}

/// Runs steps as shell commands.
#[derive(Debug, Clone, Default)]
pub struct ShellStepExecutor {
    executor: Executor,
}

impl ShellStepExecutor {
    /// Create a step executor backed by `executor`.
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /// Build the shell command for a step in a run.
    pub fn command_for(step: &Step, ctx: &StepContext<'_>) -> ShellCommand {
        let template = ctx.template();
        let command = render_lenient(&step.run, &template);

        let working_dir = step
            .working_dir
            .as_ref()
            .map_or_else(|| ctx.workspace.to_path_buf(), |dir| {
                ctx.workspace.join(render_lenient(dir, &template))
            });

        let mut shell = ShellCommand::new(command)
            .with_working_dir(working_dir)
            .with_env("CI", "true")
            .with_env("SHIPCHECK_OS", ctx.runner_os)
            .with_env("SHIPCHECK_WORKSPACE", ctx.workspace.to_string_lossy());

        for (key, value) in ctx.trigger.env_vars().into_iter().chain(ctx.environment.env_vars()) {
            shell = shell.with_env(key, value);
        }
        for (key, value) in ctx.env {
            shell = shell.with_env(key, render_lenient(value, &template));
        }
        for (key, value) in &step.env {
            shell = shell.with_env(key, render_lenient(value, &template));
        }

        shell
    }
}

impl StepExecutor for ShellStepExecutor {
    fn run_step(&self, step: &Step, ctx: &StepContext<'_>, cancel: &CancelToken) -> StepResult {
        let command = Self::command_for(step, ctx);

        tracing::info!(
            environment = %ctx.environment,
            step = %step.name,
            command = %command.command,
            "Executing step"
        );

        let executor = self.executor.clone().label(ctx.environment.to_string());
        let start = Instant::now();

        match executor.execute(&command, cancel) {
            Ok(result) => StepResult {
                name: step.name.clone(),
                success: result.success(),
                exit_code: result.code(),
                duration: result.duration,
                stdout: result.stdout,
                stderr: result.stderr,
                error: None,
                cancelled: result.cancelled,
            },
            Err(e) => StepResult::errored(&step.name, e.to_string(), start.elapsed()),
        }
    }
}

/// Execute `steps` in order, stopping at the first failure.
///
/// Returns the step results, the terminal state and whether the run was
/// cancelled. Steps after a failure are never started.
pub fn execute_run(
    steps: &[Step],
    ctx: &StepContext<'_>,
    executor: &dyn StepExecutor,
    cancel: &CancelToken,
) -> (Vec<StepResult>, RunState) {
    let mut results = Vec::with_capacity(steps.len());
    let mut state = RunState::start(steps.len());

    while let RunState::Running(index) = state {
        if cancel.is_cancelled() {
            state = RunState::Cancelled(index);
            break;
        }

        let step = &steps[index];
        let result = executor.run_step(step, ctx, cancel);

        if result.cancelled {
            results.push(result);
            state = RunState::Cancelled(index);
            break;
        }

        if result.success {
            tracing::info!(environment = %ctx.environment, step = %step.name, "Step succeeded");
        } else {
            tracing::warn!(
                environment = %ctx.environment,
                step = %step.name,
                exit_code = ?result.exit_code,
                "Step failed"
            );
        }

        state = state.advance(result.success, steps.len());
        results.push(result);
    }

    (results, state)
}

/// Runs a pipeline in individual environments.
#[derive(Clone)]
pub struct PipelineRunner {
    pipeline: Arc<Pipeline>,
    source: PathBuf,
    trigger: TriggerEvent,
    steps: Arc<dyn StepExecutor>,
    probes: Executor,
    provisioner: Provisioner,
    cache: Option<Arc<dyn CacheStore>>,
}

impl PipelineRunner {
    /// Create a runner for `pipeline`, executing in `source`.
    pub fn new(pipeline: Pipeline, source: impl Into<PathBuf>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            source: source.into(),
            trigger: TriggerEvent::default(),
            steps: Arc::new(ShellStepExecutor::default()),
            probes: Executor::new(),
            provisioner: Provisioner::new(),
            cache: None,
        }
    }

    /// Set the triggering event.
    #[must_use]
    pub fn trigger(mut self, trigger: TriggerEvent) -> Self {
        self.trigger = trigger;
        self
    }

    /// Use a custom step executor.
    #[must_use]
    pub fn step_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.steps = executor;
        self
    }

    /// Use a shell executor for steps and provision probes.
    #[must_use]
    pub fn shell_executor(mut self, executor: Executor) -> Self {
        self.probes = executor.clone();
        self.steps = Arc::new(ShellStepExecutor::new(executor));
        self
    }

    /// Set the provisioner.
    #[must_use]
    pub fn provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Enable caching against `store`.
    #[must_use]
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// The pipeline being run.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The triggering event.
    pub fn trigger_event(&self) -> &TriggerEvent {
        &self.trigger
    }

    /// Whether environments of this runner touch the same files.
    ///
    /// True when the source tree is not copied per environment, or when a
    /// cache target lies outside the workspace (`~/.cargo/registry`).
    pub fn shares_state(&self) -> bool {
        if !self.provisioner.isolate {
            return true;
        }

        self.pipeline.caches.iter().any(|binding| {
            binding.path.trim_start().starts_with("{{")
                || resolve_target(&binding.path, Path::new("")).is_absolute()
        })
    }

    /// Run every step in one environment.
    ///
    /// Never returns an error: provisioning failures and step failures are
    /// reported in the result; cache failures only produce warnings.
    pub fn run_environment(&self, env: &EnvironmentDescriptor, cancel: &CancelToken) -> RunResult {
        let start = Instant::now();

        let provisioned = match self.provisioner.provision(
            env,
            &self.source,
            &self.pipeline.env,
            &self.pipeline.provision,
            &self.probes,
            cancel,
        ) {
            Ok(provisioned) => provisioned,
            Err(e) => {
                tracing::error!(environment = %env, error = %e, "Provisioning failed");
                let mut result = RunResult::provision_failed(env.clone(), e.to_string());
                if cancel.is_cancelled() {
                    result.status = RunStatus::Cancelled;
                }
                result.duration = start.elapsed();
                return result;
            }
        };

        let ctx = StepContext {
            environment: env,
            workspace: &provisioned.workspace,
            runner_os: &provisioned.runner_os,
            env: &self.pipeline.env,
            trigger: &self.trigger,
        };

        let session = self
            .cache
            .as_ref()
            .map(|store| CacheSession::restore(store.clone(), &self.pipeline.caches, &ctx.template()));

        let (steps, state) = execute_run(&self.pipeline.steps, &ctx, self.steps.as_ref(), cancel);

        let caches = match (session, state) {
            (Some(session), RunState::Cancelled(_)) => session.abandon(),
            (Some(session), _) => session.save(),
            (None, _) => Vec::new(),
        };

        let (status, failed) = state.outcome();
        let failed_index = failed.map(|i| i + 1);

        let result = RunResult {
            environment: env.clone(),
            status,
            failed_step_name: failed_index.map(|i| self.pipeline.steps[i - 1].name.clone()),
            failed_step_index: failed_index,
            steps,
            provision_error: None,
            caches,
            duration: start.elapsed(),
        };

        tracing::info!(
            environment = %env,
            status = ?result.status,
            duration_ms = result.duration.as_millis() as u64,
            "Run finished"
        );

        result
    }
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("pipeline", &self.pipeline.name)
            .field("source", &self.source)
            .field("trigger", &self.trigger)
            .field("caching", &self.cache.is_some())
            .finish()
    }
}
