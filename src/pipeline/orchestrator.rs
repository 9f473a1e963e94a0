//! Parallel execution of a pipeline's environments.
//!
//! Every environment descriptor becomes an independent run with its own
//! cache session and step results. Runs only overlap in time when they
//! cannot touch the same files: the source tree is copied per environment
//! and every cache target lies inside that copy. Otherwise environments run
//! one at a time. A failure in one environment never stops the others; only
//! cancellation does.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{expand_matrix, should_run, EnvironmentDescriptor, PipelineRunner, RunResult, RunStatus};
use crate::core::CancelToken;
use crate::error::PipelineResult;
use crate::report::PipelineReport;

/// Runs every environment of a pipeline with bounded parallelism.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    runner: PipelineRunner,
    max_parallel: usize,
}

impl Orchestrator {
    /// Create an orchestrator around a configured runner.
    pub fn new(runner: PipelineRunner) -> Self {
        Self { runner, max_parallel: num_cpus::get().max(1) }
    }

    /// Set the maximum number of environments running at once.
    #[must_use]
    pub fn max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    /// Number of environments that may run at once for `count` environments.
    ///
    /// Falls back to one when the runner's environments share files.
    pub fn effective_parallelism(&self, count: usize) -> usize {
        let limit = self.max_parallel.min(count).max(1);
        if limit > 1 && self.runner.shares_state() {
            tracing::info!(
                max_parallel = self.max_parallel,
                "Environments share the workspace or a cache target, running sequentially"
            );
            return 1;
        }
        limit
    }

    /// The environments this pipeline expands to.
    pub fn environments(&self) -> PipelineResult<Vec<EnvironmentDescriptor>> {
        expand_matrix(&self.runner.pipeline().matrix)
    }

    /// Run the pipeline for its trigger event.
    ///
    /// A pipeline whose trigger condition does not match the event is
    /// skipped: the report has no runs and exits zero.
    pub fn run(&self, cancel: &CancelToken) -> PipelineResult<PipelineReport> {
        let pipeline = self.runner.pipeline();
        let trigger = self.runner.trigger_event();
        let started_at = Local::now();
        let start = Instant::now();

        let mut report = PipelineReport {
            id: Uuid::new_v4(),
            pipeline: pipeline.name.clone(),
            trigger: trigger.clone(),
            started_at,
            duration: Duration::ZERO,
            skipped: false,
            runs: Vec::new(),
        };

        if !should_run(pipeline.trigger.as_ref(), trigger) {
            tracing::info!(
                pipeline = %pipeline.name,
                event = %trigger.event,
                "Trigger does not match, skipping pipeline"
            );
            report.skipped = true;
            return Ok(report);
        }

        let environments = self.environments()?;
        tracing::info!(
            pipeline = %pipeline.name,
            environments = environments.len(),
            max_parallel = self.max_parallel,
            "Starting pipeline"
        );

        report.runs = self.run_environments(environments, cancel);
        report.duration = start.elapsed();

        Ok(report)
    }

    /// Run the given environments, returning results in input order.
    pub fn run_environments(
        &self,
        environments: Vec<EnvironmentDescriptor>,
        cancel: &CancelToken,
    ) -> Vec<RunResult> {
        let count = environments.len();
        if count == 0 {
            return Vec::new();
        }

        let queue: Mutex<VecDeque<(usize, EnvironmentDescriptor)>> =
            Mutex::new(environments.into_iter().enumerate().collect());
        let (tx, rx): (Sender<(usize, RunResult)>, Receiver<(usize, RunResult)>) = mpsc::channel();
        let workers = self.effective_parallelism(count);

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let Some((index, env)) = queue.lock().pop_front() else {
                        break;
                    };

                    let result = if cancel.is_cancelled() {
                        not_started(env)
                    } else {
                        self.runner.run_environment(&env, cancel)
                    };

                    if tx.send((index, result)).is_err() {
                        break;
                    }
                });
            }
        });

        // Drop the sender so the receiver drains and stops
        drop(tx);

        let mut results: Vec<(usize, RunResult)> = rx.into_iter().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

/// Result for an environment that was never started because of cancellation.
fn not_started(environment: EnvironmentDescriptor) -> RunResult {
    RunResult {
        environment,
        status: RunStatus::Cancelled,
        steps: Vec::new(),
        failed_step_index: None,
        failed_step_name: None,
        provision_error: None,
        caches: Vec::new(),
        duration: Duration::ZERO,
    }
}
