//! Pipeline reports.
//!
//! Aggregates the runs of one pipeline invocation, renders them for people
//! (text) or tools (JSON) and decides the process exit code.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::cache::{CacheReport, CacheState, SaveOutcome};
use crate::pipeline::{RunResult, RunStatus, TriggerEvent};

/// Lines of captured output shown for a failing step.
const OUTPUT_TAIL_LINES: usize = 40;

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Unique invocation id
    pub id: Uuid,

    /// Pipeline name
    pub pipeline: String,

    /// Event that triggered the invocation
    pub trigger: TriggerEvent,

    /// When the invocation started
    pub started_at: DateTime<Local>,

    /// Wall time of the whole invocation
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,

    /// Whether the trigger condition did not match
    pub skipped: bool,

    /// One result per environment, in matrix order
    pub runs: Vec<RunResult>,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl PipelineReport {
    /// Whether every run succeeded (vacuously true when skipped).
    pub fn success(&self) -> bool {
        self.runs.iter().all(|r| r.status.is_success())
    }

    /// Process exit code: 0 when every run succeeded, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.success())
    }

    /// Number of runs with the given status.
    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render as human readable text.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        if self.skipped {
            let _ = writeln!(
                out,
                "Pipeline '{}' skipped: trigger does not match event '{}'",
                self.pipeline,
                describe_event(&self.trigger)
            );
            return out;
        }

        let _ = writeln!(out, "Pipeline '{}' ({})", self.pipeline, describe_event(&self.trigger));
        let _ = writeln!(out);

        for run in &self.runs {
            render_run(&mut out, run);
        }

        let _ = writeln!(
            out,
            "{} succeeded, {} failed, {} cancelled in {:.1}s",
            self.count(RunStatus::Succeeded),
            self.count(RunStatus::Failed),
            self.count(RunStatus::Cancelled),
            self.duration.as_secs_f64()
        );

        out
    }
}

fn describe_event(trigger: &TriggerEvent) -> String {
    let mut text = trigger.event.clone();
    if let Some(ref action) = trigger.action {
        let _ = write!(text, ".{action}");
    }
    if let Some(ref revision) = trigger.revision {
        let _ = write!(text, " @ {revision}");
    }
    text
}

fn render_run(out: &mut String, run: &RunResult) {
    let marker = match run.status {
        RunStatus::Succeeded => "✓",
        RunStatus::Failed => "✗",
        RunStatus::Cancelled => "-",
    };
    let _ = writeln!(
        out,
        "{marker} [{}] {:?} ({:.1}s)",
        run.environment,
        run.status,
        run.duration.as_secs_f64()
    );

    if let Some(ref reason) = run.provision_error {
        let _ = writeln!(out, "    provisioning failed: {reason}");
    }

    for cache in &run.caches {
        let _ = writeln!(out, "    cache {}: {}", cache.name, describe_cache(cache));
    }

    for (i, step) in run.steps.iter().enumerate() {
        let status = match (step.success, step.cancelled) {
            (_, true) => "cancelled".to_string(),
            (true, false) => "ok".to_string(),
            (false, false) => step
                .exit_code
                .map_or_else(|| "error".to_string(), |code| format!("exit {code}")),
        };
        let _ = writeln!(
            out,
            "    {}. {} ... {} ({} ms)",
            i + 1,
            step.name,
            status,
            step.duration.as_millis()
        );
    }

    if let Some(step) = run.failed_step() {
        let _ = writeln!(
            out,
            "    failed at step {} '{}'",
            run.failed_step_index.unwrap_or_default(),
            step.name
        );
        if let Some(ref error) = step.error {
            let _ = writeln!(out, "    | {error}");
        }
        let output = step.output();
        let lines: Vec<&str> = output.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        for line in &lines[start..] {
            let _ = writeln!(out, "    | {line}");
        }
    }

    let _ = writeln!(out);
}

fn describe_cache(cache: &CacheReport) -> String {
    let restore = match &cache.restore {
        CacheState::Hit { key } => format!("hit ({key})"),
        CacheState::Miss { key } => format!("miss ({key})"),
        CacheState::Unavailable { reason } => format!("unavailable ({reason})"),
    };

    let save = match &cache.save {
        None | Some(SaveOutcome::SkippedExactHit | SaveOutcome::SkippedNoKey) => return restore,
        Some(SaveOutcome::Saved { bytes }) => format!("saved {bytes} bytes"),
        Some(SaveOutcome::SkippedMissingPath) => "nothing to save".to_string(),
        Some(SaveOutcome::Abandoned) => "not saved (cancelled)".to_string(),
        Some(SaveOutcome::Failed { reason }) => format!("save failed: {reason}"),
    };

    format!("{restore}, {save}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EnvironmentDescriptor, StepResult};

    fn report(runs: Vec<RunResult>) -> PipelineReport {
        PipelineReport {
            id: Uuid::new_v4(),
            pipeline: "ci".to_string(),
            trigger: TriggerEvent::default(),
            started_at: Local::now(),
            duration: Duration::from_millis(1500),
            skipped: false,
            runs,
        }
    }

    fn failed_run() -> RunResult {
        let mut check = StepResult::exited("check", 101, Duration::from_millis(20));
        check.stderr = "error[E0308]: mismatched types".to_string();

        RunResult {
            environment: EnvironmentDescriptor::from_pairs([("toolchain", "stable")]),
            status: RunStatus::Failed,
            steps: vec![StepResult::exited("fmt", 0, Duration::from_millis(5)), check],
            failed_step_index: Some(2),
            failed_step_name: Some("check".to_string()),
            provision_error: None,
            caches: vec![CacheReport {
                name: "cargo-registry".to_string(),
                restore: CacheState::Miss { key: "linux-cargo-registry-abc".to_string() },
                save: Some(SaveOutcome::Saved { bytes: 42 }),
            }],
            duration: Duration::from_millis(25),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(Vec::new()).exit_code(), 0);
        assert_eq!(report(vec![failed_run()]).exit_code(), 1);

        let mut cancelled = failed_run();
        cancelled.status = RunStatus::Cancelled;
        assert_eq!(report(vec![cancelled]).exit_code(), 1);
    }

    #[test]
    fn test_text_names_failing_step_and_output() {
        let text = report(vec![failed_run()]).render_text();

        assert!(text.contains("[toolchain=stable] Failed"));
        assert!(text.contains("failed at step 2 'check'"));
        assert!(text.contains("| error[E0308]: mismatched types"));
        assert!(text.contains("cache cargo-registry: miss (linux-cargo-registry-abc), saved 42 bytes"));
        assert!(text.contains("0 succeeded, 1 failed, 0 cancelled"));
    }

    #[test]
    fn test_skipped_text() {
        let mut skipped = report(Vec::new());
        skipped.skipped = true;
        assert!(skipped.render_text().contains("skipped"));
    }

    #[test]
    fn test_json() {
        let json = report(vec![failed_run()]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["pipeline"], "ci");
        assert_eq!(value["runs"][0]["status"], "failed");
        assert_eq!(value["runs"][0]["failed_step_index"], 2);
        assert_eq!(value["runs"][0]["environment"]["toolchain"], "stable");
        assert_eq!(value["runs"][0]["caches"][0]["restore"]["state"], "miss");
        assert_eq!(value["duration_ms"], 1500);
    }
}
