//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::prelude::*;

/// Get the binary to test.
fn shipcheck() -> Command {
    Command::cargo_bin("shipcheck").unwrap()
}

const CI: &str = r#"
name: ci
description: Verify pull requests
on:
  event: pull_request
  types: [opened, synchronize]
matrix:
  toolchain: [stable, nightly]
caches:
  - name: deps
    path: deps
    key: "{{ runner.os }}-deps-{{ hashFiles('Cargo.lock') }}"
steps:
  - name: fmt
    run: echo fmt {{ matrix.toolchain }}
  - name: check
    run: test "$MATRIX_TOOLCHAIN" = stable || { echo "nightly check broke" >&2; exit 4; }
  - name: test
    run: echo test >> ran-$MATRIX_TOOLCHAIN.txt
"#;

/// A project with one pipeline and a private cache directory.
fn project(pipeline: &str) -> assert_fs::TempDir {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child(".shipcheck/pipelines/ci.yml").write_str(pipeline).unwrap();
    temp.child("Cargo.lock").write_str("# lock\n").unwrap();
    temp.child(".shipcheck.toml")
        .write_str(&format!(
            "[general]\nmax_parallel = 2\n\n[cache]\ndir = {:?}\n",
            temp.path().join("cache-store")
        ))
        .unwrap();
    temp
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    shipcheck()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Build-verification pipeline runner"));
}

#[test]
fn test_version_flag() {
    shipcheck()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_run_command_help() {
    shipcheck()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-cache"))
        .stdout(predicate::str::contains("--jobs"));
}

#[test]
fn test_invalid_subcommand() {
    shipcheck().arg("frobnicate").assert().failure();
}

// ============================================================================
// Declaration Commands
// ============================================================================

#[test]
fn test_list_pipelines() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("ci - Verify pull requests (3 steps)"));
}

#[test]
fn test_matrix_text() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .arg("matrix")
        .assert()
        .success()
        .stdout(predicate::str::contains("toolchain=stable"))
        .stdout(predicate::str::contains("toolchain=nightly"))
        .stdout(predicate::str::contains("Total: 2 environments"));
}

#[test]
fn test_matrix_json() {
    let temp = project(CI);
    let output = shipcheck()
        .current_dir(temp.path())
        .args(["matrix", "--format", "json"])
        .output()
        .unwrap();

    let envs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(envs[0]["toolchain"], "stable");
    assert_eq!(envs[1]["toolchain"], "nightly");
}

#[test]
fn test_validate_ok() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ ci"));
}

#[test]
fn test_validate_reports_unknown_axis() {
    let temp = project("name: bad\nsteps:\n  - name: a\n    run: echo {{ matrix.missing }}\n");
    shipcheck()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("matrix.missing"));
}

#[test]
fn test_keys_are_content_derived() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .arg("keys")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("deps: {}-deps-", std::env::consts::OS)));
}

#[test]
fn test_missing_pipeline() {
    let temp = assert_fs::TempDir::new().unwrap();
    shipcheck()
        .current_dir(temp.path())
        .args(["run", "nightly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Pipeline not found"));
}

// ============================================================================
// Run Command
// ============================================================================

#[test]
fn test_dry_run_renders_commands() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .args(["run", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. fmt - echo fmt nightly"));

    temp.child("ran-stable.txt").assert(predicate::path::missing());
}

#[cfg(unix)]
#[test]
fn test_run_reports_failing_environment() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("[toolchain=nightly] Failed"))
        .stdout(predicate::str::contains("failed at step 2 'check'"))
        .stdout(predicate::str::contains("nightly check broke"))
        .stdout(predicate::str::contains("1 succeeded, 1 failed"));

    temp.child("ran-stable.txt").assert("test\n");
    temp.child("ran-nightly.txt").assert(predicate::path::missing());
}

#[cfg(unix)]
#[test]
fn test_run_success_exits_zero() {
    let temp = project(
        "name: ok\nmatrix:\n  toolchain: [stable]\nsteps:\n  - name: build\n    run: echo built\n",
    );
    shipcheck()
        .current_dir(temp.path())
        .args(["run", "--no-cache"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 succeeded, 0 failed, 0 cancelled"));
}

#[cfg(unix)]
#[test]
fn test_run_json_report() {
    let temp = project(CI);
    let output = shipcheck()
        .current_dir(temp.path())
        .args(["run", "--format", "json", "--revision", "abc123"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["trigger"]["revision"], "abc123");
    assert_eq!(report["runs"][0]["status"], "succeeded");
    assert_eq!(report["runs"][1]["status"], "failed");
    assert_eq!(report["runs"][1]["failed_step_name"], "check");
}

#[test]
fn test_unmatched_trigger_is_skipped() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .args(["run", "--event", "push"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped"));
}

#[cfg(unix)]
#[test]
fn test_caches_saved_and_listed() {
    let temp = project(
        r#"
name: cached
caches:
  - name: deps
    path: deps
    key: "deps-{{ hashFiles('Cargo.lock') }}"
steps:
  - name: fetch
    run: mkdir -p deps && echo fetched > deps/marker
"#,
    );

    shipcheck().current_dir(temp.path()).arg("run").assert().success();

    shipcheck()
        .current_dir(temp.path())
        .args(["cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total: 1 entries"));

    shipcheck()
        .current_dir(temp.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("cache deps: hit"));

    shipcheck()
        .current_dir(temp.path())
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 cache entries"));
}

// ============================================================================
// Config & Completions
// ============================================================================

#[test]
fn test_config_command() {
    let temp = project(CI);
    shipcheck()
        .current_dir(temp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_parallel = 2"));
}

#[test]
fn test_config_follows_project_dir() {
    let temp = project(CI);
    let elsewhere = assert_fs::TempDir::new().unwrap();
    shipcheck()
        .current_dir(elsewhere.path())
        .arg("-C")
        .arg(temp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_parallel = 2"))
        .stdout(predicate::str::contains("cache-store"));
}

#[test]
fn test_completions_bash() {
    shipcheck()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shipcheck"));
}
