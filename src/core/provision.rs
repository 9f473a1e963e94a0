//! Environment provisioning.
//!
//! Turns an environment descriptor into a place where steps can run: checks
//! that the requested platform is the host platform, prepares the workspace
//! and runs the pipeline's provision probes (e.g. "is this toolchain
//! installed?"). Any failure here fails the environment before its first step.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tempfile::TempDir;
use walkdir::WalkDir;

use super::{CancelToken, Executor, ShellCommand};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{render_lenient, EnvironmentDescriptor, TemplateContext};

/// Directories never copied into an isolated workspace.
const SKIP_DIRS: [&str; 2] = [".git", "target"];

/// A provisioned execution context.
#[derive(Debug)]
pub struct ProvisionedEnvironment {
    /// Directory the steps run in
    pub workspace: PathBuf,

    /// Operating system the steps run on
    pub runner_os: String,

    /// Keeps an isolated workspace alive until the environment is released
    isolated_dir: Option<TempDir>,
}

impl ProvisionedEnvironment {
    /// Whether the workspace is a private copy.
    pub fn is_isolated(&self) -> bool {
        self.isolated_dir.is_some()
    }
}

/// Creates execution contexts for environment descriptors.
#[derive(Debug, Clone)]
pub struct Provisioner {
    /// Platform label (or label prefix) to operating system
    pub platform_aliases: IndexMap<String, String>,

    /// Copy the source tree into a private directory per environment
    pub isolate: bool,
}

impl Default for Provisioner {
    fn default() -> Self {
        Self { platform_aliases: default_platform_aliases(), isolate: false }
    }
}

/// Built-in platform label prefixes.
pub fn default_platform_aliases() -> IndexMap<String, String> {
    [
        ("ubuntu", "linux"),
        ("debian", "linux"),
        ("linux", "linux"),
        ("macos", "macos"),
        ("darwin", "macos"),
        ("windows", "windows"),
    ]
    .into_iter()
    .map(|(label, os)| (label.to_string(), os.to_string()))
    .collect()
}

/// The operating system this process runs on.
pub fn host_os() -> &'static str {
    std::env::consts::OS
}

impl Provisioner {
    /// Create a provisioner with the built-in aliases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or override platform aliases.
    #[must_use]
    pub fn with_aliases(mut self, aliases: &IndexMap<String, String>) -> Self {
        self.platform_aliases.extend(aliases.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set workspace isolation.
    #[must_use]
    pub fn isolate(mut self, isolate: bool) -> Self {
        self.isolate = isolate;
        self
    }

    /// Map a platform label to an operating system.
    ///
    /// Exact alias matches win; otherwise the longest alias that prefixes the
    /// label is used (`ubuntu-22.04` → `linux`).
    pub fn resolve_os(&self, label: &str) -> Option<String> {
        let label = label.to_lowercase();

        if let Some(os) = self.platform_aliases.get(&label) {
            return Some(os.clone());
        }

        self.platform_aliases
            .iter()
            .filter(|(alias, _)| label.starts_with(alias.as_str()))
            .max_by_key(|(alias, _)| alias.len())
            .map(|(_, os)| os.clone())
    }

    /// Provision a context for `env`.
    pub fn provision(
        &self,
        env: &EnvironmentDescriptor,
        source: &Path,
        pipeline_env: &IndexMap<String, String>,
        probes: &[String],
        executor: &Executor,
        cancel: &CancelToken,
    ) -> PipelineResult<ProvisionedEnvironment> {
        let fail = |reason: String| PipelineError::Provision { environment: env.to_string(), reason };

        let runner_os = match env.platform() {
            None => host_os().to_string(),
            Some(label) => {
                let os = self
                    .resolve_os(label)
                    .ok_or_else(|| fail(format!("unknown platform '{label}'")))?;
                if os != host_os() {
                    return Err(fail(format!(
                        "platform '{label}' requires {os}, but this host runs {}",
                        host_os()
                    )));
                }
                os
            }
        };

        let (workspace, isolated) = if self.isolate {
            let temp = tempfile::Builder::new()
                .prefix("shipcheck-")
                .tempdir()
                .map_err(|e| fail(format!("cannot create workspace: {e}")))?;
            copy_tree(source, temp.path())
                .map_err(|e| fail(format!("cannot copy workspace: {e}")))?;
            (temp.path().to_path_buf(), Some(temp))
        } else {
            (source.to_path_buf(), None)
        };

        let ctx = TemplateContext {
            matrix: env,
            runner_os: &runner_os,
            env: pipeline_env,
            workspace: &workspace,
        };

        for probe in probes {
            let command = render_lenient(probe, &ctx);
            tracing::debug!(environment = %env, probe = %command, "Running provision probe");

            let mut shell = ShellCommand::new(&command).with_working_dir(&workspace);
            for (key, value) in pipeline_env {
                shell = shell.with_env(key, value);
            }
            for (key, value) in env.env_vars() {
                shell = shell.with_env(key, value);
            }

            let result = executor
                .execute(&shell, cancel)
                .map_err(|e| fail(format!("probe `{command}` could not start: {e}")))?;

            if result.cancelled {
                return Err(fail("cancelled during provisioning".to_string()));
            }
            if !result.success() {
                let code = result.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
                let detail = result.stderr.lines().last().unwrap_or("").trim().to_string();
                return Err(fail(format!("probe `{command}` exited with {code}: {detail}")));
            }
        }

        tracing::info!(environment = %env, workspace = ?workspace, os = %runner_os, "Environment provisioned");

        Ok(ProvisionedEnvironment { workspace, runner_os, isolated_dir: isolated })
    }
}

/// Copy a source tree, skipping VCS metadata and build output.
fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    let walker = WalkDir::new(source).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(entry.file_type().is_dir()
                && SKIP_DIRS.iter().any(|skip| entry.file_name() == *skip))
    });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry.path().strip_prefix(source).map_err(std::io::Error::other)?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn other_os() -> &'static str {
        if host_os() == "windows" {
            "ubuntu-latest"
        } else {
            "windows-latest"
        }
    }

    fn host_label() -> &'static str {
        match host_os() {
            "macos" => "macos-latest",
            "windows" => "windows-latest",
            _ => "ubuntu-latest",
        }
    }

    #[test]
    fn test_resolve_os() {
        let provisioner = Provisioner::new();
        assert_eq!(provisioner.resolve_os("ubuntu-latest").as_deref(), Some("linux"));
        assert_eq!(provisioner.resolve_os("ubuntu-22.04").as_deref(), Some("linux"));
        assert_eq!(provisioner.resolve_os("macOS-14").as_deref(), Some("macos"));
        assert_eq!(provisioner.resolve_os("windows-2022").as_deref(), Some("windows"));
        assert!(provisioner.resolve_os("solaris").is_none());
    }

    #[test]
    fn test_custom_alias() {
        let mut aliases = IndexMap::new();
        aliases.insert("self-hosted".to_string(), "linux".to_string());
        let provisioner = Provisioner::new().with_aliases(&aliases);

        assert_eq!(provisioner.resolve_os("self-hosted").as_deref(), Some("linux"));
    }

    #[test]
    fn test_host_platform_provisions() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = EnvironmentDescriptor::from_pairs([("platform", host_label())]);

        let provisioned = Provisioner::new()
            .provision(
                &env,
                dir.path(),
                &IndexMap::new(),
                &[],
                &Executor::new(),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(provisioned.runner_os, host_os());
        assert_eq!(provisioned.workspace, dir.path());
        assert!(!provisioned.is_isolated());
    }

    #[test]
    fn test_foreign_platform_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = EnvironmentDescriptor::from_pairs([("platform", other_os())]);

        let result = Provisioner::new().provision(
            &env,
            dir.path(),
            &IndexMap::new(),
            &[],
            &Executor::new(),
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(PipelineError::Provision { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_probe_fails_provisioning() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = EnvironmentDescriptor::from_pairs([("toolchain", "nightly")]);
        let probes = vec!["test \"{{ matrix.toolchain }}\" = stable".to_string()];

        let result = Provisioner::new().provision(
            &env,
            dir.path(),
            &IndexMap::new(),
            &probes,
            &Executor::new(),
            &CancelToken::new(),
        );

        let err = result.unwrap_err().to_string();
        assert!(err.contains("toolchain=nightly"));
        assert!(err.contains("exited with 1"));
    }

    #[test]
    fn test_isolated_workspace_copies_sources() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(dir.path().join("target/debug/big"), "x").unwrap();

        let provisioned = Provisioner::new()
            .isolate(true)
            .provision(
                &EnvironmentDescriptor::default(),
                dir.path(),
                &IndexMap::new(),
                &[],
                &Executor::new(),
                &CancelToken::new(),
            )
            .unwrap();

        assert!(provisioned.is_isolated());
        assert_ne!(provisioned.workspace, dir.path());
        assert!(provisioned.workspace.join("src/lib.rs").exists());
        assert!(!provisioned.workspace.join("target").exists());
        assert!(!provisioned.workspace.join(".git").exists());
    }
}
