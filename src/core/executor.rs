//! Command execution module.
//!
//! Handles spawning shell processes, capturing their output and killing them
//! when a run is cancelled.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::CancelToken;

/// A shell command ready to execute.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    /// The shell command text
    pub command: String,

    /// Working directory
    pub working_dir: Option<PathBuf>,

    /// Environment variables added to the inherited environment
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    /// Create a command.
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), working_dir: None, env: Vec::new() }
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of executing a command.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command (`None` when it was killed by cancellation)
    pub status: Option<ExitStatus>,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Time taken to execute
    pub duration: Duration,

    /// Whether the command was killed because the run was cancelled
    pub cancelled: bool,
}

impl ExecutionResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    /// Get the exit code.
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Command executor.
#[derive(Debug, Clone)]
pub struct Executor {
    /// Shell program and leading arguments (e.g. `bash -eo pipefail -c`)
    pub shell: Option<String>,

    /// Whether to echo output lines to the terminal as they arrive
    pub echo: bool,

    /// Prefix for echoed lines
    pub label: Option<String>,

    /// How often a running process is checked for exit or cancellation
    pub poll_interval: Duration,

    /// How long to keep reading output after the process exited
    pub output_grace: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            shell: None,
            echo: false,
            label: None,
            poll_interval: Duration::from_millis(25),
            output_grace: Duration::from_millis(250),
        }
    }
}

impl Executor {
    /// Create a new executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom shell.
    #[must_use]
    pub fn shell(mut self, shell: Option<String>) -> Self {
        self.shell = shell;
        self
    }

    /// Set whether to echo output.
    #[must_use]
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Set the prefix for echoed lines.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Build the process for a command.
    fn build(&self, command: &ShellCommand) -> ProcessCommand {
        let (program, args) = self.shell_invocation();

        let mut cmd = ProcessCommand::new(program);
        cmd.args(args);
        cmd.arg(&command.command);

        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Own process group so cancellation can take down the whole tree
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd
    }

    fn shell_invocation(&self) -> (String, Vec<String>) {
        if let Some(ref shell) = self.shell {
            let mut parts = shell.split_whitespace().map(str::to_string);
            if let Some(program) = parts.next() {
                return (program, parts.collect());
            }
        }

        let (shell, arg) = get_shell();
        (shell.to_string(), vec![arg.to_string()])
    }

    /// Execute a command, blocking until it exits or `cancel` is set.
    pub fn execute(
        &self,
        command: &ShellCommand,
        cancel: &CancelToken,
    ) -> anyhow::Result<ExecutionResult> {
        let start = Instant::now();

        let mut child = self.build(command).spawn()?;

        let stdout_handle = self.spawn_reader(child.stdout.take(), false);
        let stderr_handle = self.spawn_reader(child.stderr.take(), true);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if cancel.is_cancelled() {
                terminate(&mut child);
                break None;
            }
            thread::sleep(self.poll_interval);
        };

        let cancelled = status.is_none();

        // Background processes may keep the pipes open long after the shell
        // exited, so output is collected until EOF or the grace period ends.
        let grace = if cancelled { Duration::ZERO } else { self.output_grace };
        let deadline = Instant::now() + grace;
        let stdout = self.collect(stdout_handle, deadline);
        let stderr = self.collect(stderr_handle, deadline);

        Ok(ExecutionResult { status, stdout, stderr, duration: start.elapsed(), cancelled })
    }

    fn spawn_reader<R>(&self, pipe: Option<R>, is_stderr: bool) -> Option<OutputReader>
    where
        R: Read + Send + 'static,
    {
        let pipe = pipe?;
        let echo = self.echo;
        let label = self.label.clone();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);

        let handle = thread::spawn(move || {
            let reader = BufReader::new(pipe);
            for line in reader.lines().map_while(Result::ok) {
                if echo {
                    match (&label, is_stderr) {
                        (Some(label), true) => eprintln!("[{label}] {line}"),
                        (Some(label), false) => println!("[{label}] {line}"),
                        (None, true) => eprintln!("{line}"),
                        (None, false) => println!("{line}"),
                    }
                }
                captured.lock().push(line);
            }
        });

        Some(OutputReader { lines, handle })
    }

    /// Output read so far, waiting for EOF until `deadline`.
    fn collect(&self, reader: Option<OutputReader>, deadline: Instant) -> String {
        let Some(reader) = reader else {
            return String::new();
        };

        while !reader.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(self.poll_interval.min(deadline.saturating_duration_since(Instant::now())));
        }

        if reader.handle.is_finished() {
            let _ = reader.handle.join();
        } else {
            tracing::debug!("Output pipe still open after exit, detaching reader");
        }

        let lines = reader.lines.lock();
        lines.join("\n")
    }
}

/// Background thread draining one output pipe.
struct OutputReader {
    lines: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

/// Kill a child and everything it spawned.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let _ = ProcessCommand::new("kill").args(["-KILL", "--", &group]).output();
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Get the shell and argument for the current platform.
fn get_shell() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}
