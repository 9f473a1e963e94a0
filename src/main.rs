//! Shipcheck - build-verification pipelines for your repository.
//!
//! Runs a declared pipeline across every matrix environment, restoring and
//! saving dependency caches around the steps.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shipcheck::cache::{age, compute_key, FsCacheStore};
use shipcheck::core::{host_os, CancelToken, Config, Executor, Provisioner};
use shipcheck::pipeline::{
    expand_matrix, find_pipeline, parse_pipeline, pipeline_files, render_lenient,
    EnvironmentDescriptor, Orchestrator, Pipeline, PipelineRunner, TemplateContext, TriggerEvent,
};

/// Build-verification pipeline runner
#[derive(Parser)]
#[command(name = "shipcheck")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project root to run in
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,
}

/// Output format for reports and listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline across its matrix
    Run {
        /// Pipeline name or file (defaults to the only pipeline)
        pipeline: Option<String>,

        /// Triggering event name
        #[arg(long)]
        event: Option<String>,

        /// Triggering event action
        #[arg(long)]
        action: Option<String>,

        /// Source revision being verified
        #[arg(long, env = "SHIPCHECK_REVISION")]
        revision: Option<String>,

        /// Maximum number of environments running at once
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Skip cache restore and save
        #[arg(long)]
        no_cache: bool,

        /// Show what would run without running it
        #[arg(long)]
        dry_run: bool,

        /// Report format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show the environments a pipeline expands to
    Matrix {
        /// Pipeline name or file
        pipeline: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Validate pipeline declarations
    Validate {
        /// Pipeline file (defaults to every discovered file)
        pipeline: Option<String>,
    },

    /// Show the cache keys each environment would use
    Keys {
        /// Pipeline name or file
        pipeline: Option<String>,
    },

    /// List discovered pipelines
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Manage the cache store
    Cache {
        /// Cache operation
        #[command(subcommand)]
        operation: CacheOperation,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheOperation {
    /// List stored cache blobs
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Remove every stored cache blob
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    let code = match cli.command {
        Commands::Run { pipeline, event, action, revision, jobs, no_cache, dry_run, format } => {
            let trigger = trigger_event(event, action, revision);
            let options = RunOptions { jobs, no_cache, dry_run, format };
            cmd_run(&cli.dir, pipeline.as_deref(), trigger, &options)?
        }
        Commands::Matrix { pipeline, format } => {
            cmd_matrix(&cli.dir, pipeline.as_deref(), format)?;
            0
        }
        Commands::Validate { pipeline } => cmd_validate(&cli.dir, pipeline.as_deref())?,
        Commands::Keys { pipeline } => {
            cmd_keys(&cli.dir, pipeline.as_deref())?;
            0
        }
        Commands::List { format } => {
            cmd_list(&cli.dir, format)?;
            0
        }
        Commands::Cache { operation } => {
            cmd_cache(&cli.dir, operation)?;
            0
        }
        Commands::Config { path } => {
            cmd_config(&cli.dir, path)?;
            0
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}

/// Options for `shipcheck run`.
struct RunOptions {
    jobs: Option<usize>,
    no_cache: bool,
    dry_run: bool,
    format: Format,
}

/// Build the triggering event from command line flags.
///
/// With neither flag this is a freshly opened pull request.
fn trigger_event(
    event: Option<String>,
    action: Option<String>,
    revision: Option<String>,
) -> TriggerEvent {
    let mut trigger = match (event, action) {
        (None, None) => TriggerEvent::default(),
        (event, action) => {
            let trigger = TriggerEvent::new(event.unwrap_or_else(|| "pull_request".to_string()));
            match action {
                Some(action) => trigger.with_action(action),
                None => trigger,
            }
        }
    };

    if let Some(revision) = revision {
        trigger = trigger.with_revision(revision);
    }

    trigger
}

fn provisioner(config: &Config) -> Provisioner {
    Provisioner::new().with_aliases(&config.platforms).isolate(config.workspace.isolate)
}

/// Operating system an environment would run on, without provisioning it.
fn runner_os(provisioner: &Provisioner, env: &EnvironmentDescriptor) -> String {
    env.platform()
        .and_then(|label| provisioner.resolve_os(label))
        .unwrap_or_else(|| host_os().to_string())
}

/// Run a pipeline.
fn cmd_run(root: &Path, reference: Option<&str>, trigger: TriggerEvent, options: &RunOptions) -> Result<i32> {
    let config = Config::load_from_dir(root)?;
    let (path, pipeline) = find_pipeline(root, reference)?;
    tracing::debug!(path = ?path, pipeline = %pipeline.name, "Loaded pipeline");

    if options.dry_run {
        print_dry_run(root, &pipeline, &provisioner(&config))?;
        return Ok(0);
    }

    let executor = Executor::new()
        .shell(config.general.shell.clone())
        .echo(config.general.stream_output && options.format == Format::Text);

    let mut runner = PipelineRunner::new(pipeline, root)
        .trigger(trigger)
        .shell_executor(executor)
        .provisioner(provisioner(&config));

    if config.cache.enabled && !options.no_cache {
        runner = runner.cache_store(Arc::new(FsCacheStore::new(config.cache_dir())));
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    let report = Orchestrator::new(runner)
        .max_parallel(options.jobs.unwrap_or(config.general.max_parallel))
        .run(&cancel)?;

    match options.format {
        Format::Json => println!("{}", report.to_json()?),
        Format::Text => print!("{}", report.render_text()),
    }

    Ok(report.exit_code())
}

/// Show what `run` would execute.
fn print_dry_run(root: &Path, pipeline: &Pipeline, provisioner: &Provisioner) -> Result<()> {
    println!("Pipeline: {}", pipeline.name);
    if let Some(ref desc) = pipeline.description {
        println!("Description: {desc}");
    }
    println!("Steps: {}\n", pipeline.step_count());

    println!("DRY RUN - Steps that would be executed:");
    for env in expand_matrix(&pipeline.matrix)? {
        let os = runner_os(provisioner, &env);
        let ctx = TemplateContext { matrix: &env, runner_os: &os, env: &pipeline.env, workspace: root };

        println!("\n[{env}]");
        for (i, step) in pipeline.steps.iter().enumerate() {
            println!("  {}. {} - {}", i + 1, step.name, render_lenient(&step.run, &ctx));
        }
    }

    Ok(())
}

/// Show the expanded matrix.
fn cmd_matrix(root: &Path, reference: Option<&str>, format: Format) -> Result<()> {
    let (_, pipeline) = find_pipeline(root, reference)?;
    let environments = expand_matrix(&pipeline.matrix)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&environments)?),
        Format::Text => {
            for env in &environments {
                println!("{env}");
            }
            println!("\nTotal: {} environments", environments.len());
        }
    }

    Ok(())
}

/// Validate one pipeline file, or every discovered one.
fn cmd_validate(root: &Path, reference: Option<&str>) -> Result<i32> {
    let files = match reference {
        Some(reference) => vec![PathBuf::from(reference)],
        None => pipeline_files(root)?,
    };

    if files.is_empty() {
        anyhow::bail!("No pipeline files found in {}", root.display());
    }

    let mut failures = 0;
    for file in &files {
        match parse_pipeline(file).and_then(|p| expand_matrix(&p.matrix).map(|envs| (p, envs))) {
            Ok((pipeline, environments)) => println!(
                "✓ {} ({}): {} steps, {} environments",
                pipeline.name,
                file.display(),
                pipeline.step_count(),
                environments.len()
            ),
            Err(e) => {
                failures += 1;
                println!("✗ {}: {e}", file.display());
            }
        }
    }

    Ok(i32::from(failures > 0))
}

/// Show the cache key every binding resolves to in every environment.
fn cmd_keys(root: &Path, reference: Option<&str>) -> Result<()> {
    let config = Config::load_from_dir(root)?;
    let provisioner = provisioner(&config);
    let (_, pipeline) = find_pipeline(root, reference)?;

    if pipeline.caches.is_empty() {
        println!("Pipeline '{}' declares no caches", pipeline.name);
        return Ok(());
    }

    for env in expand_matrix(&pipeline.matrix)? {
        let os = runner_os(&provisioner, &env);
        let ctx = TemplateContext { matrix: &env, runner_os: &os, env: &pipeline.env, workspace: root };

        println!("[{env}]");
        for binding in &pipeline.caches {
            match compute_key(binding, &ctx) {
                Ok(key) => println!("  {}: {key}", binding.name),
                Err(e) => println!("  {}: unavailable ({e})", binding.name),
            }
        }
    }

    Ok(())
}

/// List discovered pipelines.
fn cmd_list(root: &Path, format: Format) -> Result<()> {
    let pipelines = shipcheck::pipeline::discover_pipelines(root)?;

    match format {
        Format::Json => {
            let list: Vec<_> = pipelines
                .iter()
                .map(|(name, path, pipeline)| {
                    serde_json::json!({
                        "name": name,
                        "path": path,
                        "pipeline": pipeline.name,
                        "steps": pipeline.step_count(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Format::Text => {
            for (name, path, pipeline) in &pipelines {
                println!(
                    "{name} - {} ({} steps) [{}]",
                    pipeline.description.as_deref().unwrap_or(&pipeline.name),
                    pipeline.step_count(),
                    path.display()
                );
            }
            println!("\nTotal: {} pipelines", pipelines.len());
        }
    }

    Ok(())
}

/// Handle cache commands.
fn cmd_cache(root: &Path, operation: CacheOperation) -> Result<()> {
    let config = Config::load_from_dir(root)?;
    let store = FsCacheStore::new(config.cache_dir());

    match operation {
        CacheOperation::List { format } => {
            let entries = store.list()?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                Format::Text => {
                    for entry in &entries {
                        let age = age(entry).map_or_else(|| "unknown".to_string(), format_age);
                        println!("{} ({} bytes, {age} ago)", entry.name, entry.size);
                    }
                    println!("\nTotal: {} entries in {}", entries.len(), store.root().display());
                }
            }
        }
        CacheOperation::Clear => {
            let removed = store.clear()?;
            println!("Removed {removed} cache entries from {}", store.root().display());
        }
    }

    Ok(())
}

fn format_age(age: chrono::Duration) -> String {
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m", age.num_minutes())
    } else {
        format!("{}s", age.num_seconds().max(0))
    }
}

/// Show configuration.
fn cmd_config(root: &Path, show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load_from_dir(root)?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "shipcheck", &mut io::stdout());
}
