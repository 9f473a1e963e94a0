//! # Shipcheck
//!
//! Build-verification pipeline runner for your repository.
//!
//! Shipcheck reads a declarative pipeline (trigger, matrix, caches and shell
//! steps), expands the matrix into environments and runs the steps in each
//! one with fail-fast semantics. Dependency caches are restored before the
//! steps and saved afterwards, keyed on the content of your lockfiles.
//!
//! ## Features
//!
//! - **Matrix Expansion**: Every combination of toolchain, platform and any other axis
//! - **Fail-Fast Runs**: A failing step stops its environment, never its siblings
//! - **Content-Keyed Caches**: `hashFiles('**/Cargo.lock')` style cache keys
//! - **Parallel Environments**: Bounded worker pool with Ctrl-C cancellation
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the pipeline in .shipcheck/pipelines/
//! shipcheck run
//!
//! # Show the environments it expands to
//! shipcheck matrix
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_arguments)]

pub mod cache;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod report;

pub use cache::{CacheSession, CacheState, CacheStore, FsCacheStore, SaveOutcome};
pub use core::{CancelToken, Config, Executor, Provisioner};
pub use error::{CacheError, PipelineError};
pub use pipeline::{
    expand_matrix, EnvironmentDescriptor, Orchestrator, Pipeline, PipelineRunner, RunResult,
    RunStatus, Step, TriggerEvent,
};
pub use report::PipelineReport;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "shipcheck";
