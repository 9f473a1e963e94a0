//! Pipeline declarations and their execution.
//!
//! A pipeline is a YAML file declaring a trigger condition, matrix axes,
//! cache bindings and an ordered list of shell steps. Each matrix
//! combination becomes an independent run of the steps.

mod matrix;
mod orchestrator;
mod parser;
mod runner;
mod schema;
mod template;
mod trigger;

pub use matrix::{expand_matrix, validate_axes, EnvironmentDescriptor, PLATFORM_AXES};
pub use orchestrator::Orchestrator;
pub use parser::{
    discover_pipelines, find_pipeline, parse_pipeline, parse_pipeline_str, pipeline_files,
    validate_pipeline, PIPELINE_DIR, ROOT_FILES,
};
pub use runner::{
    execute_run, PipelineRunner, RunResult, RunState, RunStatus, ShellStepExecutor, StepContext,
    StepExecutor, StepResult,
};
pub use schema::{CacheBinding, FailurePolicy, Pipeline, Step};
pub use template::{
    expressions, is_known_expression, referenced_axes, render_lenient, render_strict,
    TemplateContext,
};
pub use trigger::{should_run, TriggerCondition, TriggerEvent};
