//! Error types for pipeline declaration, provisioning and caching.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised while loading, validating or provisioning a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Pipeline file not found.
    #[error("Pipeline not found: {0}")]
    NotFound(PathBuf),

    /// The declaration is structurally invalid.
    #[error("Invalid pipeline declaration: {0}")]
    InvalidDeclaration(String),

    /// A matrix axis was declared without values.
    #[error("Matrix axis '{0}' must have at least one value")]
    EmptyAxis(String),

    /// A template references something that cannot be resolved.
    #[error("Unresolved expression '{expression}' in {context}")]
    UnresolvedExpression { expression: String, context: String },

    /// The execution environment could not be created.
    #[error("Failed to provision environment [{environment}]: {reason}")]
    Provision { environment: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by the cache store and archive layer.
///
/// None of these ever change a run's status; callers log them and move on.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key could not be derived from its template.
    #[error("Cannot derive cache key for '{binding}': {reason}")]
    Key { binding: String, reason: String },

    /// Packing or unpacking a cache blob failed.
    #[error("Archive error for {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisting a blob failed.
    #[error("Failed to save cache '{key}': {reason}")]
    Save { key: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
