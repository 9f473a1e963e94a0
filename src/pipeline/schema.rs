//! Pipeline schema definitions.
//!
//! Defines the YAML structure for pipeline declaration files.

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::trigger::TriggerCondition;

/// A pipeline declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Name of the pipeline
    pub name: String,

    /// Description of what this pipeline verifies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Event condition that starts this pipeline (absent = any event)
    #[serde(rename = "on", default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerCondition>,

    /// Matrix axes, in declaration order
    #[serde(default, deserialize_with = "deserialize_axes")]
    pub matrix: IndexMap<String, Vec<String>>,

    /// Environment variables shared by every step
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,

    /// Probe commands that must succeed before an environment counts as provisioned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provision: Vec<String>,

    /// Cache bindings restored before the steps and saved after
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<CacheBinding>,

    /// Steps to execute, in order
    pub steps: Vec<Step>,
}

/// A step in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Display name of the step
    pub name: String,

    /// Shell command text
    #[serde(alias = "command")]
    pub run: String,

    /// Description of this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Environment variables for this step
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,

    /// Working directory, relative to the environment workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// What happens when the step fails
    #[serde(default)]
    pub failure: FailurePolicy,
}

/// Step failure policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the run at this step.
    #[default]
    FailFast,
}

/// A cache binding: a restorable/savable path and its content-derived key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheBinding {
    /// Logical name of the binding
    pub name: String,

    /// Path restored before and saved after the run (`~` is expanded)
    pub path: String,

    /// Key template, e.g. `{{ runner.os }}-cargo-{{ hashFiles('Cargo.lock') }}`
    pub key: String,
}

impl CacheBinding {
    /// Create a binding.
    pub fn new(name: impl Into<String>, path: impl Into<String>, key: impl Into<String>) -> Self {
        Self { name: name.into(), path: path.into(), key: key.into() }
    }
}

impl Step {
    /// Create a step with the minimum required fields.
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            description: None,
            env: IndexMap::new(),
            working_dir: None,
            failure: FailurePolicy::FailFast,
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Pipeline {
    /// Get the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Get the declared axis names.
    #[must_use]
    pub fn axis_names(&self) -> Vec<&str> {
        self.matrix.keys().map(String::as_str).collect()
    }
}

/// Matrix values may be written as strings, integers or booleans; store them as text.
///
/// Floats are rejected: YAML reads `1.70` as the number 1.7, which would
/// silently select a different toolchain.
fn deserialize_axes<'de, D>(deserializer: D) -> Result<IndexMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: IndexMap<String, Vec<serde_yaml::Value>> = IndexMap::deserialize(deserializer)?;

    raw.into_iter()
        .map(|(axis, values)| {
            let values = values
                .into_iter()
                .map(|value| match value {
                    serde_yaml::Value::String(s) => Ok(s),
                    serde_yaml::Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
                    serde_yaml::Value::Number(n) => Err(D::Error::custom(format!(
                        "matrix axis '{axis}' value {n} is read as a float; quote it (e.g. \"1.70\")"
                    ))),
                    serde_yaml::Value::Bool(b) => Ok(b.to_string()),
                    _ => Err(D::Error::custom(format!(
                        "matrix axis '{axis}' values must be scalars"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((axis, values))
        })
        .collect()
}
