//! Matrix expansion.
//!
//! Turns declared axes into one environment descriptor per combination.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Axis names whose value selects the operating system.
pub const PLATFORM_AXES: [&str; 3] = ["platform", "os", "runs-on"];

/// One concrete combination of matrix axis values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentDescriptor {
    values: IndexMap<String, String>,
}

impl EnvironmentDescriptor {
    /// Build a descriptor from `(axis, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    /// Value of an axis.
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.values.get(axis).map(String::as_str)
    }

    /// Iterate `(axis, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The platform label, if any platform axis is present.
    pub fn platform(&self) -> Option<&str> {
        PLATFORM_AXES.iter().find_map(|axis| self.get(axis))
    }

    /// Whether the descriptor has no axes.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `MATRIX_<AXIS>` environment variables for step commands.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(axis, value)| {
                let name: String = axis
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                    .collect();
                (format!("MATRIX_{name}"), value.clone())
            })
            .collect()
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.is_empty() {
            return write!(f, "default");
        }
        let parts: Vec<String> = self.values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Check that every axis has at least one value.
pub fn validate_axes(axes: &IndexMap<String, Vec<String>>) -> PipelineResult<()> {
    match axes.iter().find(|(_, values)| values.is_empty()) {
        Some((axis, _)) => Err(PipelineError::EmptyAxis(axis.clone())),
        None => Ok(()),
    }
}

/// Expand axes into their Cartesian product.
///
/// The first-declared axis varies slowest. No axes yields a single empty
/// descriptor so that an axis-less pipeline still runs once.
pub fn expand_matrix(
    axes: &IndexMap<String, Vec<String>>,
) -> PipelineResult<Vec<EnvironmentDescriptor>> {
    validate_axes(axes)?;

    let mut combinations: Vec<Vec<(&str, &str)>> = vec![Vec::new()];

    for (axis, values) in axes {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for prefix in &combinations {
            for value in values {
                let mut combination = prefix.clone();
                combination.push((axis.as_str(), value.as_str()));
                next.push(combination);
            }
        }
        combinations = next;
    }

    Ok(combinations.into_iter().map(EnvironmentDescriptor::from_pairs).collect())
}
