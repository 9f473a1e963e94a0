//! Template expressions.
//!
//! Resolves `{{ ... }}` expressions in step commands, provision probes and
//! cache keys: `matrix.<axis>`, `runner.os`, `env.<NAME>` and
//! `hashFiles('<pattern>', ...)`.

use std::path::Path;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::matrix::EnvironmentDescriptor;
use crate::cache::hash_files;
use crate::error::{PipelineError, PipelineResult};

static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("valid expression regex"));

static HASH_FILES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hashFiles\((.*)\)$").expect("valid hashFiles regex"));

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'([^']*)'|"([^"]*)""#).expect("valid quoted regex"));

/// Values available to template expressions.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// The environment being run
    pub matrix: &'a EnvironmentDescriptor,

    /// Operating system of the executing environment
    pub runner_os: &'a str,

    /// Pipeline-level environment variables
    pub env: &'a IndexMap<String, String>,

    /// Directory `hashFiles` patterns are resolved against
    pub workspace: &'a Path,
}

impl<'a> TemplateContext<'a> {
    /// Evaluate a single expression (without the braces).
    fn evaluate(&self, expression: &str) -> Option<String> {
        if let Some(axis) = expression.strip_prefix("matrix.") {
            return self.matrix.get(axis).map(str::to_string);
        }

        if expression == "runner.os" {
            return Some(self.runner_os.to_string());
        }

        if let Some(name) = expression.strip_prefix("env.") {
            return self.env.get(name).cloned();
        }

        if let Some(caps) = HASH_FILES.captures(expression) {
            let patterns = quoted_args(&caps[1]);
            if patterns.is_empty() {
                return None;
            }
            return match hash_files(self.workspace, &patterns) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    tracing::warn!(expression, error = %e, "hashFiles failed");
                    None
                }
            };
        }

        None
    }
}

/// Render a template, leaving unresolvable expressions untouched.
///
/// Used for shell commands, where `{{` may legitimately appear.
pub fn render_lenient(template: &str, ctx: &TemplateContext<'_>) -> String {
    EXPRESSION
        .replace_all(template, |caps: &Captures| {
            ctx.evaluate(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Render a template, failing on the first unresolvable expression.
pub fn render_strict(
    template: &str,
    ctx: &TemplateContext<'_>,
    context: &str,
) -> PipelineResult<String> {
    let mut unresolved = None;

    let rendered = EXPRESSION.replace_all(template, |caps: &Captures| {
        ctx.evaluate(&caps[1]).unwrap_or_else(|| {
            unresolved.get_or_insert_with(|| caps[1].to_string());
            String::new()
        })
    });

    match unresolved {
        Some(expression) => {
            Err(PipelineError::UnresolvedExpression { expression, context: context.to_string() })
        }
        None => Ok(rendered.into_owned()),
    }
}

/// Matrix axes referenced by a template.
pub fn referenced_axes(template: &str) -> Vec<String> {
    EXPRESSION
        .captures_iter(template)
        .filter_map(|caps| caps[1].strip_prefix("matrix.").map(str::to_string))
        .collect()
}

/// Whether a single expression is one this module knows how to evaluate.
pub fn is_known_expression(expression: &str) -> bool {
    expression.starts_with("matrix.")
        || expression.starts_with("env.")
        || expression == "runner.os"
        || HASH_FILES.is_match(expression)
}

/// Expressions (without braces) found in a template.
pub fn expressions(template: &str) -> Vec<String> {
    EXPRESSION.captures_iter(template).map(|caps| caps[1].to_string()).collect()
}

fn quoted_args(args: &str) -> Vec<String> {
    QUOTED
        .captures_iter(args)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string()))
        .collect()
}
