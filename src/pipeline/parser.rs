//! Pipeline parser.
//!
//! Parses YAML pipeline declarations into [`Pipeline`] structs and finds
//! them on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{expressions, is_known_expression, referenced_axes, validate_axes, Pipeline};
use crate::error::{PipelineError, PipelineResult};

/// Directory (relative to a project root) holding pipeline files.
pub const PIPELINE_DIR: &str = ".shipcheck/pipelines";

/// Single-pipeline file names accepted at a project root.
pub const ROOT_FILES: [&str; 2] = ["shipcheck.yml", "shipcheck.yaml"];

/// Parse a pipeline from a file.
pub fn parse_pipeline(path: &Path) -> PipelineResult<Pipeline> {
    if !path.exists() {
        return Err(PipelineError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_pipeline_str(&content)
}

/// Parse a pipeline from a string.
pub fn parse_pipeline_str(content: &str) -> PipelineResult<Pipeline> {
    let pipeline: Pipeline = serde_yaml::from_str(content)?;
    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidDeclaration(message.into())
}

/// Validate a pipeline for structural errors.
pub fn validate_pipeline(pipeline: &Pipeline) -> PipelineResult<()> {
    if pipeline.name.trim().is_empty() {
        return Err(invalid("pipeline name cannot be empty"));
    }

    if pipeline.steps.is_empty() {
        return Err(invalid("pipeline must have at least one step"));
    }

    let mut step_names = HashSet::new();
    for (i, step) in pipeline.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(invalid(format!("step {} has no name", i + 1)));
        }
        if step.run.trim().is_empty() {
            return Err(invalid(format!("step '{}' has no command", step.name)));
        }
        if !step_names.insert(step.name.as_str()) {
            return Err(invalid(format!("duplicate step name '{}'", step.name)));
        }
    }

    validate_axes(&pipeline.matrix)?;

    let mut cache_names = HashSet::new();
    for (i, binding) in pipeline.caches.iter().enumerate() {
        if binding.name.trim().is_empty() {
            return Err(invalid(format!("cache {} has no name", i + 1)));
        }
        if binding.path.trim().is_empty() {
            return Err(invalid(format!("cache '{}' has no path", binding.name)));
        }
        if binding.key.trim().is_empty() {
            return Err(invalid(format!("cache '{}' has no key", binding.name)));
        }
        if !cache_names.insert(binding.name.as_str()) {
            return Err(invalid(format!("duplicate cache name '{}'", binding.name)));
        }
        if let Some(unknown) = expressions(&binding.key).into_iter().find(|e| !is_known_expression(e)) {
            return Err(PipelineError::UnresolvedExpression {
                expression: unknown,
                context: format!("cache '{}' key", binding.name),
            });
        }
    }

    for (context, template) in templates(pipeline) {
        for axis in referenced_axes(template) {
            if !pipeline.matrix.contains_key(&axis) {
                return Err(PipelineError::UnresolvedExpression {
                    expression: format!("matrix.{axis}"),
                    context,
                });
            }
        }
        for expression in expressions(template) {
            if !is_known_expression(&expression) {
                tracing::warn!(%context, %expression, "Unknown expression will be left as-is");
            }
        }
    }

    Ok(())
}

/// Every template string in a pipeline, labelled with where it appears.
fn templates(pipeline: &Pipeline) -> Vec<(String, &str)> {
    let mut found = Vec::new();

    for (key, value) in &pipeline.env {
        found.push((format!("env '{key}'"), value.as_str()));
    }
    for (i, probe) in pipeline.provision.iter().enumerate() {
        found.push((format!("provision command {}", i + 1), probe.as_str()));
    }
    for binding in &pipeline.caches {
        found.push((format!("cache '{}' key", binding.name), binding.key.as_str()));
        found.push((format!("cache '{}' path", binding.name), binding.path.as_str()));
    }
    for step in &pipeline.steps {
        found.push((format!("step '{}'", step.name), step.run.as_str()));
        if let Some(ref dir) = step.working_dir {
            found.push((format!("step '{}' working_dir", step.name), dir.as_str()));
        }
        for (key, value) in &step.env {
            found.push((format!("step '{}' env '{key}'", step.name), value.as_str()));
        }
    }

    found
}

/// Candidate pipeline files under a project root, sorted.
///
/// `.shipcheck/pipelines/*.{yml,yaml}` plus `shipcheck.{yml,yaml}` at the root.
pub fn pipeline_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    let pipeline_dir = dir.join(PIPELINE_DIR);
    if pipeline_dir.is_dir() {
        for entry in std::fs::read_dir(&pipeline_dir)?.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
                files.push(path);
            }
        }
    }

    for file in ROOT_FILES {
        let path = dir.join(file);
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Discover pipelines under a project root.
///
/// Returns `(name, path, pipeline)` triples sorted by name. Files that fail
/// to parse are logged and skipped.
pub fn discover_pipelines(dir: &Path) -> PipelineResult<Vec<(String, PathBuf, Pipeline)>> {
    let mut pipelines: Vec<_> =
        pipeline_files(dir)?.iter().filter_map(|path| load_named(path)).collect();

    pipelines.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pipelines)
}

fn load_named(path: &Path) -> Option<(String, PathBuf, Pipeline)> {
    match parse_pipeline(path) {
        Ok(pipeline) => {
            let name = path
                .file_stem()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();
            tracing::debug!(path = ?path, %name, "Discovered pipeline");
            Some((name, path.to_path_buf(), pipeline))
        }
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Failed to parse pipeline");
            None
        }
    }
}

/// Find a pipeline by name or path.
///
/// `reference` may be a path to a file, or the name of a discovered
/// pipeline. With no reference the project must contain exactly one
/// pipeline.
pub fn find_pipeline(root: &Path, reference: Option<&str>) -> PipelineResult<(PathBuf, Pipeline)> {
    if let Some(reference) = reference {
        let path = PathBuf::from(reference);
        if path.is_file() {
            let pipeline = parse_pipeline(&path)?;
            return Ok((path, pipeline));
        }
    }

    let mut discovered = discover_pipelines(root)?;

    match reference {
        Some(reference) => discovered
            .into_iter()
            .find(|(name, _, p)| name == reference || p.name == reference)
            .map(|(_, path, pipeline)| (path, pipeline))
            .ok_or_else(|| PipelineError::NotFound(PathBuf::from(reference))),
        None if discovered.len() == 1 => {
            let (_, path, pipeline) = discovered.remove(0);
            Ok((path, pipeline))
        }
        None if discovered.is_empty() => Err(PipelineError::NotFound(root.join(PIPELINE_DIR))),
        None => Err(invalid(format!(
            "{} pipelines found, name one of: {}",
            discovered.len(),
            discovered.iter().map(|(n, _, _)| n.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const CI: &str = r#"
name: ci
on:
  event: pull_request
  types: [opened]
matrix:
  toolchain: [stable]
  platform: [ubuntu-latest]
caches:
  - name: cargo-registry
    path: ~/.cargo/registry
    key: "{{ runner.os }}-cargo-registry-{{ hashFiles('**/Cargo.lock') }}"
steps:
  - name: fmt
    run: cargo fmt -- --check
  - name: check
    run: cargo +{{ matrix.toolchain }} check
"#;

    #[test]
    fn test_parse_valid_pipeline() {
        let pipeline = parse_pipeline_str(CI).unwrap();
        assert_eq!(pipeline.name, "ci");
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.caches.len(), 1);
        assert_eq!(pipeline.trigger.unwrap().types, vec!["opened"]);
    }

    #[test]
    fn test_command_alias() {
        let yaml = r#"
name: test
steps:
  - name: step1
    command: echo "hello"
"#;
        let pipeline = parse_pipeline_str(yaml).unwrap();
        assert_eq!(pipeline.steps[0].run, "echo \"hello\"");
    }

    #[test]
    fn test_parse_empty_name_fails() {
        let yaml = r#"
name: ""
steps:
  - name: step1
    run: echo "hello"
"#;
        assert!(matches!(parse_pipeline_str(yaml), Err(PipelineError::InvalidDeclaration(_))));
    }

    #[test]
    fn test_parse_no_steps_fails() {
        let yaml = r"
name: test
steps: []
";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_duplicate_step_names_fail() {
        let yaml = r"
name: test
steps:
  - name: build
    run: make
  - name: build
    run: make install
";
        let err = parse_pipeline_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'build'"));
    }

    #[test]
    fn test_empty_axis_fails() {
        let yaml = r"
name: test
matrix:
  toolchain: []
steps:
  - name: build
    run: make
";
        assert!(matches!(parse_pipeline_str(yaml), Err(PipelineError::EmptyAxis(axis)) if axis == "toolchain"));
    }

    #[test]
    fn test_duplicate_cache_names_fail() {
        let yaml = r"
name: test
caches:
  - name: deps
    path: a
    key: one
  - name: deps
    path: b
    key: two
steps:
  - name: build
    run: make
";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_axis_reference_fails() {
        let yaml = r"
name: test
matrix:
  toolchain: [stable]
steps:
  - name: build
    run: cargo +{{ matrix.rust }} build
";
        let err = parse_pipeline_str(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedExpression { ref expression, .. } if expression == "matrix.rust"));
    }

    #[test]
    fn test_unknown_expression_in_cache_key_fails() {
        let yaml = r#"
name: test
caches:
  - name: deps
    path: deps
    key: "deps-{{ github.sha }}"
steps:
  - name: build
    run: echo {{ github.sha }}
"#;
        let err = parse_pipeline_str(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedExpression { ref expression, .. } if expression == "github.sha"));
    }

    #[test]
    fn test_unknown_expression_in_command_is_allowed() {
        let yaml = r"
name: test
steps:
  - name: build
    run: echo {{ github.sha }}
";
        assert!(parse_pipeline_str(yaml).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let result = parse_pipeline(Path::new("/nonexistent/shipcheck.yml"));
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_discover_pipelines() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipelines = dir.path().join(PIPELINE_DIR);
        fs::create_dir_all(&pipelines).unwrap();
        fs::write(pipelines.join("ci.yml"), CI).unwrap();
        fs::write(pipelines.join("broken.yaml"), "name: [").unwrap();
        fs::write(pipelines.join("notes.txt"), "not a pipeline").unwrap();
        fs::write(dir.path().join("shipcheck.yml"), "name: root\nsteps:\n  - name: a\n    run: 'true'\n")
            .unwrap();

        assert_eq!(pipeline_files(dir.path()).unwrap().len(), 3);

        let found = discover_pipelines(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ci", "shipcheck"]);
    }

    #[test]
    fn test_find_pipeline() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipelines = dir.path().join(PIPELINE_DIR);
        fs::create_dir_all(&pipelines).unwrap();
        fs::write(pipelines.join("ci.yml"), CI).unwrap();

        let (path, pipeline) = find_pipeline(dir.path(), None).unwrap();
        assert_eq!(pipeline.name, "ci");
        assert!(path.ends_with("ci.yml"));

        assert!(find_pipeline(dir.path(), Some("ci")).is_ok());
        assert!(matches!(find_pipeline(dir.path(), Some("nightly")), Err(PipelineError::NotFound(_))));
    }
}
