//! Workflow Parser
//!
//! Loads workflow snapshots exported by the CRUD layer. Files ending in
//! `.json` are read as JSON, everything else as YAML.

use std::fs;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use super::model::Workflow;

/// Errors raised while loading a workflow file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read workflow file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse workflow JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parses a workflow from YAML text.
pub fn parse_workflow(content: &str) -> Result<Workflow, ParseError> {
    Ok(serde_yaml::from_str(content)?)
}

/// Loads a workflow snapshot from a YAML or JSON file.
///
/// The snapshot is returned as-is; structural validation is the compiler's
/// job, so a file with dangling edges or cycles still loads.
///
/// # Example
///
/// ```rust,no_run
/// use blockrunner::workflow::{compile, load_workflow};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("nightly.yaml")?;
///     let compilation = compile(&workflow.nodes, &workflow.edges);
///     println!("{} levels", compilation.total_levels());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let mut workflow: Workflow = if is_json {
        serde_json::from_str(&content)?
    } else {
        parse_workflow(&content)?
    };

    if workflow.id.is_empty() {
        workflow.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    info!(
        "Parsed workflow '{}': {} nodes, {} edges",
        workflow.id,
        workflow.nodes.len(),
        workflow.edges.len()
    );

    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const YAML: &str = r#"
id: wf-1
name: Health check
nodes:
  - id: start
    type: control/start
  - id: wait
    type: delay
    parameters:
      ms: 10
    position: { x: 120, y: 40 }
edges:
  - id: e1
    source: start
    sourceHandle: out
    target: wait
    targetHandle: in
variables:
  region: eu-west
"#;

    #[test]
    fn test_parse_yaml() {
        let workflow = parse_workflow(YAML).unwrap();

        assert_eq!(workflow.id, "wf-1");
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.nodes[1].block_type, "delay");
        assert_eq!(workflow.nodes[1].parameters["ms"], 10);
        assert_eq!(workflow.edges[0].source_handle, "out");
        assert_eq!(workflow.variables["region"], "eu-west");
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_workflow("nodes: [ {id: a");
        assert!(matches!(result, Err(ParseError::Yaml(_))));
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("health.yaml");
        fs::write(&path, YAML).unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.name, "Health check");
    }

    #[test]
    fn test_load_json_file_defaults_id_to_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.json");
        fs::write(
            &path,
            r#"{"nodes":[{"id":"a","type":"control/start"}],"edges":[]}"#,
        )
        .unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.id, "backup");
        assert_eq!(workflow.nodes[0].id, "a");
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        match result {
            Err(ParseError::Io { path, .. }) => assert!(path.contains("workflow.yaml")),
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();

        assert!(matches!(load_workflow(&path), Err(ParseError::Json(_))));
    }
}
