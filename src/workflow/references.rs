//! Parameter Reference Resolution
//!
//! Node parameters may point at outputs of other nodes using
//! `{{node_id}}` or `{{node_id.path.to.field}}` placeholders:
//! - A parameter that is exactly one placeholder takes the referenced JSON value
//! - Placeholders embedded in longer text are replaced by their textual form
//! - Array elements are addressed by numeric path segments (`{{scan.hosts.0}}`)

use std::collections::{BTreeMap, HashMap};

use log::debug;
use serde_json::Value;
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A single `{{...}}` placeholder found in a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Placeholder text including braces, as written
    pub raw: String,
    pub node_id: String,
    pub path: Vec<String>,
}

/// Why a parameter could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("parameter '{parameter}' references '{node_id}', which has no output in this run")]
    UnavailableOutput { parameter: String, node_id: String },

    #[error("parameter '{parameter}': output of '{node_id}' has no field '{path}'")]
    MissingPath {
        parameter: String,
        node_id: String,
        path: String,
    },

    #[error("parameter '{parameter}' has an unterminated or empty '{{{{' placeholder")]
    Malformed { parameter: String },
}

/// Returns true if the text contains at least one placeholder opening.
pub fn has_references(text: &str) -> bool {
    text.contains(OPEN)
}

/// Extracts every placeholder from a string.
///
/// Returns `None` when a placeholder is left open or is empty.
///
/// # Example
/// ```
/// use blockrunner::workflow::references::extract_references;
///
/// let refs = extract_references("host {{scan.hosts.0}} is {{ping.status}}").unwrap();
/// assert_eq!(refs.len(), 2);
/// assert_eq!(refs[0].node_id, "scan");
/// assert_eq!(refs[0].path, vec!["hosts", "0"]);
/// ```
pub fn extract_references(text: &str) -> Option<Vec<Reference>> {
    let mut references = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open.find(CLOSE)?;
        let inner = after_open[..end].trim();
        if inner.is_empty() {
            return None;
        }

        let mut segments = inner.split('.').map(|s| s.trim().to_string());
        let node_id = segments.next().unwrap_or_default();
        if node_id.is_empty() {
            return None;
        }

        references.push(Reference {
            raw: rest[start..start + OPEN.len() + end + CLOSE.len()].to_string(),
            node_id,
            path: segments.filter(|s| !s.is_empty()).collect(),
        });
        rest = &after_open[end + CLOSE.len()..];
    }

    Some(references)
}

/// Returns the ids of every node referenced anywhere in a parameter map.
pub fn referenced_nodes(parameters: &BTreeMap<String, Value>) -> Vec<String> {
    let mut ids = Vec::new();
    for value in parameters.values() {
        collect_node_ids(value, &mut ids);
    }
    ids.sort();
    ids.dedup();
    ids
}

fn collect_node_ids(value: &Value, ids: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            if let Some(refs) = extract_references(text) {
                ids.extend(refs.into_iter().map(|r| r.node_id));
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_node_ids(v, ids)),
        Value::Object(map) => map.values().for_each(|v| collect_node_ids(v, ids)),
        _ => {}
    }
}

/// Resolves every placeholder in a parameter map against upstream outputs.
pub fn resolve_parameters(
    parameters: &BTreeMap<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ReferenceError> {
    parameters
        .iter()
        .map(|(name, value)| Ok((name.clone(), resolve_value(name, value, outputs)?)))
        .collect()
}

fn resolve_value(
    parameter: &str,
    value: &Value,
    outputs: &HashMap<String, Value>,
) -> Result<Value, ReferenceError> {
    match value {
        Value::String(text) if has_references(text) => resolve_text(parameter, text, outputs),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(parameter, v, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(parameter, v, outputs)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_text(
    parameter: &str,
    text: &str,
    outputs: &HashMap<String, Value>,
) -> Result<Value, ReferenceError> {
    let references = extract_references(text).ok_or_else(|| ReferenceError::Malformed {
        parameter: parameter.to_string(),
    })?;

    // Whole-value placeholder keeps the referenced JSON type
    if let [only] = references.as_slice() {
        if only.raw == text.trim() {
            return lookup(parameter, only, outputs).cloned();
        }
    }

    let mut rendered = text.to_string();
    for reference in &references {
        let replacement = match lookup(parameter, reference, outputs)? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replacen(&reference.raw, &replacement, 1);
    }

    debug!("Resolved parameter '{}' to '{}'", parameter, rendered);
    Ok(Value::String(rendered))
}

fn lookup<'a>(
    parameter: &str,
    reference: &Reference,
    outputs: &'a HashMap<String, Value>,
) -> Result<&'a Value, ReferenceError> {
    let mut current =
        outputs
            .get(&reference.node_id)
            .ok_or_else(|| ReferenceError::UnavailableOutput {
                parameter: parameter.to_string(),
                node_id: reference.node_id.clone(),
            })?;

    for segment in &reference.path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| ReferenceError::MissingPath {
            parameter: parameter.to_string(),
            node_id: reference.node_id.clone(),
            path: reference.path.join("."),
        })?;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        outputs.insert(
            "scan".to_string(),
            json!({"hosts": ["10.0.0.1", "10.0.0.2"], "count": 2}),
        );
        outputs.insert("ping".to_string(), json!({"status": 200, "ok": true}));
        outputs
    }

    fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_has_references() {
        assert!(has_references("{{scan}}"));
        assert!(!has_references("plain text"));
    }

    #[test]
    fn test_extract_references_with_whitespace() {
        let refs = extract_references("{{ ping . status }}").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].node_id, "ping");
        assert_eq!(refs[0].path, vec!["status"]);
        assert_eq!(refs[0].raw, "{{ ping . status }}");
    }

    #[test]
    fn test_extract_references_malformed() {
        assert!(extract_references("{{ping.status").is_none());
        assert!(extract_references("{{   }}").is_none());
    }

    #[test]
    fn test_whole_reference_keeps_json_type() {
        let resolved = resolve_parameters(
            &params(&[("hosts", json!("{{scan.hosts}}")), ("n", json!("{{scan.count}}"))]),
            &outputs(),
        )
        .unwrap();

        assert_eq!(resolved["hosts"], json!(["10.0.0.1", "10.0.0.2"]));
        assert_eq!(resolved["n"], json!(2));
    }

    #[test]
    fn test_embedded_references_render_as_text() {
        let resolved = resolve_parameters(
            &params(&[(
                "message",
                json!("first host {{scan.hosts.0}} answered {{ping.status}}"),
            )]),
            &outputs(),
        )
        .unwrap();

        assert_eq!(resolved["message"], json!("first host 10.0.0.1 answered 200"));
    }

    #[test]
    fn test_nested_values_are_resolved() {
        let resolved = resolve_parameters(
            &params(&[("body", json!({"targets": ["{{scan.hosts.1}}"], "retries": 3}))]),
            &outputs(),
        )
        .unwrap();

        assert_eq!(resolved["body"], json!({"targets": ["10.0.0.2"], "retries": 3}));
    }

    #[test]
    fn test_literals_untouched() {
        let original = params(&[("ms", json!(50)), ("url", json!("http://x"))]);
        let resolved = resolve_parameters(&original, &outputs()).unwrap();
        assert_eq!(resolved, original);
    }

    #[test]
    fn test_unavailable_output() {
        let err = resolve_parameters(&params(&[("x", json!("{{ghost}}"))]), &outputs()).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::UnavailableOutput {
                parameter: "x".to_string(),
                node_id: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_path() {
        let err = resolve_parameters(&params(&[("x", json!("{{scan.hosts.9}}"))]), &outputs())
            .unwrap_err();
        assert!(matches!(err, ReferenceError::MissingPath { ref path, .. } if path == "hosts.9"));
        assert!(err.to_string().contains("hosts.9"));
    }

    #[test]
    fn test_referenced_nodes() {
        let ids = referenced_nodes(&params(&[
            ("a", json!("{{scan.count}} and {{ping}}")),
            ("b", json!(["{{scan}}"])),
            ("c", json!(1)),
        ]));
        assert_eq!(ids, vec!["ping", "scan"]);
    }
}
