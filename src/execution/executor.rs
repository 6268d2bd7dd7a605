//! Block Executors
//!
//! The engine treats block execution as an opaque capability: it hands a
//! node's type and resolved parameters to a [`BlockExecutor`] and records
//! whatever comes back. Two executors ship with the crate:
//! - [`DryRunExecutor`]: echoes parameters without side effects
//! - [`BuiltinExecutor`]: a small catalog of local blocks for the CLI

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};

use super::error::NodeExecutionError;

/// Everything an executor needs to run one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInvocation {
    pub run_id: String,
    pub node_id: String,
    pub block_type: String,
    /// Parameters with `{{node.path}}` references already resolved
    pub parameters: BTreeMap<String, Value>,
}

impl NodeInvocation {
    /// Returns a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

/// Performs the effect of a single block.
///
/// Calls may be long-running; the engine imposes no timeout and never
/// aborts an in-flight call, so implementations own their own deadlines.
/// Every call must eventually resolve for the run to make progress.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&self, invocation: &NodeInvocation) -> Result<Value, NodeExecutionError>;
}

/// Completes every node with its resolved parameters as output.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl BlockExecutor for DryRunExecutor {
    async fn execute(&self, invocation: &NodeInvocation) -> Result<Value, NodeExecutionError> {
        info!(
            "[DRY RUN] {} ({}) parameters: {}",
            invocation.node_id,
            invocation.block_type,
            Value::Object(invocation.parameters.clone().into_iter().collect())
        );
        Ok(json!({
            "dryRun": true,
            "type": invocation.block_type,
            "parameters": invocation.parameters,
        }))
    }
}

/// Local block catalog used by the command-line runner.
///
/// | type            | parameters       | output                 |
/// |-----------------|------------------|------------------------|
/// | `control/start` | -                | `{"started": true}`    |
/// | `delay`         | `ms`             | `{"waitedMs": ms}`     |
/// | `log`           | `message`        | `{"message": message}` |
/// | `condition`     | `value`          | `{"result": bool}`     |
/// | `set`           | any              | the parameters         |
/// | `fail`          | `message`        | error                  |
#[derive(Debug, Clone, Default)]
pub struct BuiltinExecutor;

impl BuiltinExecutor {
    /// Block types this executor understands.
    pub const BLOCK_TYPES: &'static [&'static str] =
        &["control/start", "delay", "log", "condition", "set", "fail"];

    pub fn supports(block_type: &str) -> bool {
        Self::BLOCK_TYPES.contains(&block_type)
    }
}

#[async_trait]
impl BlockExecutor for BuiltinExecutor {
    async fn execute(&self, invocation: &NodeInvocation) -> Result<Value, NodeExecutionError> {
        debug!("Executing builtin block '{}'", invocation.block_type);

        match invocation.block_type.as_str() {
            "control/start" => Ok(json!({"started": true})),
            "delay" => {
                let ms = match invocation.parameter("ms") {
                    None => 0,
                    Some(value) => value.as_u64().ok_or_else(|| {
                        NodeExecutionError::new(format!(
                            "delay '{}': 'ms' must be a non-negative integer",
                            invocation.node_id
                        ))
                    })?,
                };
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"waitedMs": ms}))
            }
            "log" => {
                let message = match invocation.parameter("message") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                info!("[{}] {}", invocation.node_id, message);
                Ok(json!({"message": message}))
            }
            "condition" => {
                let result = invocation.parameter("value").is_some_and(is_truthy);
                Ok(json!({"result": result}))
            }
            "set" => Ok(Value::Object(
                invocation.parameters.clone().into_iter().collect(),
            )),
            "fail" => {
                let message = invocation
                    .parameter("message")
                    .and_then(Value::as_str)
                    .unwrap_or("block failed on request");
                Err(NodeExecutionError::new(message))
            }
            other => Err(NodeExecutionError::new(format!(
                "unsupported block type '{}'",
                other
            ))),
        }
    }
}

/// JSON truthiness used by the `condition` block.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(block_type: &str, parameters: Value) -> NodeInvocation {
        NodeInvocation {
            run_id: "run".to_string(),
            node_id: "node".to_string(),
            block_type: block_type.to_string(),
            parameters: serde_json::from_value(parameters).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_builtin_start() {
        let out = BuiltinExecutor
            .execute(&invocation("control/start", json!({})))
            .await
            .unwrap();
        assert_eq!(out, json!({"started": true}));
    }

    #[tokio::test]
    async fn test_builtin_delay() {
        let out = BuiltinExecutor
            .execute(&invocation("delay", json!({"ms": 5})))
            .await
            .unwrap();
        assert_eq!(out["waitedMs"], 5);

        let err = BuiltinExecutor
            .execute(&invocation("delay", json!({"ms": "soon"})))
            .await
            .unwrap_err();
        assert!(err.message.contains("'ms'"));
    }

    #[tokio::test]
    async fn test_builtin_condition() {
        for (value, expected) in [
            (json!(true), true),
            (json!(0), false),
            (json!("yes"), true),
            (json!("false"), false),
            (json!([]), false),
            (json!({"k": 1}), true),
            (Value::Null, false),
        ] {
            let out = BuiltinExecutor
                .execute(&invocation("condition", json!({"value": value})))
                .await
                .unwrap();
            assert_eq!(out["result"], expected, "value {:?}", value);
        }
    }

    #[tokio::test]
    async fn test_builtin_set_and_log() {
        let out = BuiltinExecutor
            .execute(&invocation("set", json!({"a": 1, "b": "two"})))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1, "b": "two"}));

        let out = BuiltinExecutor
            .execute(&invocation("log", json!({"message": "hello"})))
            .await
            .unwrap();
        assert_eq!(out["message"], "hello");
    }

    #[tokio::test]
    async fn test_builtin_fail_and_unknown() {
        let err = BuiltinExecutor
            .execute(&invocation("fail", json!({"message": "nope"})))
            .await
            .unwrap_err();
        assert_eq!(err.message, "nope");

        let err = BuiltinExecutor
            .execute(&invocation("http-request", json!({})))
            .await
            .unwrap_err();
        assert!(err.message.contains("unsupported block type"));
        assert!(!BuiltinExecutor::supports("http-request"));
        assert!(BuiltinExecutor::supports("delay"));
    }

    #[tokio::test]
    async fn test_dry_run_echoes_parameters() {
        let out = DryRunExecutor
            .execute(&invocation("http-request", json!({"url": "http://x"})))
            .await
            .unwrap();
        assert_eq!(out["dryRun"], true);
        assert_eq!(out["parameters"]["url"], "http://x");
    }
}
