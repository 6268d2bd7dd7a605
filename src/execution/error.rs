//! Error types for the execution engine.

use thiserror::Error;

use super::run::RunStatus;

/// A failure reported by a block executor for one node.
///
/// Captured on the node and never propagated out of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NodeExecutionError {
    pub message: String,
}

impl NodeExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for NodeExecutionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for NodeExecutionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Misuse of the engine's control surface, returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineStateError {
    #[error("workflow '{workflow_id}' already has an active run '{run_id}'")]
    RunAlreadyActive { workflow_id: String, run_id: String },

    #[error("run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("run '{run_id}' does not belong to workflow '{workflow_id}'")]
    WorkflowMismatch { run_id: String, workflow_id: String },

    #[error("cannot {action} run '{run_id}' while it is {status}")]
    InvalidTransition {
        run_id: String,
        status: RunStatus,
        action: &'static str,
    },

    #[error("run '{run_id}' is still {status} and cannot be discarded")]
    RunStillActive { run_id: String, status: RunStatus },

    #[error("plan for workflow '{workflow_id}' is not executable ({error_count} compile errors)")]
    InvalidPlan {
        workflow_id: String,
        error_count: usize,
    },
}
