//! Execution Run State
//!
//! The externally visible record of one run: overall status, the per-node
//! status map and a progress summary. Every mutation goes through a
//! transition method that enforces the allowed state machine, so a snapshot
//! taken at any moment is internally consistent.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Overall status of a run.
///
/// ```text
/// created --start--> running
/// running --pause--> paused
/// paused  --resume--> running
/// running --(all levels done)--> completed | failed
/// running|paused --cancel--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Status of a node plus whatever its resolution produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            duration: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Count of settled nodes against the total.
///
/// `completed` counts every node that is no longer pending or running,
/// whatever its outcome, so the figure only ever grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u32,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        // Nothing to run counts as done
        let percentage = if total == 0 {
            100
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            completed,
            total,
            percentage,
        }
    }
}

/// One execution attempt of a compiled workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub node_statuses: BTreeMap<String, NodeState>,
    pub progress: Progress,
    /// Set as soon as a cancel is requested; the status follows once
    /// in-flight nodes have settled
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRun {
    /// Creates a run with every node pending.
    pub fn new<I, S>(id: impl Into<String>, workflow_id: impl Into<String>, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node_statuses: BTreeMap<String, NodeState> = node_ids
            .into_iter()
            .map(|id| (id.into(), NodeState::pending()))
            .collect();
        let total = node_statuses.len();

        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Created,
            node_statuses,
            progress: Progress::new(0, total),
            cancel_requested: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Moves the run to `next` if the state machine allows it.
    pub(crate) fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.refresh_progress();
        }
        true
    }

    /// Returns the status of one node.
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_statuses.get(node_id).map(|s| s.status)
    }

    /// Ids of nodes currently in `status`, sorted.
    pub fn nodes_with(&self, status: NodeStatus) -> Vec<&str> {
        self.node_statuses
            .iter()
            .filter(|(_, state)| state.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Number of nodes currently in `status`.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.node_statuses
            .values()
            .filter(|state| state.status == status)
            .count()
    }

    pub(crate) fn mark_running(&mut self, node_id: &str) -> bool {
        self.update(node_id, NodeStatus::Pending, |state| {
            state.status = NodeStatus::Running;
            state.started_at = Some(Utc::now());
        })
    }

    pub(crate) fn mark_completed(&mut self, node_id: &str, output: Value, elapsed: Duration) -> bool {
        self.update(node_id, NodeStatus::Running, |state| {
            state.status = NodeStatus::Completed;
            state.output = Some(output);
            state.duration = Some(elapsed.as_millis() as u64);
            state.finished_at = Some(Utc::now());
        })
    }

    pub(crate) fn mark_failed(&mut self, node_id: &str, error: String, elapsed: Duration) -> bool {
        self.update(node_id, NodeStatus::Running, |state| {
            state.status = NodeStatus::Failed;
            state.error = Some(error);
            state.duration = Some(elapsed.as_millis() as u64);
            state.finished_at = Some(Utc::now());
        })
    }

    pub(crate) fn mark_skipped(&mut self, node_id: &str, reason: Option<String>) -> bool {
        self.update(node_id, NodeStatus::Pending, |state| {
            state.status = NodeStatus::Skipped;
            state.error = reason;
            state.finished_at = Some(Utc::now());
        })
    }

    fn update(&mut self, node_id: &str, expected: NodeStatus, apply: impl FnOnce(&mut NodeState)) -> bool {
        match self.node_statuses.get_mut(node_id) {
            Some(state) if state.status == expected => {
                apply(state);
                self.refresh_progress();
                true
            }
            _ => false,
        }
    }

    fn refresh_progress(&mut self) {
        let settled = self
            .node_statuses
            .values()
            .filter(|state| state.status.is_terminal())
            .count();
        self.progress = Progress::new(settled, self.node_statuses.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run() -> ExecutionRun {
        ExecutionRun::new("run-1", "wf-1", ["a", "b", "c"])
    }

    #[test]
    fn test_new_run_all_pending() {
        let run = run();
        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.count(NodeStatus::Pending), 3);
        assert_eq!(run.progress, Progress { completed: 0, total: 3, percentage: 0 });
    }

    #[test]
    fn test_run_state_machine() {
        use RunStatus::*;

        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));

        assert!(!Created.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Created, Running, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_sets_finished_at() {
        let mut run = run();
        assert!(run.transition(RunStatus::Running));
        assert!(run.finished_at.is_none());
        assert!(run.transition(RunStatus::Cancelled));
        assert!(run.finished_at.is_some());
        assert!(!run.transition(RunStatus::Running));
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_node_transitions_are_strict() {
        let mut run = run();

        assert!(!run.mark_completed("a", json!(1), Duration::ZERO));
        assert!(run.mark_running("a"));
        assert!(!run.mark_running("a"));
        assert!(run.mark_completed("a", json!({"ok": true}), Duration::from_millis(12)));
        assert!(!run.mark_failed("a", "late".to_string(), Duration::ZERO));
        assert!(!run.mark_skipped("a", None));

        let state = &run.node_statuses["a"];
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.duration, Some(12));
        assert_eq!(state.output, Some(json!({"ok": true})));
        assert!(state.started_at.is_some() && state.finished_at.is_some());
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let mut run = run();
        assert!(!run.mark_running("zzz"));
    }

    #[test]
    fn test_progress_counts_every_terminal_status() {
        let mut run = run();
        run.mark_running("a");
        run.mark_failed("a", "boom".to_string(), Duration::from_millis(1));
        assert_eq!(run.progress.completed, 1);
        assert_eq!(run.progress.percentage, 33);

        run.mark_skipped("b", Some("upstream failed".to_string()));
        assert_eq!(run.progress.percentage, 67);

        run.mark_running("c");
        assert_eq!(run.progress.completed, 2);
        run.mark_completed("c", Value::Null, Duration::ZERO);
        assert_eq!(run.progress, Progress { completed: 3, total: 3, percentage: 100 });
    }

    #[test]
    fn test_progress_empty_plan() {
        assert_eq!(Progress::new(0, 0).percentage, 100);
        assert_eq!(Progress::new(2, 8).percentage, 25);
    }

    #[test]
    fn test_nodes_with() {
        let mut run = run();
        run.mark_running("b");
        assert_eq!(run.nodes_with(NodeStatus::Running), vec!["b"]);
        assert_eq!(run.nodes_with(NodeStatus::Pending), vec!["a", "c"]);
        assert_eq!(run.node_status("b"), Some(NodeStatus::Running));
    }

    #[test]
    fn test_status_payload_shape() {
        let mut run = run();
        run.mark_running("a");
        run.mark_failed("a", "timeout".to_string(), Duration::from_millis(30));

        let payload = serde_json::to_value(&run).unwrap();
        assert_eq!(payload["status"], "created");
        assert_eq!(payload["nodeStatuses"]["a"]["status"], "failed");
        assert_eq!(payload["nodeStatuses"]["a"]["error"], "timeout");
        assert_eq!(payload["nodeStatuses"]["a"]["duration"], 30);
        assert!(payload["nodeStatuses"]["b"].get("output").is_none());
        assert_eq!(payload["progress"]["total"], 3);
    }

    #[test]
    fn test_display() {
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(NodeStatus::Skipped.to_string(), "skipped");
    }
}
