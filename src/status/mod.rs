//! Status Channel
//!
//! Delivers run and node transitions to observers without coupling the engine
//! to any transport. Two delivery styles are offered:
//!
//! - Poll: [`StatusChannel::subscribe`] hands out a `watch` receiver that
//!   always holds the latest committed [`ExecutionRun`] snapshot. Intermediate
//!   snapshots may be coalesced.
//! - Push: every registered [`StatusObserver`] receives each [`StatusEvent`]
//!   in commit order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::execution::run::{ExecutionRun, NodeState, NodeStatus, Progress, RunStatus};

/// A single committed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum StatusEvent {
    #[serde(rename = "runStatusChanged")]
    RunStatusChanged {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "workflowId")]
        workflow_id: String,
        status: RunStatus,
        progress: Progress,
    },

    #[serde(rename = "nodeStatusChanged")]
    NodeStatusChanged {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        state: NodeState,
        progress: Progress,
    },

    #[serde(rename = "cancelRequested")]
    CancelRequested {
        #[serde(rename = "runId")]
        run_id: String,
    },
}

impl StatusEvent {
    pub(crate) fn run_changed(run: &ExecutionRun) -> Self {
        Self::RunStatusChanged {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            status: run.status,
            progress: run.progress,
        }
    }

    pub(crate) fn node_changed(run: &ExecutionRun, node_id: &str) -> Option<Self> {
        let state = run.node_statuses.get(node_id)?;
        Some(Self::NodeStatusChanged {
            run_id: run.id.clone(),
            node_id: node_id.to_string(),
            state: state.clone(),
            progress: run.progress,
        })
    }

    /// Id of the run the event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStatusChanged { run_id, .. }
            | Self::NodeStatusChanged { run_id, .. }
            | Self::CancelRequested { run_id } => run_id,
        }
    }
}

/// Receives status events as they are committed.
///
/// `notify` is called while the engine holds the run's state lock, which is
/// what keeps delivery in commit order. Implementations must return quickly
/// and must not call back into the engine. A panic inside `notify` is logged
/// and dropped; the run carries on.
pub trait StatusObserver: Send + Sync {
    fn notify(&self, event: &StatusEvent);
}

/// Forwards events into an unbounded channel for async consumers
/// (websocket push, persistence, tests).
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { sender }
    }

    /// Creates an observer together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl StatusObserver for ChannelObserver {
    fn notify(&self, event: &StatusEvent) {
        // Receiver may have been dropped
        let _ = self.sender.send(event.clone());
    }
}

/// Writes each event to the log.
#[derive(Debug, Clone, Default)]
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn notify(&self, event: &StatusEvent) {
        match event {
            StatusEvent::RunStatusChanged {
                run_id,
                status,
                progress,
                ..
            } => info!(
                "Run {} is {} ({}/{} nodes, {}%)",
                run_id, status, progress.completed, progress.total, progress.percentage
            ),
            StatusEvent::NodeStatusChanged {
                node_id,
                state,
                progress,
                ..
            } => match (state.status, &state.error) {
                (NodeStatus::Failed, Some(error)) => {
                    warn!("Node '{}' failed: {} [{}%]", node_id, error, progress.percentage)
                }
                (NodeStatus::Skipped, Some(reason)) => {
                    info!("Node '{}' skipped: {} [{}%]", node_id, reason, progress.percentage)
                }
                (status, _) => info!("Node '{}' {} [{}%]", node_id, status, progress.percentage),
            },
            StatusEvent::CancelRequested { run_id } => {
                info!("Cancel requested for run {}", run_id)
            }
        }
    }
}

/// Publishes snapshots and events for a single run.
pub struct StatusChannel {
    snapshot: watch::Sender<ExecutionRun>,
    observers: Vec<Arc<dyn StatusObserver>>,
}

impl StatusChannel {
    pub fn new(initial: ExecutionRun, observers: Vec<Arc<dyn StatusObserver>>) -> Self {
        let (snapshot, _) = watch::channel(initial);
        Self {
            snapshot,
            observers,
        }
    }

    /// Returns a receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ExecutionRun> {
        self.snapshot.subscribe()
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> ExecutionRun {
        self.snapshot.borrow().clone()
    }

    /// Commits a snapshot and pushes the event that produced it.
    pub fn publish(&self, run: &ExecutionRun, event: StatusEvent) {
        self.snapshot.send_replace(run.clone());
        for observer in &self.observers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| observer.notify(&event)));
            if delivered.is_err() {
                error!("Status observer panicked on event for run {}", event.run_id());
            }
        }
    }
}
