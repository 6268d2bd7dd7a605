//! Workflow Execution Engine
//!
//! Steps a compiled plan level by level:
//! - Every eligible node in a level is dispatched concurrently, optionally
//!   capped by `max_parallel`
//! - A level must fully settle before the next one starts
//! - Failures skip the affected subgraph only; unrelated branches keep going
//! - Pause takes effect at the next level boundary, cancel stops dispatch
//!   immediately and finalizes once in-flight nodes settle
//!
//! Node tasks never touch the run record. They report back over a channel
//! and the per-run coordinator applies every transition, so observers see
//! one writer and a strict commit order.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::{EngineStateError, NodeExecutionError};
use super::executor::{BlockExecutor, NodeInvocation};
use super::registry::{RunCell, RunRegistry};
use super::run::{ExecutionRun, NodeStatus, RunStatus};
use crate::status::{StatusEvent, StatusObserver};
use crate::workflow::{resolve_parameters, CompiledPlan};

/// Engine settings, loadable from a YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum nodes in flight within one level; 0 means the level's width
    pub max_parallel: usize,
}

/// Errors that can occur when loading an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineConfig {
    /// Loads settings from a YAML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Workflow execution engine.
///
/// Owns a [`RunRegistry`] and the observers attached to every run it starts.
/// Cloning is cheap and clones drive the same registry, which is how a
/// signal handler or server task gets hold of the control surface.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use blockrunner::execution::{BuiltinExecutor, Engine};
/// use blockrunner::workflow::{compile, load_workflow};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = load_workflow("workflow.yaml")?;
/// let compilation = compile(&workflow.nodes, &workflow.edges);
///
/// let mut engine = Engine::new();
/// engine.set_max_parallel(4);
///
/// let handle = engine.start(&workflow.id, compilation.plan, Arc::new(BuiltinExecutor))?;
/// let run = handle.wait().await;
/// println!("{} finished {}", run.id, run.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Engine {
    registry: RunRegistry,
    max_parallel: usize,
    observers: Vec<Arc<dyn StatusObserver>>,
}

impl Engine {
    /// Creates an engine with an empty registry and no parallelism cap.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            max_parallel: config.max_parallel,
            ..Self::default()
        }
    }

    /// Sets the maximum number of nodes in flight per level (0 = unbounded).
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max;
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Attaches an observer to every run started afterwards.
    pub fn add_observer(&mut self, observer: Arc<dyn StatusObserver>) {
        self.observers.push(observer);
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Starts a new run of `plan` for a workflow.
    ///
    /// Must be called from within a Tokio runtime. The run is registered and
    /// moved to `running` before this returns; the levels are stepped by a
    /// spawned coordinator task.
    pub fn start(
        &self,
        workflow_id: &str,
        plan: CompiledPlan,
        executor: Arc<dyn BlockExecutor>,
    ) -> Result<RunHandle, EngineStateError> {
        if !plan.is_valid() {
            return Err(EngineStateError::InvalidPlan {
                workflow_id: workflow_id.to_string(),
                error_count: plan.error_count(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let run = ExecutionRun::new(run_id.clone(), workflow_id, plan.node_ids().cloned());
        let cell = Arc::new(RunCell::new(run, self.observers.clone()));
        self.registry.reserve(workflow_id, Arc::clone(&cell))?;

        {
            let mut run = cell.lock();
            run.transition(RunStatus::Running);
            cell.publish_run(&run);
        }

        info!(
            "Starting run {} for workflow '{}' ({} nodes, {} levels, max parallel: {})",
            run_id,
            workflow_id,
            plan.node_count(),
            plan.total_levels(),
            if self.max_parallel == 0 {
                "unbounded".to_string()
            } else {
                self.max_parallel.to_string()
            }
        );

        let snapshots = cell.subscribe();
        let coordinator = Coordinator {
            run_id: run_id.clone(),
            cell,
            plan,
            executor,
            max_parallel: self.max_parallel,
            outputs: HashMap::new(),
        };
        let task = tokio::spawn(coordinator.drive());

        Ok(RunHandle {
            run_id,
            workflow_id: workflow_id.to_string(),
            snapshots,
            task,
        })
    }

    /// Pauses a running run at its next level boundary.
    ///
    /// Only later levels are held back. Under a `max_parallel` cap, nodes of
    /// the current level still waiting for a slot keep being dispatched until
    /// that level settles. Pausing an already paused run is a no-op, as is
    /// pausing a run whose cancellation is pending.
    pub fn pause(&self, workflow_id: &str, run_id: &str) -> Result<RunStatus, EngineStateError> {
        let cell = self.cell_for(workflow_id, run_id)?;
        let mut run = cell.lock();
        let current = run.status;

        match current {
            RunStatus::Paused => Ok(RunStatus::Paused),
            RunStatus::Running if run.cancel_requested => Ok(RunStatus::Running),
            RunStatus::Running => {
                run.transition(RunStatus::Paused);
                info!("Run {} paused", run_id);
                cell.publish_run(&run);
                Ok(RunStatus::Paused)
            }
            status => Err(EngineStateError::InvalidTransition {
                run_id: run_id.to_string(),
                status,
                action: "pause",
            }),
        }
    }

    /// Resumes a paused run. Resuming a running run is a no-op.
    pub fn resume(&self, workflow_id: &str, run_id: &str) -> Result<RunStatus, EngineStateError> {
        let cell = self.cell_for(workflow_id, run_id)?;
        let mut run = cell.lock();
        let current = run.status;

        match current {
            RunStatus::Running => Ok(RunStatus::Running),
            RunStatus::Paused => {
                run.transition(RunStatus::Running);
                info!("Run {} resumed", run_id);
                cell.publish_run(&run);
                drop(run);
                cell.wake.notify_one();
                Ok(RunStatus::Running)
            }
            status => Err(EngineStateError::InvalidTransition {
                run_id: run_id.to_string(),
                status,
                action: "resume",
            }),
        }
    }

    /// Requests cancellation.
    ///
    /// No new node is dispatched after this returns. Nodes already in flight
    /// are left to settle, then every pending node is skipped and the run
    /// becomes `cancelled`. Cancelling a terminal run, or one already being
    /// cancelled, is a no-op. Returns the status at the time of the call.
    pub fn cancel(&self, workflow_id: &str, run_id: &str) -> Result<RunStatus, EngineStateError> {
        let cell = self.cell_for(workflow_id, run_id)?;
        let mut run = cell.lock();

        if run.status.is_terminal() || run.cancel_requested {
            return Ok(run.status);
        }

        run.cancel_requested = true;
        info!("Cancel requested for run {}", run_id);
        cell.publish(
            &run,
            StatusEvent::CancelRequested {
                run_id: run_id.to_string(),
            },
        );
        let status = run.status;
        drop(run);
        cell.wake.notify_one();
        Ok(status)
    }

    /// Current snapshot of a run.
    ///
    /// After a successful [`cancel`](Self::cancel) the status stays `running`
    /// with `cancel_requested` set until in-flight nodes settle, then becomes
    /// `cancelled`. Check the flag to tell a cancelling run from a live one.
    pub fn status(&self, run_id: &str) -> Result<ExecutionRun, EngineStateError> {
        self.registry
            .get(run_id)
            .ok_or_else(|| EngineStateError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Most recent run of a workflow, if one is retained.
    pub fn latest_run(&self, workflow_id: &str) -> Option<ExecutionRun> {
        self.registry.latest(workflow_id)
    }

    /// Drops a terminal run from the registry.
    pub fn discard(&self, run_id: &str) -> Result<ExecutionRun, EngineStateError> {
        self.registry.discard(run_id)
    }

    fn cell_for(&self, workflow_id: &str, run_id: &str) -> Result<Arc<RunCell>, EngineStateError> {
        let cell = self.registry.cell(run_id)?;
        let belongs = cell.lock().workflow_id == workflow_id;
        if !belongs {
            return Err(EngineStateError::WorkflowMismatch {
                run_id: run_id.to_string(),
                workflow_id: workflow_id.to_string(),
            });
        }
        Ok(cell)
    }
}

/// Caller's view of a started run.
pub struct RunHandle {
    run_id: String,
    workflow_id: String,
    snapshots: watch::Receiver<ExecutionRun>,
    task: JoinHandle<()>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Receiver holding the latest committed snapshot of the run.
    pub fn subscribe(&self) -> watch::Receiver<ExecutionRun> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> ExecutionRun {
        self.snapshots.borrow().clone()
    }

    /// Waits for the coordinator to finish and returns the final snapshot.
    pub async fn wait(self) -> ExecutionRun {
        if let Err(e) = self.task.await {
            error!("Coordinator for run {} stopped abnormally: {}", self.run_id, e);
        }
        let run = self.snapshots.borrow().clone();
        run
    }
}

/// Result reported by a node task.
struct NodeOutcome {
    node_id: String,
    result: Result<Value, NodeExecutionError>,
    elapsed: Duration,
}

enum Dispatch {
    Spawned,
    /// The node reached a terminal status without being handed to the executor
    Settled,
    Cancelled,
}

/// Sole writer of one run's node map.
struct Coordinator {
    run_id: String,
    cell: Arc<RunCell>,
    plan: CompiledPlan,
    executor: Arc<dyn BlockExecutor>,
    max_parallel: usize,
    /// Outputs of completed nodes, for parameter references
    outputs: HashMap<String, Value>,
}

impl Coordinator {
    async fn drive(mut self) {
        let levels = self.plan.levels().to_vec();
        let total = levels.len();

        for (index, level) in levels.iter().enumerate() {
            if !self.level_boundary().await {
                break;
            }
            debug!(
                "Run {}: level {}/{} ({} nodes)",
                self.run_id,
                index + 1,
                total,
                level.len()
            );
            self.run_level(level).await;
            self.skip_failed_subgraphs(level);
        }

        self.finish().await;
    }

    /// Waits out a pause. Returns false once cancellation has been requested.
    async fn level_boundary(&self) -> bool {
        loop {
            let resumed = self.cell.wake.notified();
            {
                let run = self.cell.lock();
                if run.cancel_requested {
                    return false;
                }
                if run.status != RunStatus::Paused {
                    return true;
                }
            }
            debug!("Run {} parked at level boundary", self.run_id);
            resumed.await;
        }
    }

    async fn run_level(&mut self, level: &[String]) {
        let limit = if self.max_parallel == 0 {
            usize::MAX
        } else {
            self.max_parallel
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeOutcome>();
        let mut queue: VecDeque<&String> = level.iter().collect();
        let mut running_count = 0;

        loop {
            while running_count < limit {
                let node_id = match queue.pop_front() {
                    Some(node_id) => node_id,
                    None => break,
                };
                match self.dispatch(node_id, &tx) {
                    Dispatch::Spawned => running_count += 1,
                    Dispatch::Settled => {}
                    Dispatch::Cancelled => {
                        queue.clear();
                        break;
                    }
                }
            }

            if running_count == 0 {
                break;
            }

            match rx.recv().await {
                Some(outcome) => {
                    running_count -= 1;
                    self.record(outcome);
                }
                None => break,
            }
        }
    }

    fn dispatch(&self, node_id: &str, tx: &mpsc::UnboundedSender<NodeOutcome>) -> Dispatch {
        let node = match self.plan.node(node_id) {
            Some(node) => node,
            None => return Dispatch::Settled,
        };

        let mut run = self.cell.lock();
        if run.cancel_requested {
            return Dispatch::Cancelled;
        }
        if run.node_status(node_id) != Some(NodeStatus::Pending) {
            return Dispatch::Settled;
        }

        let blocker = self
            .plan
            .predecessors(node_id)
            .iter()
            .find(|p| run.node_status(p) != Some(NodeStatus::Completed));
        if let Some(blocker) = blocker {
            let reason = format!("upstream node '{}' did not complete", blocker);
            run.mark_skipped(node_id, Some(reason));
            self.cell.publish_node(&run, node_id);
            return Dispatch::Settled;
        }

        run.mark_running(node_id);
        self.cell.publish_node(&run, node_id);

        let parameters = match resolve_parameters(&node.parameters, &self.outputs) {
            Ok(parameters) => parameters,
            Err(e) => {
                warn!("Node '{}' parameters could not be resolved: {}", node_id, e);
                run.mark_failed(node_id, e.to_string(), Duration::ZERO);
                self.cell.publish_node(&run, node_id);
                return Dispatch::Settled;
            }
        };
        drop(run);

        let invocation = NodeInvocation {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            block_type: node.block_type.clone(),
            parameters,
        };
        let executor = Arc::clone(&self.executor);
        let tx = tx.clone();

        debug!("Dispatching node '{}' ({})", node_id, node.block_type);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = match AssertUnwindSafe(executor.execute(&invocation))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(NodeExecutionError::new(format!(
                    "block executor panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            let outcome = NodeOutcome {
                node_id: invocation.node_id.clone(),
                result,
                elapsed: started.elapsed(),
            };
            if tx.send(outcome).is_err() {
                error!(
                    "Failed to report completion of node '{}'",
                    invocation.node_id
                );
            }
        });

        Dispatch::Spawned
    }

    fn record(&mut self, outcome: NodeOutcome) {
        let mut run = self.cell.lock();
        match outcome.result {
            Ok(output) => {
                debug!(
                    "Node '{}' completed in {} ms",
                    outcome.node_id,
                    outcome.elapsed.as_millis()
                );
                self.outputs.insert(outcome.node_id.clone(), output.clone());
                run.mark_completed(&outcome.node_id, output, outcome.elapsed);
            }
            Err(e) => {
                error!("Node '{}' failed: {}", outcome.node_id, e);
                run.mark_failed(&outcome.node_id, e.message, outcome.elapsed);
            }
        }
        self.cell.publish_node(&run, &outcome.node_id);
    }

    /// Skips every pending descendant of a node that failed in `level`.
    fn skip_failed_subgraphs(&self, level: &[String]) {
        let mut run = self.cell.lock();
        let failed: Vec<&String> = level
            .iter()
            .filter(|id| run.node_status(id) == Some(NodeStatus::Failed))
            .collect();
        if failed.is_empty() {
            return;
        }

        // descendant -> failed ancestor that doomed it
        let mut doomed: HashMap<&str, &str> = HashMap::new();
        let mut stack: Vec<(&str, &str)> = Vec::new();
        for root in failed {
            for successor in self.plan.successors(root) {
                stack.push((successor.as_str(), root.as_str()));
            }
        }
        while let Some((node_id, root)) = stack.pop() {
            if doomed.contains_key(node_id) {
                continue;
            }
            doomed.insert(node_id, root);
            for successor in self.plan.successors(node_id) {
                stack.push((successor.as_str(), root));
            }
        }

        for node_id in self.plan.node_ids() {
            if let Some(root) = doomed.get(node_id.as_str()) {
                let reason = format!("upstream node '{}' failed", root);
                if run.mark_skipped(node_id, Some(reason)) {
                    self.cell.publish_node(&run, node_id);
                }
            }
        }
    }

    /// Moves the run to its terminal status once every node has settled.
    async fn finish(&self) {
        loop {
            let resumed = self.cell.wake.notified();
            {
                let mut run = self.cell.lock();

                if run.cancel_requested {
                    let pending: Vec<String> = run
                        .nodes_with(NodeStatus::Pending)
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    for node_id in &pending {
                        run.mark_skipped(node_id, Some("run cancelled".to_string()));
                        self.cell.publish_node(&run, node_id);
                    }
                    run.transition(RunStatus::Cancelled);
                    self.cell.publish_run(&run);
                    info!(
                        "Run {} cancelled ({} nodes never started)",
                        self.run_id,
                        pending.len()
                    );
                    return;
                }

                if run.status != RunStatus::Paused {
                    let outcome = if run.count(NodeStatus::Skipped) > 0 {
                        RunStatus::Failed
                    } else {
                        RunStatus::Completed
                    };
                    run.transition(outcome);
                    self.cell.publish_run(&run);
                    info!(
                        "Run {} {}: {} completed, {} failed, {} skipped",
                        self.run_id,
                        outcome,
                        run.count(NodeStatus::Completed),
                        run.count(NodeStatus::Failed),
                        run.count(NodeStatus::Skipped)
                    );
                    return;
                }
            }
            resumed.await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
