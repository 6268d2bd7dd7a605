//! Run Registry
//!
//! Tracks every retained run and enforces the one-active-run-per-workflow
//! rule. A registry is an ordinary value: the engine owns one, tests build a
//! fresh one each time, and clones share the same underlying table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::sync::{watch, Notify};

use super::error::EngineStateError;
use super::run::ExecutionRun;
use crate::status::{StatusChannel, StatusEvent, StatusObserver};

/// Shared state of one run: the authoritative record, its status channel and
/// the wake-up used to resume a parked coordinator.
pub(crate) struct RunCell {
    run: Mutex<ExecutionRun>,
    channel: StatusChannel,
    pub(crate) wake: Notify,
}

impl RunCell {
    pub(crate) fn new(run: ExecutionRun, observers: Vec<Arc<dyn StatusObserver>>) -> Self {
        Self {
            channel: StatusChannel::new(run.clone(), observers),
            run: Mutex::new(run),
            wake: Notify::new(),
        }
    }

    /// Locks the run record. The guard must never be held across an await.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ExecutionRun> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> ExecutionRun {
        self.lock().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ExecutionRun> {
        self.channel.subscribe()
    }

    pub(crate) fn publish(&self, run: &ExecutionRun, event: StatusEvent) {
        self.channel.publish(run, event);
    }

    pub(crate) fn publish_run(&self, run: &ExecutionRun) {
        self.channel.publish(run, StatusEvent::run_changed(run));
    }

    pub(crate) fn publish_node(&self, run: &ExecutionRun, node_id: &str) {
        if let Some(event) = StatusEvent::node_changed(run, node_id) {
            self.channel.publish(run, event);
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// workflow id -> id of its most recent run
    latest: HashMap<String, String>,
    runs: HashMap<String, Arc<RunCell>>,
}

/// Table of runs keyed by run id, with the latest run per workflow.
#[derive(Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new run for a workflow.
    ///
    /// Fails if the workflow's latest run is not terminal. A terminal latest
    /// run is superseded and dropped from the table.
    pub(crate) fn reserve(&self, workflow_id: &str, cell: Arc<RunCell>) -> Result<(), EngineStateError> {
        let mut inner = self.lock();
        let run_id = cell.lock().id.clone();

        if let Some(previous_id) = inner.latest.get(workflow_id).cloned() {
            if let Some(previous) = inner.runs.get(&previous_id) {
                if !previous.lock().status.is_terminal() {
                    return Err(EngineStateError::RunAlreadyActive {
                        workflow_id: workflow_id.to_string(),
                        run_id: previous_id,
                    });
                }
            }
            inner.runs.remove(&previous_id);
            info!("Run {} superseded by {}", previous_id, run_id);
        }

        inner.latest.insert(workflow_id.to_string(), run_id.clone());
        inner.runs.insert(run_id, cell);
        Ok(())
    }

    pub(crate) fn cell(&self, run_id: &str) -> Result<Arc<RunCell>, EngineStateError> {
        self.lock()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineStateError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Snapshot of a run by id.
    pub fn get(&self, run_id: &str) -> Option<ExecutionRun> {
        self.lock().runs.get(run_id).map(|cell| cell.snapshot())
    }

    /// Snapshot of the most recent run for a workflow.
    pub fn latest(&self, workflow_id: &str) -> Option<ExecutionRun> {
        let inner = self.lock();
        let run_id = inner.latest.get(workflow_id)?;
        inner.runs.get(run_id).map(|cell| cell.snapshot())
    }

    /// Removes a terminal run and returns its final snapshot.
    pub fn discard(&self, run_id: &str) -> Result<ExecutionRun, EngineStateError> {
        let mut inner = self.lock();
        let snapshot = inner
            .runs
            .get(run_id)
            .map(|cell| cell.snapshot())
            .ok_or_else(|| EngineStateError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        if !snapshot.status.is_terminal() {
            return Err(EngineStateError::RunStillActive {
                run_id: run_id.to_string(),
                status: snapshot.status,
            });
        }

        inner.runs.remove(run_id);
        if inner.latest.get(&snapshot.workflow_id).map(String::as_str) == Some(run_id) {
            inner.latest.remove(&snapshot.workflow_id);
        }
        debug!("Discarded run {}", run_id);
        Ok(snapshot)
    }

    /// Number of retained runs.
    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
