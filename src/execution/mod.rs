//! Workflow Execution Module
//!
//! Runs compiled plans and exposes the control surface for them.
//!
//! # Architecture
//!
//! - [`engine`]: Level-by-level coordinator plus start/pause/resume/cancel
//! - [`registry`]: Retained runs and the one-active-run-per-workflow rule
//! - [`run`]: Run and node state machines, progress
//! - [`executor`]: The block execution capability and built-in executors
//! - [`error`]: Node failures and control-surface misuse

pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod run;

pub use engine::{ConfigError, Engine, EngineConfig, RunHandle};
pub use error::{EngineStateError, NodeExecutionError};
pub use executor::{BlockExecutor, BuiltinExecutor, DryRunExecutor, NodeInvocation};
pub use registry::RunRegistry;
pub use run::{ExecutionRun, NodeState, NodeStatus, Progress, RunStatus};
