//! BlockRunner - Block Workflow Execution Engine
//!
//! Compiles a graph of blocks (nodes joined by directed edges) into an
//! ordered, level-by-level execution plan and runs it, streaming run and
//! node status to observers as it goes.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Graph model, file loading and the plan compiler
//! - [`execution`]: Run state machine, executors and the execution engine
//! - [`status`]: Status events, observers and snapshot subscription
//! - [`monitoring`]: Execution timeline built from the event stream
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockrunner::execution::{BuiltinExecutor, Engine};
//! use blockrunner::{compile, load_workflow};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow snapshot from YAML
//!     let workflow = load_workflow("nightly.yaml")?;
//!
//!     // Compile it into levels
//!     let compilation = compile(&workflow.nodes, &workflow.edges);
//!     if !compilation.is_valid() {
//!         println!("{}", serde_json::to_string_pretty(&compilation.report())?);
//!         return Ok(());
//!     }
//!
//!     // Execute the plan
//!     let engine = Engine::new();
//!     let handle = engine.start(&workflow.id, compilation.plan, Arc::new(BuiltinExecutor))?;
//!     let run = handle.wait().await;
//!     println!("run {} is {}", run.id, run.status);
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod monitoring;
pub mod status;
pub mod workflow;

// Re-export commonly used types
pub use execution::engine::Engine;
pub use execution::run::{ExecutionRun, NodeStatus, RunStatus};
pub use workflow::compiler::compile;
pub use workflow::model::{Edge, Node, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "BlockRunner";
