//! Workflow Definition Module
//!
//! Provides the block graph data model, file loading, and the compiler that
//! turns a node/edge snapshot into an ordered execution plan.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Node, Edge, Workflow)
//! - [`parser`]: YAML/JSON loading
//! - [`compiler`]: Validation and level-wise topological ordering
//! - [`references`]: `{{node.path}}` parameter resolution

pub mod compiler;
pub mod model;
pub mod parser;
pub mod references;

pub use compiler::{
    compile, Compilation, CompileError, CompileErrorKind, CompiledPlan, ReportEntry,
    ValidationReport,
};
pub use model::{Edge, Node, Position, Workflow};
pub use parser::{load_workflow, parse_workflow, ParseError};
pub use references::{resolve_parameters, ReferenceError};
