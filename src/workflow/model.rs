//! Workflow Data Model
//!
//! Core data structures representing blocks (nodes) and the edges that
//! connect them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: wf-healthcheck
//! name: Nightly health check
//! nodes:
//!   - id: start
//!     type: control/start
//!   - id: ping
//!     type: http-request
//!     parameters:
//!       url: https://10.0.0.5/health
//!     position: { x: 240, y: 80 }
//!   - id: report
//!     type: log
//!     parameters:
//!       message: "ping said {{ping.status}}"
//! edges:
//!   - id: e1
//!     source: start
//!     sourceHandle: out
//!     target: ping
//!     targetHandle: in
//!   - id: e2
//!     source: ping
//!     target: report
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default port name used when an edge does not name one.
pub const DEFAULT_PORT: &str = "default";

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

/// Canvas position of a node. Presentation only; the engine never reads it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single block in a workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier, stable for the lifetime of the workflow
    pub id: String,

    /// Block-type tag from the external catalog (e.g. `control/start`, `delay`)
    #[serde(rename = "type")]
    pub block_type: String,

    /// Block parameters; string values may reference other nodes' outputs
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    /// Layout position on the canvas
    #[serde(default)]
    pub position: Position,
}

impl Node {
    /// Creates a node with no parameters at the origin.
    ///
    /// # Example
    ///
    /// ```
    /// use blockrunner::workflow::Node;
    ///
    /// let node = Node::new("wait", "delay").with_parameter("ms", 250);
    /// assert_eq!(node.parameters["ms"], 250);
    /// ```
    pub fn new(id: impl Into<String>, block_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            parameters: BTreeMap::new(),
            position: Position::default(),
        }
    }

    /// Sets a single parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Sets the canvas position.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }
}

/// A directed connection from one node's output port to another's input port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    #[serde(default = "default_port")]
    pub source_handle: String,
    pub target: String,
    #[serde(default = "default_port")]
    pub target_handle: String,
}

impl Edge {
    /// Creates an edge between the default ports of two nodes.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: default_port(),
            target: target.into(),
            target_handle: default_port(),
        }
    }

    /// Sets the named output and input ports.
    pub fn with_ports(mut self, source_handle: impl Into<String>, target_handle: impl Into<String>) -> Self {
        self.source_handle = source_handle.into();
        self.target_handle = target_handle.into();
        self
    }
}

/// A complete workflow definition as stored by the CRUD layer.
///
/// The engine only ever sees an immutable snapshot of `nodes` and `edges`;
/// `variables` are carried through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a node to the workflow, rejecting duplicate ids.
    pub fn add_node(&mut self, node: Node) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Connects two nodes with a generated edge id.
    pub fn connect(&mut self, source: &str, target: &str) -> &Edge {
        let id = format!("{}->{}", source, target);
        self.edges.push(Edge::new(id, source, target));
        &self.edges[self.edges.len() - 1]
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<(), String> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| format!("Node '{}' not found", id))?;

        self.nodes.remove(index);
        self.edges.retain(|e| e.source != id && e.target != id);
        Ok(())
    }

    /// Gets a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Gets a mutable reference to a node by ID.
    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Returns nodes that no edge points into.
    pub fn root_nodes(&self) -> Vec<&Node> {
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        self.nodes
            .iter()
            .filter(|n| !targets.contains(n.id.as_str()))
            .collect()
    }

    /// Returns the number of nodes in the workflow.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the workflow has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
