//! Workflow Compiler
//!
//! Validates a node/edge snapshot and orders it into execution levels:
//! - Duplicate id and dangling edge detection
//! - Level-wise topological layering (Kahn's algorithm)
//! - Cycle reporting for every node that could not be placed
//! - Advisory warnings for disconnected nodes and non-upstream references
//!
//! Compilation never fails outright. Every structural problem is collected
//! into the returned [`Compilation`], sorted so that identical input always
//! produces an identical report.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use super::model::{Edge, Node};
use super::references::referenced_nodes;

/// Category of a structural problem found during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CompileErrorKind {
    /// An edge endpoint names a node that is not in the snapshot
    DanglingEdge,
    /// Two or more nodes share an id
    DuplicateNodeId,
    /// The node could not be placed in any level
    Cycle,
    /// The node has no edges at all (advisory only)
    OrphanIsland,
    /// A parameter references a node that is not upstream (advisory only)
    DetachedReference,
}

impl CompileErrorKind {
    /// Returns true for kinds that make a plan unexecutable.
    pub fn is_blocking(self) -> bool {
        !matches!(self, Self::OrphanIsland | Self::DetachedReference)
    }
}

/// A structural problem reported by [`compile`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub node_id: Option<String>,
    pub edge_id: Option<String>,
    pub message: String,
}

impl CompileError {
    fn dangling_edge(edge: &Edge, missing: &str) -> Self {
        Self {
            kind: CompileErrorKind::DanglingEdge,
            node_id: Some(missing.to_string()),
            edge_id: Some(edge.id.clone()),
            message: format!(
                "Edge '{}' references unknown node '{}'",
                edge.id, missing
            ),
        }
    }

    fn duplicate_node(id: &str, occurrences: usize) -> Self {
        Self {
            kind: CompileErrorKind::DuplicateNodeId,
            node_id: Some(id.to_string()),
            edge_id: None,
            message: format!("Node id '{}' is used by {} nodes", id, occurrences),
        }
    }

    fn cycle(id: &str) -> Self {
        Self {
            kind: CompileErrorKind::Cycle,
            node_id: Some(id.to_string()),
            edge_id: None,
            message: format!("Node '{}' participates in a dependency cycle", id),
        }
    }

    fn orphan(id: &str) -> Self {
        Self {
            kind: CompileErrorKind::OrphanIsland,
            node_id: Some(id.to_string()),
            edge_id: None,
            message: format!("Node '{}' is not connected to any other node", id),
        }
    }

    fn detached_reference(id: &str, referenced: &str) -> Self {
        Self {
            kind: CompileErrorKind::DetachedReference,
            node_id: Some(id.to_string()),
            edge_id: None,
            message: format!(
                "Node '{}' references output of '{}', which is not upstream of it",
                id, referenced
            ),
        }
    }

    fn sort_key(&self) -> (Option<&str>, Option<&str>, CompileErrorKind) {
        (self.node_id.as_deref(), self.edge_id.as_deref(), self.kind)
    }
}

/// An ordered sequence of levels ready for execution.
///
/// Every placed node appears in exactly one level, and every node's level is
/// strictly greater than the level of each of its predecessors.
#[derive(Debug, Clone, Default)]
pub struct CompiledPlan {
    levels: Vec<Vec<String>>,
    level_index: HashMap<String, usize>,
    nodes: BTreeMap<String, Node>,
    predecessors: BTreeMap<String, Vec<String>>,
    successors: BTreeMap<String, Vec<String>>,
    error_count: usize,
}

impl CompiledPlan {
    /// Levels in execution order; each level lists node ids in insertion order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Number of levels in the plan.
    pub fn total_levels(&self) -> usize {
        self.levels.len()
    }

    /// Level index of a node, if it was placed.
    pub fn level_of(&self, node_id: &str) -> Option<usize> {
        self.level_index.get(node_id).copied()
    }

    /// Returns the node snapshot for an id.
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Distinct direct predecessors of a node, sorted by id.
    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.predecessors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct direct successors of a node, sorted by id.
    pub fn successors(&self, node_id: &str) -> &[String] {
        self.successors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterates placed node ids in level order.
    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.levels.iter().flatten()
    }

    /// Number of nodes placed in the plan.
    pub fn node_count(&self) -> usize {
        self.level_index.len()
    }

    /// True when compilation found no blocking errors.
    pub fn is_valid(&self) -> bool {
        self.error_count == 0
    }

    /// Number of blocking errors found while compiling.
    pub fn error_count(&self) -> usize {
        self.error_count
    }
}

/// One entry of a [`ValidationReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

impl From<&CompileError> for ReportEntry {
    fn from(error: &CompileError) -> Self {
        Self {
            node_id: error.node_id.clone(),
            edge_id: error.edge_id.clone(),
            message: error.message.clone(),
        }
    }
}

/// Serializable validation summary handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub total_levels: usize,
    pub errors: Vec<ReportEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ReportEntry>,
}

/// Result of compiling a workflow snapshot.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub plan: CompiledPlan,
    /// Blocking errors, sorted by node id then edge id
    pub errors: Vec<CompileError>,
    /// Advisory findings that do not affect validity
    pub warnings: Vec<CompileError>,
}

impl Compilation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn total_levels(&self) -> usize {
        self.plan.total_levels()
    }

    /// Builds the caller-facing summary.
    pub fn report(&self) -> ValidationReport {
        ValidationReport {
            valid: self.is_valid(),
            total_levels: self.total_levels(),
            errors: self.errors.iter().map(ReportEntry::from).collect(),
            warnings: self.warnings.iter().map(ReportEntry::from).collect(),
        }
    }
}

/// Compiles a node/edge snapshot into a leveled execution plan.
///
/// This is a pure function: the same input, in any order, yields the same
/// level partition and the same sorted error list. Within a level, nodes keep
/// the order in which they first appear in `nodes`.
///
/// # Example
///
/// ```
/// use blockrunner::workflow::{compile, Edge, Node};
///
/// let nodes = vec![Node::new("a", "control/start"), Node::new("b", "log")];
/// let edges = vec![Edge::new("e1", "a", "b")];
///
/// let compilation = compile(&nodes, &edges);
/// assert!(compilation.is_valid());
/// assert_eq!(compilation.plan.levels(), &[vec!["a".to_string()], vec!["b".to_string()]]);
/// ```
pub fn compile(nodes: &[Node], edges: &[Edge]) -> Compilation {
    info!("Compiling workflow: {} nodes, {} edges", nodes.len(), edges.len());

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Keep the first occurrence of each id; later ones are reported
    let mut order: HashMap<&str, usize> = HashMap::new();
    let mut unique: Vec<&Node> = Vec::new();
    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for node in nodes {
        *occurrences.entry(node.id.as_str()).or_insert(0) += 1;
        if !order.contains_key(node.id.as_str()) {
            order.insert(node.id.as_str(), unique.len());
            unique.push(node);
        }
    }
    for (id, count) in occurrences.iter().filter(|(_, count)| **count > 1) {
        errors.push(CompileError::duplicate_node(id, *count));
    }

    let mut in_degree: HashMap<&str, usize> = unique.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut connected: HashSet<&str> = HashSet::new();

    for edge in edges {
        let mut dangling = false;
        for endpoint in [&edge.source, &edge.target] {
            if !order.contains_key(endpoint.as_str()) {
                errors.push(CompileError::dangling_edge(edge, endpoint));
                dangling = true;
            }
        }
        if dangling {
            continue;
        }

        outgoing
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
            *degree += 1;
        }
        connected.insert(edge.source.as_str());
        connected.insert(edge.target.as_str());
    }

    // Layered Kahn: every zero in-degree node of a round forms one level
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<&str> = unique
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();

    while !current.is_empty() {
        let mut next: Vec<&str> = Vec::new();
        for id in &current {
            for successor in outgoing.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(degree) = in_degree.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*successor);
                    }
                }
            }
        }
        next.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));

        debug!("Level {}: {:?}", levels.len(), current);
        levels.push(current.iter().map(|id| id.to_string()).collect());
        current = next;
    }

    let mut level_index: HashMap<String, usize> = HashMap::new();
    for (index, level) in levels.iter().enumerate() {
        for id in level {
            level_index.insert(id.clone(), index);
        }
    }

    for node in &unique {
        if !level_index.contains_key(&node.id) {
            errors.push(CompileError::cycle(&node.id));
        }
    }

    if unique.len() > 1 {
        for node in &unique {
            if !connected.contains(node.id.as_str()) {
                warnings.push(CompileError::orphan(&node.id));
            }
        }
    }

    let mut predecessors: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (source, targets) in &outgoing {
        for target in targets {
            predecessors
                .entry(target.to_string())
                .or_default()
                .push(source.to_string());
            successors
                .entry(source.to_string())
                .or_default()
                .push(target.to_string());
        }
    }
    for list in predecessors.values_mut().chain(successors.values_mut()) {
        list.sort();
        list.dedup();
    }

    for node in &unique {
        let referenced = referenced_nodes(&node.parameters);
        if referenced.is_empty() {
            continue;
        }
        let upstream = ancestors(&node.id, &predecessors);
        for id in referenced.iter().filter(|id| !upstream.contains(id.as_str())) {
            warnings.push(CompileError::detached_reference(&node.id, id));
        }
    }

    errors.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    warnings.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let valid = errors.is_empty();
    if valid {
        info!(
            "Workflow compiled: {} levels, {} warnings",
            levels.len(),
            warnings.len()
        );
    } else {
        warn!(
            "Workflow has {} structural errors ({} levels placed)",
            errors.len(),
            levels.len()
        );
    }

    let plan = CompiledPlan {
        levels,
        level_index,
        nodes: unique.iter().map(|n| (n.id.clone(), (*n).clone())).collect(),
        predecessors,
        successors,
        error_count: errors.len(),
    };

    Compilation {
        plan,
        errors,
        warnings,
    }
}

/// Collects every node with a path into `node_id`.
fn ancestors<'a>(node_id: &str, predecessors: &'a BTreeMap<String, Vec<String>>) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = predecessors
        .get(node_id)
        .map(|p| p.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some(parents) = predecessors.get(id) {
                stack.extend(parents.iter().map(String::as_str));
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, "set")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<Edge> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (s, t))| Edge::new(format!("e{}", i + 1), *s, *t))
            .collect()
    }

    fn partition(plan: &CompiledPlan) -> Vec<Vec<String>> {
        plan.levels()
            .iter()
            .map(|level| {
                let mut sorted = level.clone();
                sorted.sort();
                sorted
            })
            .collect()
    }

    fn assert_edges_respected(plan: &CompiledPlan, edges: &[Edge]) {
        for edge in edges {
            let source = plan.level_of(&edge.source).unwrap();
            let target = plan.level_of(&edge.target).unwrap();
            assert!(
                source < target,
                "edge {} -> {} violates level order ({} >= {})",
                edge.source,
                edge.target,
                source,
                target
            );
        }
    }

    #[test]
    fn test_diamond_levels() {
        let nodes = nodes(&["A", "B", "C", "D"]);
        let edges = edges(&[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")]);

        let compilation = compile(&nodes, &edges);

        assert!(compilation.is_valid());
        assert_eq!(compilation.total_levels(), 3);
        assert_eq!(
            compilation.plan.levels(),
            &[
                vec!["A".to_string()],
                vec!["B".to_string(), "C".to_string()],
                vec!["D".to_string()],
            ]
        );
        assert_eq!(compilation.plan.predecessors("D"), &["B", "C"]);
        assert_eq!(compilation.plan.successors("A"), &["B", "C"]);
    }

    #[test]
    fn test_dangling_edge_reported_once() {
        let nodes = nodes(&["A", "B"]);
        let edges = edges(&[("A", "B"), ("A", "X")]);

        let compilation = compile(&nodes, &edges);

        assert!(!compilation.is_valid());
        assert_eq!(compilation.errors.len(), 1);
        let error = &compilation.errors[0];
        assert_eq!(error.kind, CompileErrorKind::DanglingEdge);
        assert_eq!(error.node_id.as_deref(), Some("X"));
        assert_eq!(error.edge_id.as_deref(), Some("e2"));
        assert!(error.message.contains("X"));
        assert_eq!(compilation.total_levels(), 2);
    }

    #[test]
    fn test_dangling_source_excluded_from_in_degree() {
        let nodes = nodes(&["B"]);
        let edges = edges(&[("ghost", "B")]);

        let compilation = compile(&nodes, &edges);

        assert_eq!(compilation.errors.len(), 1);
        assert_eq!(compilation.plan.level_of("B"), Some(0));
    }

    #[test]
    fn test_cycle_reported_with_acyclic_component() {
        let nodes = nodes(&["A", "B", "C", "X", "Y"]);
        let edges = edges(&[("A", "B"), ("B", "C"), ("C", "A"), ("X", "Y")]);

        let compilation = compile(&nodes, &edges);

        assert!(!compilation.is_valid());
        let cycle_nodes: Vec<_> = compilation
            .errors
            .iter()
            .filter(|e| e.kind == CompileErrorKind::Cycle)
            .filter_map(|e| e.node_id.clone())
            .collect();
        assert_eq!(cycle_nodes, vec!["A", "B", "C"]);
        assert_eq!(compilation.plan.level_of("Y"), Some(1));
        assert_eq!(compilation.plan.level_of("A"), None);
        assert!(!compilation.plan.is_valid());
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let nodes = nodes(&["A"]);
        let edges = edges(&[("A", "A")]);

        let compilation = compile(&nodes, &edges);

        assert_eq!(compilation.errors.len(), 1);
        assert_eq!(compilation.errors[0].kind, CompileErrorKind::Cycle);
        assert_eq!(compilation.total_levels(), 0);
    }

    #[test]
    fn test_duplicate_node_id() {
        let nodes = nodes(&["A", "B", "A", "A"]);
        let compilation = compile(&nodes, &edges(&[("A", "B")]));

        assert_eq!(compilation.errors.len(), 1);
        assert_eq!(compilation.errors[0].kind, CompileErrorKind::DuplicateNodeId);
        assert!(compilation.errors[0].message.contains('3'));
        assert_eq!(compilation.plan.node_count(), 2);
    }

    #[test]
    fn test_orphan_is_warning_only() {
        let nodes = nodes(&["A", "B", "lonely"]);
        let compilation = compile(&nodes, &edges(&[("A", "B")]));

        assert!(compilation.is_valid());
        assert_eq!(compilation.warnings.len(), 1);
        assert_eq!(compilation.warnings[0].kind, CompileErrorKind::OrphanIsland);
        assert!(!compilation.warnings[0].kind.is_blocking());
        assert_eq!(compilation.plan.level_of("lonely"), Some(0));
    }

    #[test]
    fn test_single_node_workflow_has_no_warning() {
        let compilation = compile(&nodes(&["only"]), &[]);

        assert!(compilation.is_valid());
        assert!(compilation.warnings.is_empty());
        assert_eq!(compilation.total_levels(), 1);
    }

    #[test]
    fn test_empty_workflow() {
        let compilation = compile(&[], &[]);
        assert!(compilation.is_valid());
        assert_eq!(compilation.total_levels(), 0);
    }

    #[test]
    fn test_deterministic_under_reordering() {
        let forward_nodes = nodes(&["A", "B", "C", "D", "E", "Z"]);
        let forward_edges = edges(&[
            ("A", "B"),
            ("A", "C"),
            ("C", "D"),
            ("B", "D"),
            ("D", "E"),
            ("E", "Q"),
            ("Z", "Z"),
        ]);

        let mut reversed_nodes = forward_nodes.clone();
        reversed_nodes.reverse();
        let mut reversed_edges = forward_edges.clone();
        reversed_edges.reverse();

        let first = compile(&forward_nodes, &forward_edges);
        let second = compile(&reversed_nodes, &reversed_edges);
        let again = compile(&forward_nodes, &forward_edges);

        assert_eq!(partition(&first.plan), partition(&second.plan));
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.plan.levels(), again.plan.levels());
        assert_eq!(first.errors, again.errors);
    }

    #[test]
    fn test_levels_respect_every_edge() {
        let graphs: Vec<(Vec<Node>, Vec<Edge>)> = vec![
            (nodes(&["a", "b", "c"]), edges(&[("a", "b"), ("b", "c"), ("a", "c")])),
            (
                nodes(&["s", "t", "u", "v", "w"]),
                edges(&[("s", "u"), ("t", "u"), ("u", "w"), ("v", "w"), ("s", "w")]),
            ),
            (
                nodes(&["n5", "n4", "n3", "n2", "n1"]),
                edges(&[("n1", "n2"), ("n2", "n3"), ("n3", "n4"), ("n4", "n5"), ("n1", "n5")]),
            ),
        ];

        for (nodes, edges) in graphs {
            let compilation = compile(&nodes, &edges);
            assert!(compilation.is_valid());
            assert_eq!(compilation.plan.node_count(), nodes.len());
            let placed: HashSet<&String> = compilation.plan.node_ids().collect();
            assert_eq!(placed.len(), nodes.len());
            assert_edges_respected(&compilation.plan, &edges);
        }
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let nodes = nodes(&["root", "zeta", "alpha", "mid"]);
        let edges = edges(&[("root", "zeta"), ("root", "alpha"), ("root", "mid")]);

        let compilation = compile(&nodes, &edges);

        assert_eq!(compilation.plan.levels()[1], vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_parallel_edges_between_same_nodes() {
        let nodes = nodes(&["a", "b"]);
        let edges = vec![
            Edge::new("e1", "a", "b").with_ports("out", "in"),
            Edge::new("e2", "a", "b").with_ports("err", "in"),
        ];

        let compilation = compile(&nodes, &edges);

        assert!(compilation.is_valid());
        assert_eq!(compilation.total_levels(), 2);
        assert_eq!(compilation.plan.predecessors("b"), &["a"]);
    }

    #[test]
    fn test_detached_reference_warning() {
        let nodes = vec![
            Node::new("scan", "set"),
            Node::new("probe", "set").with_parameter("host", "{{scan.hosts.0}}"),
            Node::new("side", "set"),
            Node::new("report", "log").with_parameter("message", "{{side}} / {{scan}}"),
        ];
        let edges = edges(&[("scan", "probe"), ("probe", "report"), ("scan", "side")]);

        let compilation = compile(&nodes, &edges);

        assert!(compilation.is_valid());
        assert_eq!(compilation.warnings.len(), 1);
        let warning = &compilation.warnings[0];
        assert_eq!(warning.kind, CompileErrorKind::DetachedReference);
        assert_eq!(warning.node_id.as_deref(), Some("report"));
        assert!(warning.message.contains("'side'"));
    }

    #[test]
    fn test_report_serialization() {
        let compilation = compile(&nodes(&["A"]), &edges(&[("A", "X")]));
        let report = serde_json::to_value(compilation.report()).unwrap();

        assert_eq!(report["valid"], false);
        assert_eq!(report["totalLevels"], 1);
        assert_eq!(report["errors"][0]["nodeId"], "X");
        assert_eq!(report["errors"][0]["edgeId"], "e1");
        assert!(report.get("warnings").is_none());
    }
}
