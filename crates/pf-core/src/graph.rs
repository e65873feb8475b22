//! Geometry build graph
//!
//! A flat arena of [`BuildNode`]s in evaluation order. Every input of a node
//! has a smaller [`NodeId`] than the node itself, so walking the arena front
//! to back always sees inputs before their consumers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::request::{BuildSpecification, NodeKind, OpKind};

/// Index into the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One modeling step with resolved input references
#[derive(Debug, Clone, PartialEq)]
pub struct BuildNode {
    pub id: NodeId,
    /// Operation id from the request
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    pub enabled: bool,
    pub optional: bool,
}

impl BuildNode {
    pub fn kind(&self) -> NodeKind {
        self.op.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate operation id '{0}'")]
    DuplicateId(String),
    #[error("Operation '{node}' references unknown operation '{reference}'")]
    DanglingReference { node: String, reference: String },
    #[error("Operation '{0}' references itself")]
    SelfReference(String),
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Unknown output '{0}'")]
    UnknownOutput(String),
}

impl GraphError {
    /// Operation id the error is about, when there is one
    pub fn node(&self) -> Option<&str> {
        match self {
            GraphError::DuplicateId(id) | GraphError::SelfReference(id) => Some(id),
            GraphError::DanglingReference { node, .. } => Some(node),
            GraphError::Cycle(path) => path.first().map(String::as_str),
            GraphError::UnknownOutput(_) => None,
        }
    }
}

/// Validated, topologically ordered build graph
#[derive(Debug, Clone)]
pub struct BuildGraph {
    nodes: Vec<BuildNode>,
    outputs: Vec<NodeId>,
    reachable: Vec<bool>,
}

impl BuildGraph {
    /// Resolve references and order the operations of `spec`
    ///
    /// Among nodes whose inputs are all placed, the one declared first is
    /// placed next, so the order depends only on the request.
    pub fn from_spec(spec: &BuildSpecification) -> Result<Self, GraphError> {
        let operations = spec.operations();

        let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(operations.len());
        for (index, op) in operations.iter().enumerate() {
            if by_name.insert(op.id.as_str(), index).is_some() {
                return Err(GraphError::DuplicateId(op.id.clone()));
            }
        }

        // Declaration-index edges
        let mut inputs: Vec<Vec<usize>> = Vec::with_capacity(operations.len());
        for op in operations {
            let mut resolved = Vec::with_capacity(op.inputs.len());
            for reference in &op.inputs {
                if *reference == op.id {
                    return Err(GraphError::SelfReference(op.id.clone()));
                }
                let index = by_name
                    .get(reference.as_str())
                    .copied()
                    .ok_or_else(|| GraphError::DanglingReference {
                        node: op.id.clone(),
                        reference: reference.clone(),
                    })?;
                resolved.push(index);
            }
            inputs.push(resolved);
        }

        let outputs = spec
            .outputs()
            .iter()
            .map(|name| {
                by_name
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| GraphError::UnknownOutput(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let order = topological_order(&inputs).map_err(|cycle| {
            GraphError::Cycle(cycle.into_iter().map(|i| operations[i].id.clone()).collect())
        })?;

        let mut position = vec![0; operations.len()];
        for (arena, &declared) in order.iter().enumerate() {
            position[declared] = arena;
        }

        let nodes: Vec<BuildNode> = order
            .iter()
            .enumerate()
            .map(|(arena, &declared)| {
                let op = &operations[declared];
                BuildNode {
                    id: NodeId(arena),
                    name: op.id.clone(),
                    op: op.op.clone(),
                    inputs: inputs[declared].iter().map(|&i| NodeId(position[i])).collect(),
                    enabled: op.enabled,
                    optional: op.optional,
                }
            })
            .collect();
        let outputs: Vec<NodeId> = outputs.into_iter().map(|i| NodeId(position[i])).collect();
        let reachable = mark_reachable(&nodes, &outputs);

        tracing::debug!(
            nodes = nodes.len(),
            reachable = reachable.iter().filter(|r| **r).count(),
            "built geometry graph"
        );

        Ok(Self {
            nodes,
            outputs,
            reachable,
        })
    }

    /// All nodes in evaluation order
    pub fn nodes(&self) -> &[BuildNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &BuildNode {
        &self.nodes[id.0]
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.id)
    }

    /// Whether evaluating the outputs needs this node
    pub fn is_reachable(&self, id: NodeId) -> bool {
        self.reachable[id.0]
    }

    /// Nodes the outputs depend on, in evaluation order
    pub fn evaluation_order(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.iter().filter(|n| self.reachable[n.id.0])
    }
}

/// Kahn's algorithm with an ordered ready set
///
/// Returns declaration indices in evaluation order, or a cycle path
/// (first element repeated at the end) when no order exists.
fn topological_order(inputs: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = inputs.len();
    let mut pending: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_inputs) in inputs.iter().enumerate() {
        for &input in node_inputs {
            dependents[input].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }
    Err(find_cycle(inputs, &pending))
}

/// Follow unplaced inputs from the first unplaced node until one repeats
fn find_cycle(inputs: &[Vec<usize>], pending: &[usize]) -> Vec<usize> {
    let unplaced = |i: usize| pending[i] > 0;
    let Some(start) = (0..inputs.len()).find(|&i| unplaced(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        // Every unplaced node has at least one unplaced input
        let Some(&next) = inputs[current].iter().find(|&&i| unplaced(i)) else {
            return path;
        };
        if let Some(&at) = seen.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.push(next);
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

fn mark_reachable(nodes: &[BuildNode], outputs: &[NodeId]) -> Vec<bool> {
    let mut reachable = vec![false; nodes.len()];
    for output in outputs {
        reachable[output.0] = true;
    }
    for node in nodes.iter().rev() {
        if !reachable[node.id.0] {
            continue;
        }
        // A disabled node only passes its first input through
        let needed = if node.enabled { &node.inputs[..] } else { &node.inputs[..node.inputs.len().min(1)] };
        for input in needed {
            reachable[input.0] = true;
        }
    }
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_value;
    use serde_json::json;

    fn graph(request: serde_json::Value) -> Result<BuildGraph, GraphError> {
        BuildGraph::from_spec(&parse_value(&request).unwrap())
    }

    fn names(graph: &BuildGraph) -> Vec<&str> {
        graph.nodes().iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_forward_references_are_ordered() {
        let g = graph(json!({
            "operations": [
                {"id": "moved", "op": "translate", "input": "base", "offset": [1, 0, 0]},
                {"id": "base", "op": "sphere", "radius": 1},
                {"id": "other", "op": "box", "size": [1, 1, 1]},
                {"id": "both", "op": "union", "inputs": ["moved", "other"]}
            ]
        }))
        .unwrap();

        assert_eq!(names(&g), vec!["base", "moved", "other", "both"]);
        for node in g.nodes() {
            assert!(node.inputs.iter().all(|i| i.0 < node.id.0));
        }
        assert_eq!(g.outputs(), &[NodeId(3)]);
        assert_eq!(g.find("moved"), Some(NodeId(1)));
    }

    #[test]
    fn test_order_is_deterministic() {
        let request = json!({
            "operations": [
                {"id": "c", "op": "sphere", "radius": 1},
                {"id": "a", "op": "sphere", "radius": 2},
                {"id": "u", "op": "union", "inputs": ["a", "c"]}
            ]
        });
        let first = graph(request.clone()).unwrap();
        let second = graph(request).unwrap();
        assert_eq!(first.nodes(), second.nodes());
        assert_eq!(names(&first), vec!["c", "a", "u"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = graph(json!({
            "operations": [
                {"id": "seed", "op": "sphere", "radius": 1},
                {"id": "a", "op": "union", "inputs": ["seed", "c"]},
                {"id": "b", "op": "translate", "input": "a", "offset": [1, 0, 0]},
                {"id": "c", "op": "translate", "input": "b", "offset": [1, 0, 0]}
            ]
        }))
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::Cycle(vec!["a".into(), "c".into(), "b".into(), "a".into()])
        );
        assert_eq!(err.to_string(), "Dependency cycle: a -> c -> b -> a");
        assert_eq!(err.node(), Some("a"));
    }

    #[test]
    fn test_reference_errors() {
        let duplicate = graph(json!({"operations": [
            {"id": "a", "op": "sphere", "radius": 1},
            {"id": "a", "op": "sphere", "radius": 2}
        ]}));
        assert_eq!(duplicate.unwrap_err(), GraphError::DuplicateId("a".into()));

        let dangling = graph(json!({"operations": [
            {"id": "a", "op": "translate", "input": "ghost", "offset": [0, 0, 1]}
        ]}));
        assert_eq!(
            dangling.unwrap_err(),
            GraphError::DanglingReference {
                node: "a".into(),
                reference: "ghost".into()
            }
        );

        let itself = graph(json!({"operations": [
            {"id": "a", "op": "sphere", "radius": 1},
            {"id": "b", "op": "union", "inputs": ["a", "b"]}
        ]}));
        assert_eq!(itself.unwrap_err(), GraphError::SelfReference("b".into()));

        let output = graph(json!({
            "operations": [{"id": "a", "op": "sphere", "radius": 1}],
            "outputs": ["z"]
        }));
        assert_eq!(output.unwrap_err(), GraphError::UnknownOutput("z".into()));
    }

    #[test]
    fn test_reachability() {
        let g = graph(json!({
            "parameters": {"disk": false},
            "operations": [
                {"id": "body", "op": "sphere", "radius": 1},
                {"id": "unused", "op": "box", "size": [1, 1, 1]},
                {"id": "disk", "op": "cylinder", "radius": 2, "height": 0.5},
                {"id": "with_disk", "op": "union", "inputs": ["body", "disk"], "when": "$disk"}
            ],
            "outputs": ["with_disk"]
        }))
        .unwrap();

        let reachable: Vec<&str> = g.evaluation_order().map(|n| n.name.as_str()).collect();
        assert_eq!(reachable, vec!["body", "with_disk"]);
        assert!(!g.is_reachable(g.find("unused").unwrap()));
        assert!(!g.is_reachable(g.find("disk").unwrap()));
    }
}
