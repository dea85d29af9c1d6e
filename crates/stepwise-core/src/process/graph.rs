//! Immutable process graph built from a declared edge list.
//!
//! Nodes are declared up front as `NodeSpec`s, but only nodes that appear as
//! an edge endpoint are bound into the graph: unused declarations cannot be
//! looked up. Successor order follows edge declaration order. Cycles are
//! allowed; every operation here is a local lookup, never a traversal.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use stepwise_types::error::GraphError;
use stepwise_types::process::{NodeHandler, NodeKind, NodeSpec, ProcessDefinitionFile};

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A node bound into a process graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    handler: NodeHandler,
    join: bool,
    process: String,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.handler.kind()
    }

    pub fn handler(&self) -> &NodeHandler {
        &self.handler
    }

    /// Whether converging branches share a single task for this node.
    pub fn is_join(&self) -> bool {
        self.join
    }

    /// Name of the process definition that owns this node.
    pub fn process(&self) -> &str {
        &self.process
    }
}

// ---------------------------------------------------------------------------
// ProcessGraph
// ---------------------------------------------------------------------------

/// Static graph of one process definition. Constructed once, never mutated.
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    name: String,
    description: Option<String>,
    /// Bound nodes only.
    nodes: HashMap<String, Node>,
    /// Bound node names in order of first appearance in the edge list.
    order: Vec<String>,
    /// Declared edges, in declaration order.
    edges: Vec<(String, String)>,
    /// Distinct successors per node, in declaration order.
    successors: HashMap<String, Vec<String>>,
    has_incoming: HashSet<String>,
}

impl ProcessGraph {
    pub fn builder(name: impl Into<String>) -> ProcessGraphBuilder {
        ProcessGraphBuilder::new(name)
    }

    /// Build a graph from a parsed definition file.
    pub fn from_definition(file: ProcessDefinitionFile) -> Result<Self, GraphError> {
        let mut builder = ProcessGraphBuilder::new(file.name);
        builder.description = file.description;
        builder.nodes = file.nodes;
        builder.edges = file.edges;
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// All bound nodes keyed by name.
    pub fn get_nodes(&self) -> &HashMap<String, Node> {
        &self.nodes
    }

    /// Bound nodes in order of first appearance in the edge list.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// Look up a bound node by name.
    pub fn get_node(&self, name: &str) -> Result<&Node, GraphError> {
        self.nodes.get(name).ok_or_else(|| GraphError::NodeNotFound {
            process: self.name.clone(),
            node: name.to_string(),
        })
    }

    /// Distinct destinations of edges leaving `name`, in declaration order.
    pub fn get_next_nodes(&self, name: &str) -> Result<Vec<&Node>, GraphError> {
        self.get_node(name)?;
        Ok(self
            .successors
            .get(name)
            .map(|next| next.iter().filter_map(|n| self.nodes.get(n)).collect())
            .unwrap_or_default())
    }

    /// Declared edges, in declaration order.
    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    /// Whether `from -> to` is a declared edge.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.successors
            .get(from)
            .is_some_and(|next| next.iter().any(|n| n == to))
    }

    /// Bound nodes without incoming edges.
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.nodes_in_order()
            .filter(|node| !self.has_incoming.contains(node.name()))
            .collect()
    }

    /// Bind a declaration to this graph.
    ///
    /// Fails with `NotBound` unless the declaration is one of this graph's
    /// edge endpoints.
    pub fn resolve(&self, spec: &NodeSpec) -> Result<&Node, GraphError> {
        match self.nodes.get(&spec.name) {
            Some(node) if node.handler == spec.handler && node.join == spec.join => Ok(node),
            _ => Err(GraphError::NotBound(spec.name.clone())),
        }
    }

    pub fn node_name(&self, spec: &NodeSpec) -> Result<&str, GraphError> {
        self.resolve(spec).map(Node::name)
    }

    pub fn node_type(&self, spec: &NodeSpec) -> Result<NodeKind, GraphError> {
        self.resolve(spec).map(Node::kind)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects node declarations and edges, then validates them in `build`.
#[derive(Debug, Clone)]
pub struct ProcessGraphBuilder {
    name: String,
    description: Option<String>,
    nodes: Vec<NodeSpec>,
    edges: Vec<Vec<Value>>,
}

impl ProcessGraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges
            .push(vec![Value::String(from.to_string()), Value::String(to.to_string())]);
        self
    }

    /// Add an edge from raw endpoint values, as read from a definition file.
    pub fn raw_edge(mut self, endpoints: Vec<Value>) -> Self {
        self.edges.push(endpoints);
        self
    }

    pub fn build(self) -> Result<ProcessGraph, GraphError> {
        let mut declared: HashMap<String, NodeSpec> = HashMap::with_capacity(self.nodes.len());
        for spec in self.nodes {
            if declared.contains_key(&spec.name) {
                return Err(GraphError::DuplicateNode(spec.name));
            }
            declared.insert(spec.name.clone(), spec);
        }

        let mut nodes = HashMap::new();
        let mut order = Vec::new();
        let mut edges = Vec::with_capacity(self.edges.len());
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut has_incoming = HashSet::new();

        for (index, endpoints) in self.edges.iter().enumerate() {
            let [from, to] = endpoints.as_slice() else {
                return Err(GraphError::MalformedEdge {
                    edge: index,
                    len: endpoints.len(),
                });
            };
            let from = endpoint_name(index, from)?;
            let to = endpoint_name(index, to)?;

            for name in [from, to] {
                if nodes.contains_key(name) {
                    continue;
                }
                let spec = declared.get(name).ok_or_else(|| GraphError::UnknownEndpoint {
                    edge: index,
                    node: name.to_string(),
                })?;
                nodes.insert(
                    name.to_string(),
                    Node {
                        name: spec.name.clone(),
                        handler: spec.handler.clone(),
                        join: spec.join,
                        process: self.name.clone(),
                    },
                );
                order.push(name.to_string());
            }

            let next = successors.entry(from.to_string()).or_default();
            if !next.iter().any(|n| n == to) {
                next.push(to.to_string());
            }
            has_incoming.insert(to.to_string());
            edges.push((from.to_string(), to.to_string()));
        }

        tracing::debug!(
            process = %self.name,
            nodes = nodes.len(),
            edges = edges.len(),
            "built process graph"
        );

        Ok(ProcessGraph {
            name: self.name,
            description: self.description,
            nodes,
            order,
            edges,
            successors,
            has_incoming,
        })
    }
}

/// An edge endpoint must be a plain node name.
fn endpoint_name(edge: usize, value: &Value) -> Result<&str, GraphError> {
    match value {
        Value::String(name) => Ok(name),
        other => Err(GraphError::UnhashableEndpoint {
            edge,
            found: value_kind(other).to_string(),
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "table",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
