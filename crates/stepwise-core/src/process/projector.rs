//! Visualization-ready projection of a process graph.
//!
//! `project_definition` renders the static graph. `project_instance` overlays
//! one instance's history: each node with tasks carries its latest task's
//! status, and edges exercised by real predecessor -> successor lineage are
//! marked traversed. The rendered edge set is the union of declared edges and
//! lineage edges, so transitions taken through an explicit override still
//! appear even though the definition never declared them.
//!
//! `GraphView::to_dot` hands the result to `petgraph::dot` for a Graphviz
//! description; layout and image rendering are left to external tools.

use std::collections::{HashMap, HashSet};

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, EdgeReference, NodeIndex};
use serde::Serialize;
use stepwise_types::process::NodeKind;
use stepwise_types::task::{Task, TaskLink, TaskStatus};
use uuid::Uuid;

use super::graph::ProcessGraph;

// ---------------------------------------------------------------------------
// View types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexKind {
    Human,
    Machine,
    /// A node present in the history but absent from the definition, such as
    /// a manual override.
    Override,
}

impl From<NodeKind> for VertexKind {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Human => VertexKind::Human,
            NodeKind::Machine => VertexKind::Machine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexStatus {
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl From<TaskStatus> for VertexStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Scheduled => VertexStatus::InProgress,
            TaskStatus::Succeeded => VertexStatus::Succeeded,
            TaskStatus::Failed => VertexStatus::Failed,
            TaskStatus::Canceled => VertexStatus::Canceled,
        }
    }
}

impl VertexStatus {
    pub fn label(&self) -> &'static str {
        match self {
            VertexStatus::InProgress => "in progress",
            VertexStatus::Succeeded => "succeeded",
            VertexStatus::Failed => "failed",
            VertexStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vertex {
    pub name: String,
    pub kind: VertexKind,
    /// Latest task status; `None` for nodes with no task (or definition views).
    pub status: Option<VertexStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    /// Present in the definition's edge list.
    pub declared: bool,
    /// A succeeded task at `from` led to the creation of a task at `to`.
    pub traversed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphView {
    pub process: String,
    /// Set when the view overlays an instance's history.
    pub instance: Option<Uuid>,
    pub vertices: Vec<Vertex>,
    pub edges: Vec<EdgeView>,
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Render the static definition: one vertex per node, one edge per transition.
pub fn project_definition(graph: &ProcessGraph) -> GraphView {
    let vertices = graph
        .nodes_in_order()
        .map(|node| Vertex {
            name: node.name().to_string(),
            kind: node.kind().into(),
            status: None,
        })
        .collect();

    let mut seen = HashSet::new();
    let edges = graph
        .edges()
        .iter()
        .filter(|edge| seen.insert((*edge).clone()))
        .map(|(from, to)| EdgeView {
            from: from.clone(),
            to: to.clone(),
            declared: true,
            traversed: false,
        })
        .collect();

    GraphView {
        process: graph.name().to_string(),
        instance: None,
        vertices,
        edges,
    }
}

/// Overlay one instance's tasks and task lineage on its definition.
pub fn project_instance(
    graph: &ProcessGraph,
    process_id: Uuid,
    tasks: &[Task],
    links: &[TaskLink],
) -> GraphView {
    let mut view = project_definition(graph);
    view.instance = Some(process_id);

    let mut ordered: Vec<&Task> = tasks.iter().filter(|t| t.process_id == process_id).collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    // Latest task per node wins.
    let mut latest: HashMap<&str, TaskStatus> = HashMap::new();
    for task in &ordered {
        latest.insert(task.node_name.as_str(), task.status);
    }

    for vertex in &mut view.vertices {
        vertex.status = latest.get(vertex.name.as_str()).map(|s| (*s).into());
    }

    let mut known: HashSet<String> = view.vertices.iter().map(|v| v.name.clone()).collect();
    for task in &ordered {
        if known.insert(task.node_name.clone()) {
            view.vertices.push(Vertex {
                name: task.node_name.clone(),
                kind: VertexKind::Override,
                status: latest.get(task.node_name.as_str()).map(|s| (*s).into()),
            });
        }
    }

    let by_id: HashMap<Uuid, &Task> = ordered.iter().map(|t| (t.id, *t)).collect();
    let position: HashMap<Uuid, usize> =
        ordered.iter().enumerate().map(|(i, t)| (t.id, i)).collect();

    let mut lineage: Vec<&TaskLink> = links
        .iter()
        .filter(|l| by_id.contains_key(&l.parent_id) && by_id.contains_key(&l.child_id))
        .collect();
    lineage.sort_by_key(|l| (position[&l.child_id], position[&l.parent_id]));

    for link in lineage {
        let parent = by_id[&link.parent_id];
        let child = by_id[&link.child_id];
        let traversed = parent.status == TaskStatus::Succeeded;

        match view
            .edges
            .iter_mut()
            .find(|e| e.from == parent.node_name && e.to == child.node_name)
        {
            Some(edge) => edge.traversed |= traversed,
            None => view.edges.push(EdgeView {
                from: parent.node_name.clone(),
                to: child.node_name.clone(),
                declared: false,
                traversed,
            }),
        }
    }

    view
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

type ViewGraph<'a> = DiGraph<&'a Vertex, &'a EdgeView>;

impl GraphView {
    pub fn vertex(&self, name: &str) -> Option<&Vertex> {
        self.vertices.iter().find(|v| v.name == name)
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&EdgeView> {
        self.edges.iter().find(|e| e.from == from && e.to == to)
    }

    /// Graphviz DOT description of this view.
    pub fn to_dot(&self) -> String {
        let mut graph: ViewGraph<'_> = DiGraph::new();
        let mut index = HashMap::new();
        for vertex in &self.vertices {
            index.insert(vertex.name.as_str(), graph.add_node(vertex));
        }
        for edge in &self.edges {
            if let (Some(from), Some(to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
                graph.add_edge(*from, *to, edge);
            }
        }

        let overlay = self.instance.is_some();
        let edge_attrs: &dyn Fn(&ViewGraph<'_>, EdgeReference<'_, &EdgeView>) -> String =
            &|_, edge| edge_attributes(edge.weight(), overlay);
        let node_attrs: &dyn Fn(&ViewGraph<'_>, (NodeIndex, &&Vertex)) -> String =
            &|_, (_, vertex)| vertex_attributes(vertex);
        let dot = Dot::with_attr_getters(
            &graph,
            &[Config::NodeNoLabel, Config::EdgeNoLabel],
            edge_attrs,
            node_attrs,
        );
        format!("{dot:?}")
    }
}

fn vertex_attributes(vertex: &Vertex) -> String {
    let shape = match vertex.kind {
        VertexKind::Human => "box",
        VertexKind::Machine => "ellipse",
        VertexKind::Override => "diamond",
    };
    let name = escape(&vertex.name);
    match vertex.status {
        Some(status) => {
            let color = match status {
                VertexStatus::InProgress => "lightblue",
                VertexStatus::Succeeded => "palegreen",
                VertexStatus::Failed => "salmon",
                VertexStatus::Canceled => "lightgrey",
            };
            format!(
                "label = \"{name}\\n({})\" shape = {shape} style = filled fillcolor = {color} ",
                status.label()
            )
        }
        None => format!("label = \"{name}\" shape = {shape} "),
    }
}

fn edge_attributes(edge: &EdgeView, overlay: bool) -> String {
    if !overlay {
        return String::new();
    }
    if edge.traversed {
        "style = bold ".to_string()
    } else {
        "style = dashed ".to_string()
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
