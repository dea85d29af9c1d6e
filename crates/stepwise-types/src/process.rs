//! Process definition domain types.
//!
//! A process definition is declared as a list of nodes plus an ordered edge
//! list. `ProcessDefinitionFile` is the serialized form (TOML or JSON);
//! `NodeSpec` is the declaration of one step before it is bound into a
//! graph. `ProcessInstance` is one running occurrence of a definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::timestamp_now;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Who performs a node: a person through a form, or automated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Human,
    Machine,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Human => "human",
            NodeKind::Machine => "machine",
        }
    }
}

/// What runs a node.
///
/// Internally tagged by `kind` to match the definition file layout:
/// ```toml
/// kind = "machine"
/// callable = "billing.charge_card"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeHandler {
    /// Rendered by an external view; completed when a person submits it.
    Human { view: String },
    /// Invoked asynchronously by the worker through the handler registry.
    Machine { callable: String },
}

impl NodeHandler {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeHandler::Human { .. } => NodeKind::Human,
            NodeHandler::Machine { .. } => NodeKind::Machine,
        }
    }

    /// The view or callable descriptor.
    pub fn descriptor(&self) -> &str {
        match self {
            NodeHandler::Human { view } => view,
            NodeHandler::Machine { callable } => callable,
        }
    }
}

/// Declaration of a single node, not yet bound into a process graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable node name, unique within one process definition.
    pub name: String,
    #[serde(flatten)]
    pub handler: NodeHandler,
    /// Join nodes yield at most one task per process instance, no matter how
    /// many branches converge on them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub join: bool,
}

impl NodeSpec {
    pub fn human(name: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: NodeHandler::Human { view: view.into() },
            join: false,
        }
    }

    pub fn machine(name: impl Into<String>, callable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: NodeHandler::Machine {
                callable: callable.into(),
            },
            join: false,
        }
    }

    /// Mark this node as a join node.
    pub fn join(mut self) -> Self {
        self.join = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Definition file
// ---------------------------------------------------------------------------

/// Serialized process definition.
///
/// Edge endpoints are kept as raw values so graph construction can reject
/// anything that is not a plain node name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinitionFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Ordered (source, destination) pairs.
    #[serde(default)]
    pub edges: Vec<Vec<serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Process instance
// ---------------------------------------------------------------------------

/// One running occurrence of a process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// UUIDv7 assigned at start.
    pub id: Uuid,
    /// Name of the process definition this instance runs.
    pub definition: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ProcessInstance {
    pub fn new(definition: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            id: Uuid::now_v7(),
            definition: definition.into(),
            created_at: now,
            modified_at: now,
        }
    }
}
