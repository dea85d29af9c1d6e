use thiserror::Error;

/// Errors raised while building or querying a process graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node '{node}' not found in process '{process}'")]
    NodeNotFound { process: String, node: String },

    #[error("node '{0}' is not bound to any edge of a process definition")]
    NotBound(String),

    #[error("edge {edge}: endpoint must be a node name, got {found}")]
    UnhashableEndpoint { edge: usize, found: String },

    #[error("edge {edge}: endpoint '{node}' is not a declared node")]
    UnknownEndpoint { edge: usize, node: String },

    #[error("edge {edge}: expected a (source, destination) pair, got {len} element(s)")]
    MalformedEdge { edge: usize, len: usize },

    #[error("node '{0}' is declared more than once")]
    DuplicateNode(String),
}

/// Errors from repository operations (used by trait definitions in stepwise-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
