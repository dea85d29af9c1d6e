//! Process definition parsing and the definition registry.
//!
//! Converts TOML definition files into validated `ProcessGraph`s and keeps
//! one immutable graph per process type, shared by reference with every
//! instance of that type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stepwise_types::error::GraphError;
use stepwise_types::process::ProcessDefinitionFile;
use thiserror::Error;

use super::graph::ProcessGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading process definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// TOML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The edge list does not form a valid graph.
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Two definitions share a name.
    #[error("process '{0}' is defined more than once")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a TOML string into a validated `ProcessGraph`.
pub fn parse_definition_toml(source: &str) -> Result<ProcessGraph, DefinitionError> {
    let file: ProcessDefinitionFile =
        toml::from_str(source).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    Ok(ProcessGraph::from_definition(file)?)
}

/// Read and parse a single definition file.
pub fn load_definition_file(path: &Path) -> Result<ProcessGraph, DefinitionError> {
    let source = std::fs::read_to_string(path)?;
    parse_definition_toml(&source)
}

/// Find all `*.toml` files directly inside `dir`, sorted by path.
pub fn discover_definition_files(dir: &Path) -> Result<Vec<PathBuf>, DefinitionError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load every definition in `dir` into a registry.
pub fn load_definitions(dir: &Path) -> Result<DefinitionRegistry, DefinitionError> {
    let mut registry = DefinitionRegistry::new();
    for path in discover_definition_files(dir)? {
        let graph = load_definition_file(&path)?;
        tracing::info!(process = graph.name(), path = %path.display(), "loaded process definition");
        registry.register(graph)?;
    }
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One immutable `ProcessGraph` per process type, keyed by definition name.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    graphs: HashMap<String, Arc<ProcessGraph>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, graph: ProcessGraph) -> Result<Arc<ProcessGraph>, DefinitionError> {
        if self.graphs.contains_key(graph.name()) {
            return Err(DefinitionError::Duplicate(graph.name().to_string()));
        }
        let graph = Arc::new(graph);
        self.graphs.insert(graph.name().to_string(), Arc::clone(&graph));
        Ok(graph)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcessGraph>> {
        self.graphs.get(name).cloned()
    }

    /// Registered definition names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.graphs.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
