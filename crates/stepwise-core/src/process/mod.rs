//! Process definitions: the static graph, definition loading, and the
//! instance graph projector.

pub mod definition;
pub mod graph;
pub mod projector;

pub use definition::{DefinitionError, DefinitionRegistry, load_definitions, parse_definition_toml};
pub use graph::{Node, ProcessGraph, ProcessGraphBuilder};
pub use projector::{GraphView, project_definition, project_instance};
