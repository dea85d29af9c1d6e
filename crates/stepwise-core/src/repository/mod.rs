//! Repository trait definitions (ports).
//!
//! The infrastructure layer (stepwise-infra) implements these traits with
//! SQLite. The core crate never depends on a specific storage technology;
//! `memory` provides a process-local implementation for tests and embedding.

pub mod memory;
pub mod process;

pub use memory::InMemoryProcessRepository;
pub use process::ProcessRepository;
