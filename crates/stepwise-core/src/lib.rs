//! Business logic and repository trait definitions for Stepwise.
//!
//! This crate defines the static process graph, the task state machine, the
//! scheduler that advances finished tasks (including join coordination), the
//! machine-node worker, and the projector that overlays execution history on
//! a graph. Storage is reached only through the `ProcessRepository` port; the
//! crate depends on `stepwise-types` and never on `stepwise-infra` or any
//! database crate.

pub mod engine;
pub mod process;
pub mod repository;
pub mod task;
