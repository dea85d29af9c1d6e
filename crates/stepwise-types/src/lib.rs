//! Shared domain types for Stepwise.
//!
//! This crate contains the domain types used across the Stepwise engine:
//! process definitions and nodes, process instances, tasks and their
//! lifecycle statuses, engine configuration, and the shared error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod process;
pub mod task;
