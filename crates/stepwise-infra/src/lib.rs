//! Infrastructure layer for Stepwise.
//!
//! Implements the `ProcessRepository` trait defined in `stepwise-core` on
//! SQLite, and loads the engine configuration and data directory.

pub mod config;
pub mod sqlite;
