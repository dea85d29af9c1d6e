//! Observability setup for Stepwise.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, try_init_test_tracing};
