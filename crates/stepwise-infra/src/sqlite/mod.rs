//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod process;

pub use pool::DatabasePool;
pub use process::SqliteProcessRepository;
