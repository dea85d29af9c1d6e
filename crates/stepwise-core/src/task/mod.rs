//! Task lifecycle: the state machine and the save discipline.
//!
//! `lifecycle` holds the pure transitions on a `Task` value; `service` commits
//! them through the repository with an explicit changed-field list.

pub mod lifecycle;
pub mod service;

use stepwise_types::error::RepositoryError;
use stepwise_types::task::TaskStatus;
use thiserror::Error;
use uuid::Uuid;

pub use lifecycle::TaskLifecycle;
pub use service::TaskService;

/// Errors raised by task transitions and commits.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A commit was attempted without naming the fields it changes.
    #[error("explicit update fields are required to avoid lost updates")]
    MissingUpdateFields,

    /// The task already reached a terminal status.
    #[error("task {id} is already {status}")]
    AlreadyCompleted { id: Uuid, status: TaskStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
