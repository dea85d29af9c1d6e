//! Task domain types.
//!
//! A `Task` is one execution of one node for one process instance. Tasks are
//! created `Scheduled` and make exactly one transition into a terminal status.
//! The transition rules themselves live in `stepwise-core`; this module only
//! holds the record, its field vocabulary, and the query filters.

use std::error::Error as StdError;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task. Only `Scheduled` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Scheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TaskStatus::Scheduled),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status filter for task queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Scheduled,
    Succeeded,
    Failed,
    /// Everything except `Succeeded`.
    NotSucceeded,
    Canceled,
}

impl StatusFilter {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            StatusFilter::Scheduled => status == TaskStatus::Scheduled,
            StatusFilter::Succeeded => status == TaskStatus::Succeeded,
            StatusFilter::Failed => status == TaskStatus::Failed,
            StatusFilter::NotSucceeded => status != TaskStatus::Succeeded,
            StatusFilter::Canceled => status == TaskStatus::Canceled,
        }
    }
}

// ---------------------------------------------------------------------------
// Field vocabulary for scoped saves
// ---------------------------------------------------------------------------

/// A persisted task column that a mutation may change.
///
/// The modification timestamp is not listed: every commit writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    Status,
    Completed,
    CompletedAt,
    CompletedBy,
    ErrorType,
    ErrorMessage,
    Stacktrace,
}

impl TaskField {
    pub fn column(&self) -> &'static str {
        match self {
            TaskField::Status => "status",
            TaskField::Completed => "completed",
            TaskField::CompletedAt => "completed_at",
            TaskField::CompletedBy => "completed_by",
            TaskField::ErrorType => "error_type",
            TaskField::ErrorMessage => "error_message",
            TaskField::Stacktrace => "stacktrace",
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// The identity completing a task, as reported by the calling boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    Anonymous,
    User { id: String },
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Actor::User { id: id.into() }
    }

    /// The identity to record, or `None` for anonymous actors.
    pub fn authenticated_id(&self) -> Option<&str> {
        match self {
            Actor::Anonymous => None,
            Actor::User { id } => Some(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure data
// ---------------------------------------------------------------------------

/// Captured failure of a handler, built by the boundary that caught it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Short type name of the error (e.g. `ParseIntError`).
    pub error_type: String,
    pub message: String,
    /// Full formatted trace, ending with the `{error_type}: {message}` line.
    pub trace: String,
}

impl ErrorInfo {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Capture an error value and its `source()` chain.
    pub fn from_error<E: StdError + 'static>(err: &E) -> Self {
        let error_type = short_type_name(std::any::type_name::<E>()).to_string();
        let message = err.to_string();
        let mut trace = String::from("Trace (most recent call last):\n");
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str(&format!("  caused by: {cause}\n"));
            source = cause.source();
        }
        trace.push_str(&format!("{error_type}: {message}\n"));
        Self {
            error_type,
            message,
            trace,
        }
    }

    /// `"{error_type}: {message}"`.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.error_type, self.message)
    }
}

/// Current time truncated to the microsecond precision tasks are stored with.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Strip module path and generic arguments from a `type_name` string.
pub fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One execution of one node for one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// UUIDv7 assigned at creation.
    pub id: Uuid,
    pub process_id: Uuid,
    pub node_name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// True iff `status` is terminal.
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Authenticated identity that completed the task, if any.
    pub completed_by: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub stacktrace: Option<String>,
}

impl Task {
    /// A new `Scheduled` task.
    pub fn new(process_id: Uuid, node_name: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            id: Uuid::now_v7(),
            process_id,
            node_name: node_name.into(),
            status: TaskStatus::Scheduled,
            created_at: now,
            modified_at: now,
            completed: false,
            completed_at: None,
            completed_by: None,
            error_type: None,
            error_message: None,
            stacktrace: None,
        }
    }

    /// `"{error_type}: {message}"` for failed tasks.
    pub fn exception(&self) -> Option<String> {
        match (&self.error_type, &self.error_message) {
            (Some(kind), Some(message)) => Some(format!("{kind}: {message}")),
            _ => None,
        }
    }
}

/// A predecessor -> successor relation between two tasks of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskLink {
    pub parent_id: Uuid,
    pub child_id: Uuid,
}
