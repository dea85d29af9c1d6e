//! Task state machine.
//!
//! `Scheduled` is the only non-terminal status. Each transition checks that,
//! stamps completion, and returns the fields it changed so the commit can be
//! scoped to exactly those columns.

use stepwise_types::task::{Actor, ErrorInfo, Task, TaskField, TaskStatus, timestamp_now};

use super::TaskError;

/// Terminal transitions on a `Task`.
pub trait TaskLifecycle {
    /// `Scheduled -> Succeeded`.
    fn finish(&mut self, actor: Option<&Actor>) -> Result<Vec<TaskField>, TaskError>;

    /// `Scheduled -> Failed`, storing the captured error.
    fn fail(&mut self, error: &ErrorInfo) -> Result<Vec<TaskField>, TaskError>;

    /// `Scheduled -> Canceled`. Only an authenticated actor is recorded.
    fn cancel(&mut self, actor: Option<&Actor>) -> Result<Vec<TaskField>, TaskError>;
}

impl TaskLifecycle for Task {
    fn finish(&mut self, actor: Option<&Actor>) -> Result<Vec<TaskField>, TaskError> {
        let mut fields = complete(self, TaskStatus::Succeeded)?;
        record_actor(self, actor, &mut fields);
        Ok(fields)
    }

    fn fail(&mut self, error: &ErrorInfo) -> Result<Vec<TaskField>, TaskError> {
        let mut fields = complete(self, TaskStatus::Failed)?;
        self.error_type = Some(error.error_type.clone());
        self.error_message = Some(error.message.clone());
        self.stacktrace = Some(error.trace.clone());
        fields.extend([TaskField::ErrorType, TaskField::ErrorMessage, TaskField::Stacktrace]);
        Ok(fields)
    }

    fn cancel(&mut self, actor: Option<&Actor>) -> Result<Vec<TaskField>, TaskError> {
        let mut fields = complete(self, TaskStatus::Canceled)?;
        record_actor(self, actor, &mut fields);
        Ok(fields)
    }
}

fn complete(task: &mut Task, status: TaskStatus) -> Result<Vec<TaskField>, TaskError> {
    if task.status.is_terminal() {
        return Err(TaskError::AlreadyCompleted {
            id: task.id,
            status: task.status,
        });
    }
    task.status = status;
    task.completed = true;
    task.completed_at = Some(timestamp_now());
    Ok(vec![TaskField::Status, TaskField::Completed, TaskField::CompletedAt])
}

fn record_actor(task: &mut Task, actor: Option<&Actor>, fields: &mut Vec<TaskField>) {
    if let Some(id) = actor.and_then(Actor::authenticated_id) {
        task.completed_by = Some(id.to_string());
        fields.push(TaskField::CompletedBy);
    }
}
