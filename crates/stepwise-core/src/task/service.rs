//! Field-scoped task commits.
//!
//! Every mutation names the fields it changed; the repository writes only
//! those plus `modified_at`. Two writers touching disjoint fields of one task
//! therefore never clobber each other, and a status write that lost a race
//! surfaces as `RepositoryError::Conflict` instead of overwriting.

use std::sync::Arc;

use chrono::Duration;
use stepwise_types::task::{Actor, ErrorInfo, Task, TaskField, timestamp_now};

use super::TaskError;
use super::lifecycle::TaskLifecycle;
use crate::repository::ProcessRepository;

pub struct TaskService<R: ProcessRepository> {
    repo: Arc<R>,
}

impl<R: ProcessRepository> Clone for TaskService<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: ProcessRepository> TaskService<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Commit `update_fields` of `task`.
    ///
    /// `None` is rejected with `MissingUpdateFields`. An empty list is valid
    /// and still moves `modified_at` strictly forward. `task.modified_at` is
    /// set to the value the store wrote.
    pub async fn save(
        &self,
        task: &mut Task,
        update_fields: Option<&[TaskField]>,
    ) -> Result<(), TaskError> {
        let fields = update_fields.ok_or(TaskError::MissingUpdateFields)?;
        let now = timestamp_now();
        task.modified_at = if now > task.modified_at {
            now
        } else {
            task.modified_at + Duration::microseconds(1)
        };
        task.modified_at = self.repo.update_task(task, fields).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(task_id = %task.id, node = %task.node_name))]
    pub async fn finish(&self, task: &mut Task, actor: Option<&Actor>) -> Result<(), TaskError> {
        let fields = task.finish(actor)?;
        self.save(task, Some(&fields)).await?;
        tracing::debug!("task succeeded");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(task_id = %task.id, node = %task.node_name))]
    pub async fn fail(&self, task: &mut Task, error: &ErrorInfo) -> Result<(), TaskError> {
        let fields = task.fail(error)?;
        self.save(task, Some(&fields)).await?;
        tracing::error!(error = %error.summary(), "task failed");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(task_id = %task.id, node = %task.node_name))]
    pub async fn cancel(&self, task: &mut Task, actor: Option<&Actor>) -> Result<(), TaskError> {
        let fields = task.cancel(actor)?;
        self.save(task, Some(&fields)).await?;
        tracing::info!("task canceled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryProcessRepository;
    use stepwise_types::error::RepositoryError;
    use stepwise_types::task::TaskStatus;
    use uuid::Uuid;

    async fn setup() -> (Arc<InMemoryProcessRepository>, TaskService<InMemoryProcessRepository>, Task) {
        let repo = Arc::new(InMemoryProcessRepository::new());
        let task = Task::new(Uuid::now_v7(), "start");
        repo.create_task(&task, &[]).await.unwrap();
        let service = TaskService::new(Arc::clone(&repo));
        (repo, service, task)
    }

    #[tokio::test]
    async fn test_save_requires_explicit_fields() {
        let (_, service, mut task) = setup().await;
        let err = service.save(&mut task, None).await.unwrap_err();
        assert!(matches!(err, TaskError::MissingUpdateFields));
        assert_eq!(
            err.to_string(),
            "explicit update fields are required to avoid lost updates"
        );
    }

    #[tokio::test]
    async fn test_empty_save_advances_modified() {
        let (repo, service, mut task) = setup().await;
        let before = task.modified_at;
        service.save(&mut task, Some(&[])).await.unwrap();
        assert!(task.modified_at > before);

        let second = task.modified_at;
        service.save(&mut task, Some(&[])).await.unwrap();
        assert!(task.modified_at > second);

        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.modified_at, task.modified_at);
    }

    #[tokio::test]
    async fn test_finish_persists() {
        let (repo, service, mut task) = setup().await;
        service.finish(&mut task, Some(&Actor::user("spidy"))).await.unwrap();
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert!(stored.completed);
        assert_eq!(stored.completed_by.as_deref(), Some("spidy"));
    }

    #[tokio::test]
    async fn test_fail_persists_error() {
        let (repo, service, mut task) = setup().await;
        let err = std::io::Error::other("nope");
        service.fail(&mut task, &ErrorInfo::from_error(&err)).await.unwrap();
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.exception().as_deref(), Some("Error: nope"));
        assert!(stored.stacktrace.is_some());
    }

    #[tokio::test]
    async fn test_stale_copy_loses_status_race() {
        let (repo, service, task) = setup().await;
        let mut worker_copy = task.clone();
        let mut human_copy = task.clone();

        service.cancel(&mut human_copy, None).await.unwrap();
        let err = service.finish(&mut worker_copy, None).await.unwrap_err();
        assert!(matches!(err, TaskError::Repository(RepositoryError::Conflict(_))));

        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_disjoint_field_saves_do_not_clobber() {
        let (repo, service, task) = setup().await;
        let mut a = task.clone();
        let mut b = task.clone();

        a.error_message = Some("note".to_string());
        service.save(&mut a, Some(&[TaskField::ErrorMessage])).await.unwrap();
        b.completed_by = Some("spidy".to_string());
        service.save(&mut b, Some(&[TaskField::CompletedBy])).await.unwrap();

        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("note"));
        assert_eq!(stored.completed_by.as_deref(), Some("spidy"));
    }
}
