//! In-memory process repository.
//!
//! Backed by `DashMap`s. Join get-or-create holds the join-key entry guard
//! while inserting the task, so concurrent arrivals at a join node observe
//! exactly one task. Guarded status writes hold the task's entry guard for
//! the check and the write. Values are cloned on read; no guard is held
//! across an await.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepwise_types::error::RepositoryError;
use stepwise_types::process::ProcessInstance;
use stepwise_types::task::{StatusFilter, Task, TaskField, TaskLink, TaskStatus};
use uuid::Uuid;

use super::process::ProcessRepository;

/// In-memory `ProcessRepository` for tests and single-process embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProcessRepository {
    processes: Arc<DashMap<Uuid, ProcessInstance>>,
    tasks: Arc<DashMap<Uuid, Task>>,
    /// Task ids per process, in insertion order.
    by_process: Arc<DashMap<Uuid, Vec<Uuid>>>,
    /// (process, join node) -> the single join task.
    join_keys: Arc<DashMap<(Uuid, String), Uuid>>,
    links: Arc<DashMap<Uuid, Vec<TaskLink>>>,
}

impl InMemoryProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored tasks across all processes.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn insert_task(&self, task: &Task) -> Result<(), RepositoryError> {
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => {
                return Err(RepositoryError::Conflict(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
            }
        }
        self.by_process
            .entry(task.process_id)
            .or_default()
            .push(task.id);
        Ok(())
    }

    fn link(&self, process_id: Uuid, parent_id: Uuid, child_id: Uuid) {
        let link = TaskLink {
            parent_id,
            child_id,
        };
        let mut links = self.links.entry(process_id).or_default();
        if !links.contains(&link) {
            links.push(link);
        }
    }

    fn process_tasks(&self, process_id: &Uuid) -> Vec<Task> {
        let ids = self
            .by_process
            .get(process_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut tasks: Vec<Task> = ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.clone()))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }
}

impl ProcessRepository for InMemoryProcessRepository {
    // -----------------------------------------------------------------------
    // Process instances
    // -----------------------------------------------------------------------

    async fn create_process(&self, process: &ProcessInstance) -> Result<(), RepositoryError> {
        match self.processes.entry(process.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "process {} already exists",
                process.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(process.clone());
                Ok(())
            }
        }
    }

    async fn get_process(&self, id: &Uuid) -> Result<Option<ProcessInstance>, RepositoryError> {
        Ok(self.processes.get(id).map(|p| p.clone()))
    }

    async fn list_processes(
        &self,
        definition: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ProcessInstance>, RepositoryError> {
        let mut processes: Vec<ProcessInstance> = self
            .processes
            .iter()
            .filter(|p| definition.is_none_or(|d| p.definition == d))
            .map(|p| p.clone())
            .collect();
        processes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        processes.truncate(limit as usize);
        Ok(processes)
    }

    async fn touch_process(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut process = self.processes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if at > process.modified_at {
            process.modified_at = at;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    async fn create_task(&self, task: &Task, parents: &[Uuid]) -> Result<(), RepositoryError> {
        self.insert_task(task)?;
        for parent in parents {
            self.link(task.process_id, *parent, task.id);
        }
        Ok(())
    }

    async fn get_or_create_task(
        &self,
        task: &Task,
        parent: Option<&Uuid>,
    ) -> Result<(Task, bool), RepositoryError> {
        let key = (task.process_id, task.node_name.clone());
        let (survivor, created) = match self.join_keys.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let found = self
                    .tasks
                    .get(&id)
                    .map(|t| t.clone())
                    .ok_or(RepositoryError::NotFound)?;
                (found, false)
            }
            Entry::Vacant(slot) => {
                self.insert_task(task)?;
                slot.insert(task.id);
                (task.clone(), true)
            }
        };
        if let Some(parent) = parent {
            self.link(survivor.process_id, *parent, survivor.id);
        }
        Ok((survivor, created))
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn update_task(
        &self,
        task: &Task,
        fields: &[TaskField],
    ) -> Result<DateTime<Utc>, RepositoryError> {
        let mut stored = self.tasks.get_mut(&task.id).ok_or(RepositoryError::NotFound)?;
        if fields.contains(&TaskField::Status) && stored.status != TaskStatus::Scheduled {
            return Err(RepositoryError::Conflict(format!(
                "task {} is already {}",
                task.id, stored.status
            )));
        }
        for field in fields {
            match field {
                TaskField::Status => stored.status = task.status,
                TaskField::Completed => stored.completed = task.completed,
                TaskField::CompletedAt => stored.completed_at = task.completed_at,
                TaskField::CompletedBy => stored.completed_by = task.completed_by.clone(),
                TaskField::ErrorType => stored.error_type = task.error_type.clone(),
                TaskField::ErrorMessage => stored.error_message = task.error_message.clone(),
                TaskField::Stacktrace => stored.stacktrace = task.stacktrace.clone(),
            }
        }
        stored.modified_at = task
            .modified_at
            .max(stored.modified_at + Duration::microseconds(1));
        Ok(stored.modified_at)
    }

    async fn list_tasks(
        &self,
        process_id: &Uuid,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks = self.process_tasks(process_id);
        if let Some(filter) = filter {
            tasks.retain(|t| filter.matches(t.status));
        }
        Ok(tasks)
    }

    async fn find_tasks(
        &self,
        process_id: &Uuid,
        node_name: &str,
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks = self.process_tasks(process_id);
        tasks.retain(|t| t.node_name == node_name);
        Ok(tasks)
    }

    async fn latest_task(&self, process_id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.process_tasks(process_id).pop())
    }

    async fn cancel_scheduled_tasks(
        &self,
        process_id: &Uuid,
        completed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let ids = self
            .by_process
            .get(process_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut canceled = Vec::new();
        for id in ids {
            let Some(mut task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Scheduled {
                continue;
            }
            task.status = TaskStatus::Canceled;
            task.completed = true;
            task.completed_at = Some(at);
            task.completed_by = completed_by.map(str::to_string);
            if at > task.modified_at {
                task.modified_at = at;
            }
            canceled.push(task.clone());
        }
        Ok(canceled)
    }

    // -----------------------------------------------------------------------
    // Lineage
    // -----------------------------------------------------------------------

    async fn list_task_links(&self, process_id: &Uuid) -> Result<Vec<TaskLink>, RepositoryError> {
        Ok(self
            .links
            .get(process_id)
            .map(|links| links.clone())
            .unwrap_or_default())
    }
}
