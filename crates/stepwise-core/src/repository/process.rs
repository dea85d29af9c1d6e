//! Process and task repository trait definition.
//!
//! Defines the storage interface for process instances, their tasks, and the
//! lineage links between tasks. Beyond plain CRUD the store owns two
//! atomicity guarantees the scheduler depends on:
//!
//! - **Join get-or-create:** one task per (process, node) for join nodes, even
//!   under concurrent arrival. This must be a single idempotent operation, not
//!   a read followed by a create.
//! - **Guarded status writes:** an update that changes `status` only applies
//!   while the stored task is still `Scheduled`.

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::process::ProcessInstance;
use stepwise_types::task::{StatusFilter, Task, TaskField, TaskLink};
use uuid::Uuid;

/// Repository trait for process instance and task persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ProcessRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Process instances
    // -----------------------------------------------------------------------

    /// Insert a new process instance.
    fn create_process(
        &self,
        process: &ProcessInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a process instance by its UUID.
    fn get_process(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessInstance>, RepositoryError>> + Send;

    /// List process instances, newest first, optionally filtered by definition.
    fn list_processes(
        &self,
        definition: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessInstance>, RepositoryError>> + Send;

    /// Move a process's `modified_at` forward to `at` (never backwards).
    fn touch_process(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert a new task and link it to each of `parents`.
    fn create_task(
        &self,
        task: &Task,
        parents: &[Uuid],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically return the existing join task for `(task.process_id,
    /// task.node_name)` or insert `task` as that join task.
    ///
    /// `parent` is linked to whichever task survives. The returned flag is
    /// `true` when `task` was inserted.
    fn get_or_create_task(
        &self,
        task: &Task,
        parent: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<(Task, bool), RepositoryError>> + Send;

    /// Get a task by its UUID.
    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Write `modified_at` plus exactly the listed fields of `task`.
    ///
    /// The stored `modified_at` always moves strictly forward: it becomes
    /// `task.modified_at` or one microsecond past the stored value, whichever
    /// is later. Returns the timestamp written.
    ///
    /// Returns `NotFound` for an unknown task and `Conflict` when `fields`
    /// contains `Status` but the stored task already left `Scheduled`.
    fn update_task(
        &self,
        task: &Task,
        fields: &[TaskField],
    ) -> impl std::future::Future<Output = Result<DateTime<Utc>, RepositoryError>> + Send;

    /// Tasks of a process ordered by creation time, optionally filtered by status.
    fn list_tasks(
        &self,
        process_id: &Uuid,
        filter: Option<StatusFilter>,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Tasks of a process at one node, ordered by creation time.
    fn find_tasks(
        &self,
        process_id: &Uuid,
        node_name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// The most recently created task of a process.
    fn latest_task(
        &self,
        process_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Cancel every task of the process that is still `Scheduled`, in one
    /// conditional update, and return the tasks that were canceled.
    ///
    /// Tasks that leave `Scheduled` concurrently are skipped, not reported.
    fn cancel_scheduled_tasks(
        &self,
        process_id: &Uuid,
        completed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Lineage
    // -----------------------------------------------------------------------

    /// All parent -> child links between tasks of a process.
    fn list_task_links(
        &self,
        process_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskLink>, RepositoryError>> + Send;
}
