//! Scheduler and join coordinator.
//!
//! Advances a process instance: starts it at an entry node, turns each
//! succeeded task into the tasks of its next nodes, cancels instances, and
//! applies manual overrides. Join nodes go through the repository's atomic
//! get-or-create so concurrent branches converge on a single task; every
//! other node gets a fresh task per arrival. Newly created `Machine` tasks are
//! handed to the `TaskDispatcher`; `Human` tasks wait for their view.

use std::sync::Arc;

use stepwise_types::error::{GraphError, RepositoryError};
use stepwise_types::process::{NodeHandler, ProcessInstance};
use stepwise_types::task::{
    Actor, ErrorInfo, StatusFilter, Task, TaskStatus, timestamp_now,
};
use thiserror::Error;
use uuid::Uuid;

use crate::process::definition::DefinitionRegistry;
use crate::process::graph::{Node, ProcessGraph};
use crate::process::projector::{GraphView, project_definition, project_instance};
use crate::repository::ProcessRepository;
use crate::task::{TaskError, TaskService};

use super::dispatcher::{DispatchError, MachineJob, TaskDispatcher};

/// Reserved node name recording a manual override in a process's history.
pub const MANUAL_OVERRIDE_NODE: &str = "manual_override";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown process definition '{0}'")]
    UnknownDefinition(String),

    #[error("process {0} not found")]
    ProcessNotFound(Uuid),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {task_id} is {status}; only succeeded tasks start next tasks")]
    NotSucceeded { task_id: Uuid, status: TaskStatus },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Generic over `R: ProcessRepository` for storage and `D: TaskDispatcher`
/// for the machine-task hand-off.
pub struct Scheduler<R: ProcessRepository, D: TaskDispatcher> {
    repo: Arc<R>,
    tasks: TaskService<R>,
    dispatcher: D,
    definitions: Arc<DefinitionRegistry>,
}

impl<R: ProcessRepository, D: TaskDispatcher> Scheduler<R, D> {
    pub fn new(repo: Arc<R>, dispatcher: D, definitions: Arc<DefinitionRegistry>) -> Self {
        Self {
            tasks: TaskService::new(Arc::clone(&repo)),
            repo,
            dispatcher,
            definitions,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn tasks(&self) -> &TaskService<R> {
        &self.tasks
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// The graph registered under `name`.
    pub fn definition(&self, name: &str) -> Result<Arc<ProcessGraph>, SchedulerError> {
        self.definitions
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownDefinition(name.to_string()))
    }

    /// A process instance together with its definition graph.
    pub async fn process(
        &self,
        process_id: Uuid,
    ) -> Result<(ProcessInstance, Arc<ProcessGraph>), SchedulerError> {
        let process = self
            .repo
            .get_process(&process_id)
            .await?
            .ok_or(SchedulerError::ProcessNotFound(process_id))?;
        let graph = self.definition(&process.definition)?;
        Ok((process, graph))
    }

    // -----------------------------------------------------------------------
    // Advancing
    // -----------------------------------------------------------------------

    /// Create a process instance with one `Scheduled` task at `entry_node`.
    #[tracing::instrument(skip(self, actor), fields(user = ?actor.and_then(Actor::authenticated_id)))]
    pub async fn start_process(
        &self,
        definition: &str,
        entry_node: &str,
        actor: Option<&Actor>,
    ) -> Result<(ProcessInstance, Task), SchedulerError> {
        let graph = self.definition(definition)?;
        let node = graph.get_node(entry_node)?;

        let process = ProcessInstance::new(definition);
        self.repo.create_process(&process).await?;

        let (task, _) = self.create_at(node, process.id, None).await?;
        self.dispatch(node, &task);

        tracing::info!(process_id = %process.id, task_id = %task.id, "process started");
        Ok((process, task))
    }

    /// Turn a succeeded task into the tasks of its next nodes.
    ///
    /// Candidates are the graph's declared successors of the task's node, or
    /// `next_nodes` verbatim when given. Results are in candidate order; a
    /// join node yields the existing task if another branch created it first.
    ///
    /// Non-join candidates get a new task on every call, so callers invoke
    /// this once per successful completion.
    #[tracing::instrument(skip_all, fields(process_id = %finished.process_id, task_id = %finished.id, node = %finished.node_name))]
    pub async fn start_next_tasks(
        &self,
        finished: &Task,
        next_nodes: Option<&[&str]>,
    ) -> Result<Vec<Task>, SchedulerError> {
        if finished.status != TaskStatus::Succeeded {
            return Err(SchedulerError::NotSucceeded {
                task_id: finished.id,
                status: finished.status,
            });
        }
        let (process, graph) = self.process(finished.process_id).await?;

        let candidates: Vec<&Node> = match next_nodes {
            None => graph.get_next_nodes(&finished.node_name)?,
            Some(names) => names
                .iter()
                .map(|name| graph.get_node(name))
                .collect::<Result<_, _>>()?,
        };

        let mut created = Vec::with_capacity(candidates.len());
        for node in &candidates {
            created.push(self.create_at(node, process.id, Some(&finished.id)).await?);
        }

        // Tasks are stored before any hand-off so a failed dispatch never
        // leaves later candidates uncreated.
        let mut results = Vec::with_capacity(created.len());
        for (node, (task, fresh)) in candidates.into_iter().zip(created) {
            if fresh {
                tracing::debug!(next_task = %task.id, next_node = node.name(), "task scheduled");
                self.dispatch(node, &task);
            } else {
                tracing::debug!(next_task = %task.id, next_node = node.name(), "join task reused");
            }
            results.push(task);
        }

        self.repo.touch_process(&process.id, timestamp_now()).await?;
        Ok(results)
    }

    /// Finish a task on behalf of an external actor, then start its next tasks.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        actor: Option<&Actor>,
        next_nodes: Option<&[&str]>,
    ) -> Result<Vec<Task>, SchedulerError> {
        let mut task = self.load_task(task_id).await?;
        self.tasks.finish(&mut task, actor).await?;
        self.start_next_tasks(&task, next_nodes).await
    }

    /// Mark a task failed with the captured error.
    pub async fn fail_task(&self, task_id: Uuid, error: &ErrorInfo) -> Result<Task, SchedulerError> {
        let mut task = self.load_task(task_id).await?;
        self.tasks.fail(&mut task, error).await?;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Cancellation and overrides
    // -----------------------------------------------------------------------

    /// Cancel every task of the instance that is still `Scheduled`.
    ///
    /// Tasks that finish concurrently are left as they are.
    #[tracing::instrument(skip(self, actor))]
    pub async fn cancel_process(
        &self,
        process_id: Uuid,
        actor: Option<&Actor>,
    ) -> Result<Vec<Task>, SchedulerError> {
        let (process, _) = self.process(process_id).await?;
        let now = timestamp_now();
        let canceled = self
            .repo
            .cancel_scheduled_tasks(&process.id, actor.and_then(Actor::authenticated_id), now)
            .await?;
        self.repo.touch_process(&process.id, now).await?;

        tracing::info!(canceled = canceled.len(), "process canceled");
        Ok(canceled)
    }

    /// Replace the instance's pending work with tasks at `next_nodes`.
    ///
    /// Cancels the scheduled tasks, records a succeeded task at
    /// [`MANUAL_OVERRIDE_NODE`] linked to them (or to the latest task when
    /// nothing was pending), and starts `next_nodes` from it. Every name is
    /// checked against the graph before anything is changed.
    #[tracing::instrument(skip(self, actor))]
    pub async fn manual_override(
        &self,
        process_id: Uuid,
        next_nodes: &[&str],
        actor: Option<&Actor>,
    ) -> Result<Vec<Task>, SchedulerError> {
        let (_, graph) = self.process(process_id).await?;
        for name in next_nodes {
            graph.get_node(name)?;
        }

        let canceled = self.cancel_process(process_id, actor).await?;
        let parents: Vec<Uuid> = if canceled.is_empty() {
            self.repo
                .latest_task(&process_id)
                .await?
                .map(|task| vec![task.id])
                .unwrap_or_default()
        } else {
            canceled.iter().map(|task| task.id).collect()
        };

        let mut marker = Task::new(process_id, MANUAL_OVERRIDE_NODE);
        marker.status = TaskStatus::Succeeded;
        marker.completed = true;
        marker.completed_at = Some(marker.created_at);
        marker.completed_by = actor.and_then(Actor::authenticated_id).map(str::to_string);
        self.repo.create_task(&marker, &parents).await?;

        tracing::info!(override_task = %marker.id, ?next_nodes, "manual override applied");
        self.start_next_tasks(&marker, Some(next_nodes)).await
    }

    /// Hand every `Scheduled` machine task of the instance to the dispatcher
    /// again, e.g. after a restart or a failed hand-off. Returns the tasks
    /// dispatched.
    ///
    /// Workers skip jobs whose task already left `Scheduled`, so a task that
    /// is still queued elsewhere runs at most once.
    #[tracing::instrument(skip(self))]
    pub async fn redispatch_scheduled(&self, process_id: Uuid) -> Result<Vec<Task>, SchedulerError> {
        let (process, graph) = self.process(process_id).await?;
        let scheduled = self
            .repo
            .list_tasks(&process.id, Some(StatusFilter::Scheduled))
            .await?;

        let mut dispatched = Vec::new();
        for task in scheduled {
            let Ok(node) = graph.get_node(&task.node_name) else {
                continue;
            };
            if let Some(job) = machine_job(node, &task) {
                self.dispatcher.dispatch(job)?;
                dispatched.push(task);
            }
        }

        tracing::info!(dispatched = dispatched.len(), "scheduled machine tasks redispatched");
        Ok(dispatched)
    }

    /// [`redispatch_scheduled`](Self::redispatch_scheduled) across the
    /// `limit` most recent process instances; meant for worker startup.
    pub async fn redispatch_recent(&self, limit: u32) -> Result<usize, SchedulerError> {
        let mut total = 0;
        for process in self.repo.list_processes(None, limit).await? {
            match self.redispatch_scheduled(process.id).await {
                Ok(tasks) => total += tasks.len(),
                Err(SchedulerError::UnknownDefinition(name)) => {
                    tracing::warn!(process_id = %process.id, definition = %name, "skipping process with unregistered definition");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn list_tasks(
        &self,
        process_id: Uuid,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.repo.list_tasks(&process_id, filter).await?)
    }

    pub async fn latest_task(&self, process_id: Uuid) -> Result<Option<Task>, SchedulerError> {
        Ok(self.repo.latest_task(&process_id).await?)
    }

    /// Static view of a registered definition.
    pub fn definition_graph(&self, name: &str) -> Result<GraphView, SchedulerError> {
        let graph = self.definition(name)?;
        Ok(project_definition(&graph))
    }

    /// Definition view overlaid with the instance's tasks and lineage.
    pub async fn instance_graph(&self, process_id: Uuid) -> Result<GraphView, SchedulerError> {
        let (process, graph) = self.process(process_id).await?;
        let tasks = self.repo.list_tasks(&process.id, None).await?;
        let links = self.repo.list_task_links(&process.id).await?;
        Ok(project_instance(&graph, process.id, &tasks, &links))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load_task(&self, task_id: Uuid) -> Result<Task, SchedulerError> {
        self.repo
            .get_task(&task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }

    /// Store a new task at `node`. Join nodes go through get-or-create, so
    /// the flag is false when another arrival created the task first.
    async fn create_at(
        &self,
        node: &Node,
        process_id: Uuid,
        parent: Option<&Uuid>,
    ) -> Result<(Task, bool), SchedulerError> {
        let candidate = Task::new(process_id, node.name());
        if node.is_join() {
            return Ok(self.repo.get_or_create_task(&candidate, parent).await?);
        }
        let parents: Vec<Uuid> = parent.copied().into_iter().collect();
        self.repo.create_task(&candidate, &parents).await?;
        Ok((candidate, true))
    }

    /// Hand a stored machine task to the dispatcher. The stored task stays
    /// `Scheduled` on failure and is picked up by `redispatch_scheduled`.
    fn dispatch(&self, node: &Node, task: &Task) {
        let Some(job) = machine_job(node, task) else {
            return;
        };
        if let Err(e) = self.dispatcher.dispatch(job) {
            tracing::warn!(task_id = %task.id, node = node.name(), error = %e, "machine task not dispatched");
        }
    }
}

fn machine_job(node: &Node, task: &Task) -> Option<MachineJob> {
    match node.handler() {
        NodeHandler::Machine { callable } => Some(MachineJob {
            task_id: task.id,
            process_id: task.process_id,
            node_name: task.node_name.clone(),
            callable: callable.clone(),
        }),
        NodeHandler::Human { .. } => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
