//! Machine-node worker.
//!
//! Pulls `MachineJob`s off the dispatcher channel and runs their handlers
//! concurrently, bounded by a semaphore. A handler that succeeds finishes its
//! task and starts the next tasks; one that keeps failing past
//! `max_attempts` fails the task with the captured `ErrorInfo`. Handler
//! errors never propagate out of the worker.

use std::sync::Arc;
use std::time::Duration;

use stepwise_types::config::WorkerConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::task::{ErrorInfo, Task, TaskStatus};
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::repository::ProcessRepository;
use crate::task::TaskError;

use super::dispatcher::{MachineJob, TaskDispatcher};
use super::handler::{HandlerError, HandlerRegistry, MachineHandlerDyn, NextNodes};
use super::scheduler::{Scheduler, SchedulerError};

/// What happened to one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Finished; carries the next tasks.
    Succeeded(Vec<Task>),
    /// Failed after the last attempt.
    Failed(ErrorInfo),
    /// The task had already left `Scheduled` when the job was picked up.
    Skipped(TaskStatus),
    /// The task left `Scheduled` while its handler ran; the result was dropped.
    Lost,
}

pub struct Worker<R: ProcessRepository, D: TaskDispatcher> {
    scheduler: Arc<Scheduler<R, D>>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl<R: ProcessRepository, D: TaskDispatcher> Clone for Worker<R, D> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            handlers: Arc::clone(&self.handlers),
            config: self.config.clone(),
        }
    }
}

impl<R: ProcessRepository + 'static, D: TaskDispatcher + 'static> Worker<R, D> {
    pub fn new(
        scheduler: Arc<Scheduler<R, D>>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            scheduler,
            handlers,
            config,
        }
    }

    /// Run jobs until the channel closes or `cancel` fires, then wait for the
    /// handlers already running.
    pub async fn run(&self, mut jobs: UnboundedReceiver<MachineJob>, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut running = JoinSet::new();
        tracing::info!(concurrency = self.config.concurrency, "worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "worker job panicked");
                    }
                }
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let worker = self.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        worker.handle(job).await;
                    });
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker job panicked");
            }
        }
        tracing::info!("worker stopped");
    }

    async fn handle(&self, job: MachineJob) {
        match self.execute(&job).await {
            Ok(JobOutcome::Succeeded(next)) => {
                tracing::debug!(task_id = %job.task_id, next = next.len(), "job succeeded");
            }
            Ok(JobOutcome::Failed(info)) => {
                tracing::warn!(task_id = %job.task_id, error = %info.summary(), "job failed");
            }
            Ok(JobOutcome::Skipped(status)) => {
                tracing::debug!(task_id = %job.task_id, %status, "job skipped");
            }
            Ok(JobOutcome::Lost) => {}
            Err(e) => {
                tracing::error!(task_id = %job.task_id, error = %e, "job could not be recorded");
            }
        }
    }

    /// Run one job to completion: handler attempts, then finish or fail.
    #[tracing::instrument(skip_all, fields(task_id = %job.task_id, node = %job.node_name))]
    pub async fn execute(&self, job: &MachineJob) -> Result<JobOutcome, SchedulerError> {
        let Some(mut task) = self.scheduler.repository().get_task(&job.task_id).await? else {
            return Err(SchedulerError::TaskNotFound(job.task_id));
        };
        if task.status != TaskStatus::Scheduled {
            return Ok(JobOutcome::Skipped(task.status));
        }

        let Some(handler) = self.handlers.get(&job.callable) else {
            let message = format!("no handler registered for '{}'", job.callable);
            let trace = format!("Trace (most recent call last):\nUnknownHandler: {message}\n");
            return self
                .record_failure(task, ErrorInfo::new("UnknownHandler", message, trace))
                .await;
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            match run_isolated(Arc::clone(&handler), task.clone()).await {
                Ok(next) => break Ok(next),
                Err(err) if attempt < max_attempts => {
                    tracing::warn!(attempt, error = %err, "handler failed, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;

                    match self.scheduler.repository().get_task(&task.id).await? {
                        Some(current) if current.status == TaskStatus::Scheduled => {}
                        Some(current) => return Ok(JobOutcome::Skipped(current.status)),
                        None => return Err(SchedulerError::TaskNotFound(task.id)),
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(next) => {
                match self.scheduler.tasks().finish(&mut task, None).await {
                    Ok(()) => {}
                    Err(TaskError::Repository(RepositoryError::Conflict(reason))) => {
                        tracing::warn!(%reason, "task left scheduled while its handler ran");
                        return Ok(JobOutcome::Lost);
                    }
                    Err(e) => return Err(e.into()),
                }
                let created = match next {
                    NextNodes::Declared => self.scheduler.start_next_tasks(&task, None).await?,
                    NextNodes::Explicit(names) => {
                        let names: Vec<&str> = names.iter().map(String::as_str).collect();
                        self.scheduler.start_next_tasks(&task, Some(&names)).await?
                    }
                };
                Ok(JobOutcome::Succeeded(created))
            }
            Err(err) => self.record_failure(task, err.to_error_info()).await,
        }
    }

    async fn record_failure(
        &self,
        mut task: Task,
        info: ErrorInfo,
    ) -> Result<JobOutcome, SchedulerError> {
        match self.scheduler.tasks().fail(&mut task, &info).await {
            Ok(()) => Ok(JobOutcome::Failed(info)),
            Err(TaskError::Repository(RepositoryError::Conflict(reason))) => {
                tracing::warn!(%reason, "task left scheduled before its failure was recorded");
                Ok(JobOutcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Linear backoff: attempt `n` waits `n * backoff_ms`.
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Run one handler invocation on its own task so a panic surfaces as a
/// handler error instead of unwinding through the worker.
async fn run_isolated(
    handler: Arc<dyn MachineHandlerDyn>,
    task: Task,
) -> Result<NextNodes, HandlerError> {
    match tokio::spawn(async move { handler.run_boxed(&task).await }).await {
        Ok(result) => result,
        Err(err) => Err(join_failure(err)),
    }
}

fn join_failure(err: JoinError) -> HandlerError {
    if err.is_cancelled() {
        return HandlerError::new("Cancelled", "handler task was cancelled");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    HandlerError::new("Panic", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stepwise_types::process::NodeSpec;
    use stepwise_types::task::Actor;

    use crate::engine::dispatcher::ChannelDispatcher;
    use crate::process::definition::DefinitionRegistry;
    use crate::process::graph::ProcessGraph;
    use crate::repository::InMemoryProcessRepository;

    type TestScheduler = Scheduler<InMemoryProcessRepository, ChannelDispatcher>;

    fn config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_attempts: 3,
            backoff_ms: 1,
        }
    }

    fn setup() -> (Arc<TestScheduler>, UnboundedReceiver<MachineJob>) {
        let mut registry = DefinitionRegistry::new();
        registry
            .register(
                ProcessGraph::builder("simple")
                    .node(NodeSpec::human("start", "start_form"))
                    .node(NodeSpec::machine("save_the_princess", "save_the_princess"))
                    .node(NodeSpec::machine("end", "end"))
                    .node(NodeSpec::human("review", "review_form"))
                    .edge("start", "save_the_princess")
                    .edge("save_the_princess", "end")
                    .edge("end", "review")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let (dispatcher, rx) = ChannelDispatcher::new();
        let scheduler = Scheduler::new(
            Arc::new(InMemoryProcessRepository::new()),
            dispatcher,
            Arc::new(registry),
        );
        (Arc::new(scheduler), rx)
    }

    /// Start the process and finish the human entry task; returns the first
    /// machine job.
    async fn first_job(
        scheduler: &TestScheduler,
        rx: &mut UnboundedReceiver<MachineJob>,
    ) -> MachineJob {
        let (_, start) = scheduler.start_process("simple", "start", None).await.unwrap();
        scheduler.complete_task(start.id, None, None).await.unwrap();
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_execute_success_starts_next() {
        let (scheduler, mut rx) = setup();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", |_task: Task| async {
            Ok::<_, HandlerError>(NextNodes::Declared)
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());

        let job = first_job(&scheduler, &mut rx).await;
        let outcome = worker.execute(&job).await.unwrap();
        let JobOutcome::Succeeded(next) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].node_name, "end");

        let task = scheduler.repository().get_task(&job.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(rx.try_recv().unwrap().node_name, "end");
    }

    #[tokio::test]
    async fn test_execute_explicit_next_nodes() {
        let (scheduler, mut rx) = setup();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", |_task: Task| async {
            Ok::<_, HandlerError>(NextNodes::Explicit(vec!["review".to_string()]))
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());

        let job = first_job(&scheduler, &mut rx).await;
        let JobOutcome::Succeeded(next) = worker.execute(&job).await.unwrap() else {
            panic!("expected success");
        };
        assert_eq!(next[0].node_name, "review");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let (scheduler, mut rx) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", move |_task: Task| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<NextNodes, _>(HandlerError::new("OSError", "nope"))
            }
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());

        let job = first_job(&scheduler, &mut rx).await;
        let outcome = worker.execute(&job).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let JobOutcome::Failed(info) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(info.summary(), "OSError: nope");

        let task = scheduler.repository().get_task(&job.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.exception().as_deref(), Some("OSError: nope"));
        let trace = task.stacktrace.unwrap();
        assert!(trace.contains(file!()));
        assert!(trace.ends_with("OSError: nope\n"));
    }

    fn fail_first_attempt(attempt: u32) -> Result<NextNodes, HandlerError> {
        if attempt == 0 {
            let n: u32 = "dragon".parse()?;
            return Ok(NextNodes::Explicit(vec![n.to_string()]));
        }
        Ok(NextNodes::Declared)
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let (scheduler, mut rx) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", move |_task: Task| {
            let counter = Arc::clone(&counter);
            async move { fail_first_attempt(counter.fetch_add(1, Ordering::SeqCst)) }
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());

        let job = first_job(&scheduler, &mut rx).await;
        assert!(matches!(
            worker.execute(&job).await.unwrap(),
            JobOutcome::Succeeded(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_task() {
        let (scheduler, mut rx) = setup();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", |_task: Task| async {
            if true {
                panic!("the dragon ate the princess");
            }
            Ok::<_, HandlerError>(NextNodes::Declared)
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());

        let job = first_job(&scheduler, &mut rx).await;
        let JobOutcome::Failed(info) = worker.execute(&job).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(info.summary(), "Panic: the dragon ate the princess");

        let task = scheduler.repository().get_task(&job.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed);
        assert!(task.stacktrace.unwrap().ends_with("Panic: the dragon ate the princess\n"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_task() {
        let (scheduler, mut rx) = setup();
        let worker = Worker::new(
            Arc::clone(&scheduler),
            Arc::new(HandlerRegistry::new()),
            config(),
        );

        let job = first_job(&scheduler, &mut rx).await;
        let JobOutcome::Failed(info) = worker.execute(&job).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(info.error_type, "UnknownHandler");
    }

    #[tokio::test]
    async fn test_canceled_task_is_skipped() {
        let (scheduler, mut rx) = setup();
        let worker = Worker::new(
            Arc::clone(&scheduler),
            Arc::new(HandlerRegistry::new()),
            config(),
        );

        let job = first_job(&scheduler, &mut rx).await;
        scheduler
            .cancel_process(job.process_id, Some(&Actor::user("spidy")))
            .await
            .unwrap();
        assert_eq!(
            worker.execute(&job).await.unwrap(),
            JobOutcome::Skipped(TaskStatus::Canceled)
        );
    }

    #[tokio::test]
    async fn test_cancel_during_handler_is_lost() {
        let (scheduler, mut rx) = setup();
        let cancel_from = Arc::clone(&scheduler);
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", move |task: Task| {
            let scheduler = Arc::clone(&cancel_from);
            async move {
                scheduler
                    .cancel_process(task.process_id, None)
                    .await
                    .map_err(|e| HandlerError::new("SchedulerError", e.to_string()))?;
                Ok::<_, HandlerError>(NextNodes::Declared)
            }
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());

        let job = first_job(&scheduler, &mut rx).await;
        assert_eq!(worker.execute(&job).await.unwrap(), JobOutcome::Lost);

        let task = scheduler.repository().get_task(&job.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(
            scheduler.repository().find_tasks(&job.process_id, "end").await.unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (scheduler, rx) = setup();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("save_the_princess", |_task: Task| async {
            Ok::<_, HandlerError>(NextNodes::Declared)
        });
        handlers.register_fn("end", |_task: Task| async {
            Ok::<_, HandlerError>(NextNodes::Declared)
        });
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config());
        let cancel = CancellationToken::new();
        let runner = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(rx, cancel).await }
        });

        let (process, start) = scheduler.start_process("simple", "start", None).await.unwrap();
        scheduler.complete_task(start.id, None, None).await.unwrap();

        let mut review = Vec::new();
        for _ in 0..200 {
            review = scheduler
                .repository()
                .find_tasks(&process.id, "review")
                .await
                .unwrap();
            if !review.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].status, TaskStatus::Scheduled);

        cancel.cancel();
        runner.await.unwrap();

        let succeeded = scheduler
            .list_tasks(process.id, Some(stepwise_types::task::StatusFilter::Succeeded))
            .await
            .unwrap();
        assert_eq!(succeeded.len(), 3);
    }
}
