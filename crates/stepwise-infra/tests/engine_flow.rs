//! End-to-end runs of the scheduler and worker over the SQLite repository.

use std::sync::Arc;
use std::time::Duration;

use stepwise_core::engine::{
    ChannelDispatcher, HandlerError, HandlerRegistry, MANUAL_OVERRIDE_NODE, NextNodes, Scheduler,
    Worker,
};
use stepwise_core::process::{DefinitionRegistry, parse_definition_toml};
use stepwise_core::process::projector::VertexKind;
use stepwise_core::repository::ProcessRepository;
use stepwise_infra::sqlite::{DatabasePool, SqliteProcessRepository};
use stepwise_types::config::WorkerConfig;
use stepwise_types::task::{Actor, StatusFilter, Task, TaskStatus};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REVIEW: &str = r#"
name = "review"
edges = [
    ["start", "fetch"],
    ["fetch", "left"],
    ["fetch", "right"],
    ["left", "merge"],
    ["right", "merge"],
    ["merge", "approve"],
]

[[nodes]]
name = "start"
kind = "human"
view = "start_form"

[[nodes]]
name = "fetch"
kind = "machine"
callable = "fetch"

[[nodes]]
name = "left"
kind = "machine"
callable = "left"

[[nodes]]
name = "right"
kind = "machine"
callable = "right"

[[nodes]]
name = "merge"
kind = "machine"
callable = "merge"
join = true

[[nodes]]
name = "approve"
kind = "human"
view = "approve_form"
"#;

type Engine = Scheduler<SqliteProcessRepository, ChannelDispatcher>;

struct Harness {
    _dir: tempfile::TempDir,
    scheduler: Arc<Engine>,
    cancel: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(handlers: HandlerRegistry) -> Self {
        stepwise_observe::try_init_test_tracing();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("flow.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let repo = Arc::new(SqliteProcessRepository::new(pool));

        let mut definitions = DefinitionRegistry::new();
        definitions.register(parse_definition_toml(REVIEW).unwrap()).unwrap();

        let (dispatcher, jobs) = ChannelDispatcher::new();
        let scheduler = Arc::new(Scheduler::new(repo, dispatcher, Arc::new(definitions)));
        let config = WorkerConfig {
            concurrency: 4,
            max_attempts: 2,
            backoff_ms: 1,
        };
        let worker = Worker::new(Arc::clone(&scheduler), Arc::new(handlers), config);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = tokio::spawn(async move { worker.run(jobs, token).await });

        Self {
            _dir: dir,
            scheduler,
            cancel,
            worker,
        }
    }

    /// Poll until a task at `node` reaches `status`.
    async fn wait_for(&self, process_id: Uuid, node: &str, status: TaskStatus) -> Task {
        let repo = self.scheduler.repository();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let tasks = repo.find_tasks(&process_id, node).await.unwrap();
                if let Some(task) = tasks.into_iter().find(|t| t.status == status) {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {node} to be {status}"))
    }

    /// Poll until the instance has `count` lineage links.
    async fn wait_for_links(&self, process_id: Uuid, count: usize) {
        let repo = self.scheduler.repository();
        tokio::time::timeout(Duration::from_secs(10), async {
            while repo.list_task_links(&process_id).await.unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} links"));
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.worker.await.unwrap();
    }
}

fn declared_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for callable in ["fetch", "left", "right", "merge"] {
        handlers.register_fn(callable, |_task| async {
            Ok::<_, HandlerError>(NextNodes::Declared)
        });
    }
    handlers
}

async fn parse_count(_task: Task) -> Result<NextNodes, HandlerError> {
    let _count: i32 = "many".parse()?;
    Ok(NextNodes::Declared)
}

#[tokio::test]
async fn test_machine_chain_converges_on_one_join_task() {
    let harness = Harness::start(declared_handlers()).await;
    let scheduler = &harness.scheduler;

    let (process, start) = scheduler
        .start_process("review", "start", Some(&Actor::user("ada")))
        .await
        .unwrap();
    let next = scheduler
        .complete_task(start.id, Some(&Actor::user("ada")), None)
        .await
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].node_name, "fetch");

    let approve = harness
        .wait_for(process.id, "approve", TaskStatus::Scheduled)
        .await;
    harness.wait_for_links(process.id, 6).await;

    let merges = scheduler
        .repository()
        .find_tasks(&process.id, "merge")
        .await
        .unwrap();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].status, TaskStatus::Succeeded);

    let links = scheduler
        .repository()
        .list_task_links(&process.id)
        .await
        .unwrap();
    let into_merge = links.iter().filter(|l| l.child_id == merges[0].id).count();
    assert_eq!(into_merge, 2);

    let after = scheduler
        .complete_task(approve.id, Some(&Actor::user("grace")), None)
        .await
        .unwrap();
    assert!(after.is_empty());

    let approved = scheduler.repository().get_task(&approve.id).await.unwrap().unwrap();
    assert_eq!(approved.completed_by.as_deref(), Some("grace"));
    assert!(
        scheduler
            .list_tasks(process.id, Some(StatusFilter::NotSucceeded))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(scheduler.list_tasks(process.id, None).await.unwrap().len(), 6);

    harness.stop().await;
}

#[tokio::test]
async fn test_handler_error_is_recorded_on_task() {
    let mut handlers = declared_handlers();
    handlers.register_fn("fetch", parse_count);
    let harness = Harness::start(handlers).await;
    let scheduler = &harness.scheduler;

    let (process, start) = scheduler.start_process("review", "start", None).await.unwrap();
    scheduler.complete_task(start.id, None, None).await.unwrap();

    let failed = harness.wait_for(process.id, "fetch", TaskStatus::Failed).await;
    assert!(failed.completed);
    assert_eq!(failed.error_type.as_deref(), Some("ParseIntError"));
    assert_eq!(
        failed.exception().as_deref(),
        Some("ParseIntError: invalid digit found in string")
    );
    let trace = failed.stacktrace.unwrap();
    assert!(trace.ends_with("ParseIntError: invalid digit found in string\n"));

    let pending = scheduler
        .list_tasks(process.id, Some(StatusFilter::Scheduled))
        .await
        .unwrap();
    assert!(pending.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_manual_override_replaces_pending_work() {
    let harness = Harness::start(declared_handlers()).await;
    let scheduler = &harness.scheduler;

    let (process, start) = scheduler.start_process("review", "start", None).await.unwrap();
    let admin = Actor::user("admin");
    let next = scheduler
        .manual_override(process.id, &["approve"], Some(&admin))
        .await
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].node_name, "approve");

    let canceled = scheduler.repository().get_task(&start.id).await.unwrap().unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert_eq!(canceled.completed_by.as_deref(), Some("admin"));

    let markers = scheduler
        .repository()
        .find_tasks(&process.id, MANUAL_OVERRIDE_NODE)
        .await
        .unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].status, TaskStatus::Succeeded);

    let view = scheduler.instance_graph(process.id).await.unwrap();
    let marker = view
        .vertices
        .iter()
        .find(|v| v.name == MANUAL_OVERRIDE_NODE)
        .unwrap();
    assert_eq!(marker.kind, VertexKind::Override);
    assert!(view.to_dot().contains(MANUAL_OVERRIDE_NODE));

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_process_is_idempotent() {
    let harness = Harness::start(declared_handlers()).await;
    let scheduler = &harness.scheduler;

    let (process, _start) = scheduler.start_process("review", "start", None).await.unwrap();
    let canceled = scheduler.cancel_process(process.id, None).await.unwrap();
    assert_eq!(canceled.len(), 1);
    assert!(canceled[0].completed_by.is_none());

    let again = scheduler.cancel_process(process.id, None).await.unwrap();
    assert!(again.is_empty());

    let reloaded = scheduler.repository().get_process(&process.id).await.unwrap().unwrap();
    assert!(reloaded.modified_at >= process.modified_at);

    harness.stop().await;
}
