//! End-to-end scheduler flows: provision → enqueue → execute → finalize,
//! cancellation, priority ordering, and the nudge sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use agency::config::Config;
use agency::events::{EventHub, HubEvent};
use agency::model::{Agent, AgentStatus, Task, TaskStatus};
use agency::nudge::Nudger;
use agency::queue::{QueueRegistry, TaskRunner};
use agency::runtime::{
    AgentEvent, AgentRuntime, EventStream, Invocation, InvocationResult, ResultOutcome,
};
use agency::store::{Store, StoreRegistry};
use agency::tenant::SchemaProvisioner;
use agency::workflow::{CancelRegistry, TaskWorkflow};
use agency::workspace::WorkspaceManager;

/// Runtime that emits a success result after an optional delay, recording
/// the order in which tasks were invoked.
struct ScriptedRuntime {
    delay: Duration,
    calls: AtomicUsize,
    invoked: std::sync::Mutex<Vec<Uuid>>,
}

impl ScriptedRuntime {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            invoked: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn invoke(&self, inv: Invocation) -> EventStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invoked.lock().unwrap().push(inv.task_id);
        let delay = self.delay;
        Box::pin(async_stream::stream! {
            tokio::time::sleep(delay).await;
            yield AgentEvent::Message { content: "on it".into() };
            yield AgentEvent::Result {
                result: InvocationResult {
                    output: "all done".into(),
                    cost_usd: 0.05,
                    duration_ms: 800,
                    num_turns: 3,
                    outcome: ResultOutcome::Success,
                },
            };
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    stores: Arc<StoreRegistry>,
    queues: Arc<QueueRegistry>,
    hub: EventHub,
    runtime: Arc<ScriptedRuntime>,
    tenant_schema: String,
    store: Arc<dyn Store>,
}

fn config_retries() -> u32 {
    Config::default().max_task_retries
}

async fn harness(delay: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let canonical: Arc<dyn Store> = Arc::new(
        agency::store::LibSqlStore::open(&dir.path().join("canonical.db"))
            .await
            .unwrap(),
    );
    let stores = Arc::new(StoreRegistry::new(dir.path().to_path_buf()));
    let provisioner =
        SchemaProvisioner::new(dir.path().to_path_buf(), Arc::clone(&canonical), Arc::clone(&stores));
    let tenant = provisioner.provision_tenant("Acme Corp").await.unwrap();
    let store = stores.store_for(&tenant.schema_name).await.unwrap();

    let hub = EventHub::new();
    let cancels = CancelRegistry::new();
    let runtime = Arc::new(ScriptedRuntime::new(delay));
    let config = Config {
        step_backoff: Duration::from_millis(1),
        ..Config::default()
    };
    let workflow = Arc::new(TaskWorkflow::new(
        Arc::clone(&stores),
        Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
        cancels.clone(),
        hub.clone(),
        config,
    ));
    let queues = Arc::new(QueueRegistry::new(
        Arc::clone(&stores),
        workflow as Arc<dyn TaskRunner>,
        cancels,
        hub.clone(),
        config_retries(),
    ));

    Harness {
        _dir: dir,
        stores,
        queues,
        hub,
        runtime,
        tenant_schema: tenant.schema_name,
        store,
    }
}

async fn create_agent(h: &Harness, name: &str) -> Agent {
    let workspaces = WorkspaceManager::new(h._dir.path().join("workspaces"));
    let workspace = workspaces.ensure(&h.tenant_schema, name).unwrap();
    let agent = Agent::new(name, name.to_uppercase(), workspace);
    h.store.create_agent(&agent).await.unwrap();
    agent
}

async fn wait_for_status(store: &Arc<dyn Store>, task_id: Uuid, status: TaskStatus) {
    for _ in 0..500 {
        let task = store.get_task(task_id).await.unwrap().unwrap();
        if task.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task never reached {status}");
}

#[tokio::test]
async fn task_flows_from_provision_to_completion() {
    let h = harness(Duration::ZERO).await;
    create_agent(&h, "sable").await;
    let mut rx = h.hub.subscribe();

    let task = Task::new("sable", "write the quarterly report", 0);
    h.store.create_task(&task).await.unwrap();
    assert!(
        h.queues
            .enqueue(&h.tenant_schema, "sable", task.id, task.priority)
            .await
    );

    wait_for_status(&h.store, task.id, TaskStatus::Completed).await;

    let done = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(done.result.as_deref(), Some("all done"));
    assert_eq!(done.num_turns, 3);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());

    let agent = h.store.get_agent("sable").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(agent.current_task_id.is_none());

    // Journal cleared after the run
    assert!(h.store.last_step(task.id).await.unwrap().is_none());

    // Status events arrive in lifecycle order, with activity in between
    let mut saw = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            HubEvent::TaskStatusChanged { status, .. } => saw.push(format!("task:{status}")),
            HubEvent::AgentStatusChanged { status, .. } => saw.push(format!("agent:{status}")),
            HubEvent::AgentActivity { .. } => saw.push("activity".into()),
            _ => {}
        }
    }
    assert_eq!(
        saw,
        vec![
            "task:running",
            "agent:running",
            "activity",
            "activity",
            "task:completed",
            "agent:idle"
        ]
    );

    h.queues.shutdown().await;
}

#[tokio::test]
async fn cancel_before_pickup_never_invokes_the_adapter() {
    let h = harness(Duration::ZERO).await;
    create_agent(&h, "sable").await;

    let task = Task::new("sable", "never mind", 0);
    h.store.create_task(&task).await.unwrap();

    // Cancelled while still pending, before any queue admission
    assert!(h.queues.cancel(&h.tenant_schema, task.id).await.unwrap());

    // A later (stale) admission is skipped by pickup re-validation
    h.queues
        .enqueue(&h.tenant_schema, "sable", task.id, task.priority)
        .await;

    // Drive a live task through to prove the consumer processed the queue
    let live = Task::new("sable", "real work", 0);
    h.store.create_task(&live).await.unwrap();
    h.queues
        .enqueue(&h.tenant_schema, "sable", live.id, live.priority)
        .await;
    wait_for_status(&h.store, live.id, TaskStatus::Completed).await;

    let cancelled = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.status.is_terminal());
    // The adapter ran exactly once, for the live task only
    assert_eq!(h.runtime.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.invoked.lock().unwrap().as_slice(), &[live.id]);

    h.queues.shutdown().await;
}

#[tokio::test]
async fn lower_priority_value_runs_first() {
    let h = harness(Duration::from_millis(300)).await;
    create_agent(&h, "sable").await;

    // Occupy the consumer so later admissions pile up in the heap
    let blocker = Task::new("sable", "warm-up", 0);
    h.store.create_task(&blocker).await.unwrap();
    h.queues
        .enqueue(&h.tenant_schema, "sable", blocker.id, 0)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // T1 admitted first but T2 carries the lower priority value
    let t1 = Task::new("sable", "routine cleanup", 0);
    let t2 = Task::new("sable", "urgent fix", -1);
    h.store.create_task(&t1).await.unwrap();
    h.store.create_task(&t2).await.unwrap();
    h.queues.enqueue(&h.tenant_schema, "sable", t1.id, 0).await;
    h.queues.enqueue(&h.tenant_schema, "sable", t2.id, -1).await;

    wait_for_status(&h.store, t1.id, TaskStatus::Completed).await;
    wait_for_status(&h.store, t2.id, TaskStatus::Completed).await;

    let invoked = h.runtime.invoked.lock().unwrap().clone();
    assert_eq!(invoked, vec![blocker.id, t2.id, t1.id]);

    h.queues.shutdown().await;
}

#[tokio::test]
async fn at_most_one_task_runs_per_agent() {
    let h = harness(Duration::from_millis(40)).await;
    create_agent(&h, "sable").await;

    let mut ids = Vec::new();
    for i in 0..4 {
        let task = Task::new("sable", format!("job {i}"), 0);
        h.store.create_task(&task).await.unwrap();
        ids.push(task.id);
    }

    // Admit everything concurrently
    let mut admissions = Vec::new();
    for id in &ids {
        let queues = Arc::clone(&h.queues);
        let tenant = h.tenant_schema.clone();
        let id = *id;
        admissions.push(tokio::spawn(async move {
            queues.enqueue(&tenant, "sable", id, 0).await
        }));
    }
    for admission in admissions {
        admission.await.unwrap();
    }

    // The invariant holds at every observation until the backlog drains
    let mut done = false;
    for _ in 0..1000 {
        let running = h
            .store
            .count_tasks("sable", TaskStatus::Running)
            .await
            .unwrap();
        assert!(running <= 1, "agent ran {running} tasks at once");
        let completed = h
            .store
            .count_tasks("sable", TaskStatus::Completed)
            .await
            .unwrap();
        if completed == ids.len() as u64 {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(done, "backlog never drained");
    assert_eq!(h.runtime.calls.load(Ordering::SeqCst), ids.len());

    h.queues.shutdown().await;
}

#[tokio::test]
async fn duplicate_enqueue_runs_once() {
    let h = harness(Duration::from_millis(100)).await;
    create_agent(&h, "sable").await;

    let task = Task::new("sable", "only once", 0);
    h.store.create_task(&task).await.unwrap();

    for _ in 0..5 {
        h.queues
            .enqueue(&h.tenant_schema, "sable", task.id, 0)
            .await;
    }
    wait_for_status(&h.store, task.id, TaskStatus::Completed).await;
    // Give a stale duplicate time to surface if one slipped through
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(h.runtime.calls.load(Ordering::SeqCst), 1);
    h.queues.shutdown().await;
}

/// Runner that never finishes, keeping picked-up tasks out of terminal
/// states for the duration of a test.
struct InertRunner;

#[async_trait]
impl TaskRunner for InertRunner {
    async fn run(&self, _tenant: &str, _agent: &str, _task_id: Uuid) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn agent_with_backlog_is_nudged_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let canonical: Arc<dyn Store> = Arc::new(
        agency::store::LibSqlStore::open(&dir.path().join("canonical.db"))
            .await
            .unwrap(),
    );
    let stores = Arc::new(StoreRegistry::new(dir.path().to_path_buf()));
    let provisioner =
        SchemaProvisioner::new(dir.path().to_path_buf(), Arc::clone(&canonical), Arc::clone(&stores));
    let tenant = provisioner.provision_tenant("Nudge Co").await.unwrap();
    let store = stores.store_for(&tenant.schema_name).await.unwrap();

    let hub = EventHub::new();
    let queues = Arc::new(QueueRegistry::new(
        Arc::clone(&stores),
        Arc::new(InertRunner),
        CancelRegistry::new(),
        hub.clone(),
        config_retries(),
    ));
    let nudger = Nudger::new(canonical, Arc::clone(&stores), queues, hub);

    let agent = Agent::new("yuki", "Yuki", std::env::temp_dir());
    store.create_agent(&agent).await.unwrap();
    for i in 0..3 {
        store
            .create_task(&Task::new("yuki", format!("backlog item {i}"), 0))
            .await
            .unwrap();
    }

    assert_eq!(nudger.sweep().await, 1);
    let nudge = store.find_pending_nudge("yuki").await.unwrap().unwrap();
    assert!(nudge.prompt.contains("3 pending tasks"));
    assert!(nudge.is_nudge());

    // No state changed, so the sweep is a no-op the second time
    assert_eq!(nudger.sweep().await, 0);
}
