//! Orphan recovery.
//!
//! Runs once at startup and then periodically: a `running` task with no
//! live workflow driving it is requeued as `pending` (the work is not lost,
//! only its tracking was), and an agent stuck `running` with no live
//! workflow is reset to `idle`. Liveness comes from the cancel registry —
//! every executing workflow holds an entry there for its whole run.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{EventHub, HubEvent};
use crate::model::{AgentStatus, TaskStatus, TenantStatus};
use crate::queue::QueueRegistry;
use crate::store::{Store, StoreRegistry};
use crate::workflow::CancelRegistry;

pub struct Recovery {
    canonical: Arc<dyn Store>,
    stores: Arc<StoreRegistry>,
    queues: Arc<QueueRegistry>,
    cancels: CancelRegistry,
    hub: EventHub,
}

impl Recovery {
    pub fn new(
        canonical: Arc<dyn Store>,
        stores: Arc<StoreRegistry>,
        queues: Arc<QueueRegistry>,
        cancels: CancelRegistry,
        hub: EventHub,
    ) -> Self {
        Self {
            canonical,
            stores,
            queues,
            cancels,
            hub,
        }
    }

    /// Reconcile every active tenant. Returns how many tasks and agents
    /// were reset.
    pub async fn sweep(&self) -> u64 {
        let tenants = match self.canonical.list_tenants(TenantStatus::Active).await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "Recovery sweep failed to list tenants");
                return 0;
            }
        };

        let mut reconciled = 0;
        for tenant in tenants {
            let store = match self.stores.store_for(&tenant.schema_name).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(tenant = %tenant.schema_name, error = %e, "Recovery sweep skipping tenant");
                    continue;
                }
            };
            reconciled += self.requeue_orphaned_tasks(&tenant.schema_name, &store).await;
            self.admit_pending_tasks(&tenant.schema_name, &store).await;
            reconciled += self.reset_stuck_agents(&tenant.schema_name, &store).await;
        }

        if reconciled > 0 {
            info!(count = reconciled, "Recovery sweep reconciled orphans");
        }
        reconciled
    }

    async fn requeue_orphaned_tasks(&self, tenant: &str, store: &Arc<dyn Store>) -> u64 {
        let running = match store.list_tasks_by_status(TaskStatus::Running).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Failed to list running tasks");
                return 0;
            }
        };

        let mut requeued = 0;
        for task in running {
            if self.cancels.is_live(task.id) {
                continue;
            }

            // No workflow is driving this task; put it back in line.
            if let Err(e) = store.set_task_status(task.id, TaskStatus::Pending, None).await {
                warn!(task_id = %task.id, error = %e, "Failed to re-pend orphaned task");
                continue;
            }
            if let Err(e) = store.clear_steps(task.id).await {
                warn!(task_id = %task.id, error = %e, "Failed to clear orphaned task journal");
            }
            self.hub.publish(HubEvent::TaskStatusChanged {
                task_id: task.id,
                tenant: tenant.to_string(),
                status: TaskStatus::Pending,
            });
            self.queues
                .enqueue(tenant, &task.assignee, task.id, task.priority)
                .await;
            info!(tenant = %tenant, task_id = %task.id, agent = %task.assignee, "Orphaned task requeued");
            requeued += 1;
        }
        requeued
    }

    /// Make sure every pending task sits in its agent's queue. The in-memory
    /// queues are empty after a restart; admission is idempotent, so this is
    /// a no-op for tasks already waiting.
    async fn admit_pending_tasks(&self, tenant: &str, store: &Arc<dyn Store>) {
        let pending = match store.list_tasks_by_status(TaskStatus::Pending).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Failed to list pending tasks");
                return;
            }
        };
        for task in pending {
            self.queues
                .enqueue(tenant, &task.assignee, task.id, task.priority)
                .await;
        }
    }

    async fn reset_stuck_agents(&self, tenant: &str, store: &Arc<dyn Store>) -> u64 {
        let agents = match store.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Failed to list agents");
                return 0;
            }
        };

        let mut reset = 0;
        for agent in agents {
            if agent.status != AgentStatus::Running {
                continue;
            }
            let live = agent
                .current_task_id
                .map(|id| self.cancels.is_live(id))
                .unwrap_or(false);
            if live {
                continue;
            }

            if let Err(e) = store
                .set_agent_state(&agent.name, AgentStatus::Idle, None)
                .await
            {
                warn!(tenant = %tenant, agent = %agent.name, error = %e, "Failed to reset stuck agent");
                continue;
            }
            self.hub.publish(HubEvent::AgentStatusChanged {
                agent: agent.name.clone(),
                tenant: tenant.to_string(),
                status: AgentStatus::Idle,
            });
            info!(tenant = %tenant, agent = %agent.name, "Stuck agent reset to idle");
            reset += 1;
        }
        reset
    }
}

/// Spawn the periodic recovery loop. The first tick fires immediately, so
/// this doubles as the startup reset.
pub fn spawn_recovery_loop(recovery: Arc<Recovery>, config: &Config) -> JoinHandle<()> {
    let interval = config.recovery_interval;
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Recovery sweep started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            recovery.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, Task, Tenant};
    use crate::store::LibSqlStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct InertRunner;

    #[async_trait]
    impl crate::queue::TaskRunner for InertRunner {
        async fn run(&self, _tenant: &str, _agent: &str, _task_id: Uuid) {
            std::future::pending::<()>().await;
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        recovery: Recovery,
        cancels: CancelRegistry,
        store: Arc<dyn Store>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let canonical: Arc<dyn Store> = Arc::new(
            LibSqlStore::open(&dir.path().join("canonical.db"))
                .await
                .unwrap(),
        );
        let store: Arc<dyn Store> = Arc::new(
            LibSqlStore::open(&dir.path().join("tenant_acme.db"))
                .await
                .unwrap(),
        );
        let mut tenant = Tenant::from_name("acme");
        tenant.status = TenantStatus::Active;
        canonical.create_tenant(&tenant).await.unwrap();

        let stores = Arc::new(StoreRegistry::new(dir.path().to_path_buf()));
        let hub = EventHub::new();
        let cancels = CancelRegistry::new();
        let queues = Arc::new(QueueRegistry::new(
            Arc::clone(&stores),
            Arc::new(InertRunner),
            cancels.clone(),
            hub.clone(),
            3,
        ));
        Fixture {
            _dir: dir,
            recovery: Recovery::new(canonical, stores, queues, cancels.clone(), hub),
            cancels,
            store,
        }
    }

    #[tokio::test]
    async fn orphaned_running_task_is_requeued() {
        let fx = fixture().await;
        let agent = Agent::new("sable", "Sable", std::env::temp_dir());
        fx.store.create_agent(&agent).await.unwrap();
        let task = Task::new("sable", "was in flight", 0);
        fx.store.create_task(&task).await.unwrap();
        fx.store.mark_task_running(task.id).await.unwrap();
        fx.store
            .set_agent_state("sable", AgentStatus::Running, Some(task.id))
            .await
            .unwrap();
        fx.store.record_step(task.id, "mark_running").await.unwrap();

        // Task re-pended + agent reset
        assert_eq!(fx.recovery.sweep().await, 2);

        let loaded = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(fx.store.last_step(task.id).await.unwrap().is_none());
        let agent = fx.store.get_agent("sable").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task_id.is_none());
    }

    #[tokio::test]
    async fn live_workflow_is_left_alone() {
        let fx = fixture().await;
        let agent = Agent::new("sable", "Sable", std::env::temp_dir());
        fx.store.create_agent(&agent).await.unwrap();
        let task = Task::new("sable", "actively running", 0);
        fx.store.create_task(&task).await.unwrap();
        fx.store.mark_task_running(task.id).await.unwrap();
        fx.store
            .set_agent_state("sable", AgentStatus::Running, Some(task.id))
            .await
            .unwrap();

        // A registered cancel channel marks the workflow as live
        let _rx = fx.cancels.register(task.id);

        assert_eq!(fx.recovery.sweep().await, 0);
        let loaded = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn idle_state_needs_no_reconciliation() {
        let fx = fixture().await;
        let agent = Agent::new("sable", "Sable", std::env::temp_dir());
        fx.store.create_agent(&agent).await.unwrap();
        let task = Task::new("sable", "completed earlier", 0);
        fx.store.create_task(&task).await.unwrap();
        fx.store
            .set_task_status(task.id, TaskStatus::Completed, Some("done"))
            .await
            .unwrap();

        assert_eq!(fx.recovery.sweep().await, 0);
    }
}
