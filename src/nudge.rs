//! Idle-agent nudger.
//!
//! Periodic sweep over every agent in every active tenant: an idle agent
//! with pending tasks or unread messages gets a single low-priority nudge
//! task naming its exact backlog. Busy agents are skipped (their backlog
//! drains on its own), and a pending nudge already in the queue blocks a
//! second one, so repeated sweeps never pile nudges up.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{EventHub, HubEvent};
use crate::model::{Agent, AgentStatus, NUDGE_CONTEXT_PREFIX, Task, TaskStatus};
use crate::queue::QueueRegistry;
use crate::store::{Store, StoreRegistry};

/// Nudge tasks run after everything an operator queued.
const NUDGE_PRIORITY: i64 = -1;

pub struct Nudger {
    canonical: Arc<dyn Store>,
    stores: Arc<StoreRegistry>,
    queues: Arc<QueueRegistry>,
    hub: EventHub,
}

impl Nudger {
    pub fn new(
        canonical: Arc<dyn Store>,
        stores: Arc<StoreRegistry>,
        queues: Arc<QueueRegistry>,
        hub: EventHub,
    ) -> Self {
        Self {
            canonical,
            stores,
            queues,
            hub,
        }
    }

    /// One sweep over all agents of all active tenants. Returns how many
    /// nudges were created.
    pub async fn sweep(&self) -> u64 {
        let tenants = match self
            .canonical
            .list_tenants(crate::model::TenantStatus::Active)
            .await
        {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "Nudge sweep failed to list tenants");
                return 0;
            }
        };

        let mut created = 0;
        for tenant in tenants {
            let store = match self.stores.store_for(&tenant.schema_name).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(tenant = %tenant.schema_name, error = %e, "Nudge sweep skipping tenant");
                    continue;
                }
            };
            let agents = match store.list_agents().await {
                Ok(agents) => agents,
                Err(e) => {
                    warn!(tenant = %tenant.schema_name, error = %e, "Nudge sweep failed to list agents");
                    continue;
                }
            };
            for agent in agents {
                if self.nudge_agent(&tenant.schema_name, &store, &agent).await {
                    created += 1;
                }
            }
        }

        if created > 0 {
            info!(count = created, "Nudge sweep created tasks");
        }
        created
    }

    async fn nudge_agent(&self, tenant: &str, store: &Arc<dyn Store>, agent: &Agent) -> bool {
        // Only idle agents need a push; a busy agent is already working
        // through its backlog.
        if agent.status != AgentStatus::Idle {
            debug!(tenant = %tenant, agent = %agent.name, status = %agent.status, "Agent busy, skipping nudge");
            return false;
        }

        let counts = async {
            let pending = store.count_tasks(&agent.name, TaskStatus::Pending).await?;
            let unread = store.unread_count(&agent.name).await?;
            let existing = store.find_pending_nudge(&agent.name).await?;
            Ok::<_, crate::error::DatabaseError>((pending, unread, existing))
        };
        let (pending, unread, existing) = match counts.await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(tenant = %tenant, agent = %agent.name, error = %e, "Nudge check failed");
                return false;
            }
        };

        if pending == 0 && unread == 0 {
            return false;
        }
        if existing.is_some() {
            debug!(tenant = %tenant, agent = %agent.name, "Nudge already pending, skipping");
            return false;
        }

        let task = Task::new(&agent.name, nudge_prompt(pending, unread), NUDGE_PRIORITY)
            .with_context(format!(
                "{NUDGE_CONTEXT_PREFIX} Auto-generated reminder for an agent with a backlog."
            ));
        if let Err(e) = store.create_task(&task).await {
            warn!(tenant = %tenant, agent = %agent.name, error = %e, "Failed to create nudge task");
            return false;
        }
        self.hub.publish(HubEvent::TaskCreated {
            task_id: task.id,
            tenant: tenant.to_string(),
            assignee: agent.name.clone(),
            delegator_id: None,
        });
        self.queues
            .enqueue(tenant, &agent.name, task.id, task.priority)
            .await;
        info!(tenant = %tenant, agent = %agent.name, pending, unread, "Agent nudged");
        true
    }
}

fn nudge_prompt(pending: u64, unread: u64) -> String {
    let mut parts = Vec::new();
    if pending > 0 {
        parts.push(format!(
            "{pending} pending task{}",
            if pending == 1 { "" } else { "s" }
        ));
    }
    if unread > 0 {
        parts.push(format!(
            "{unread} unread message{}",
            if unread == 1 { "" } else { "s" }
        ));
    }
    format!(
        "You have {} waiting for your attention. Review your backlog and work through it.",
        parts.join(" and ")
    )
}

/// Spawn the periodic nudge loop. Returns None when nudging is disabled.
pub fn spawn_nudge_loop(nudger: Arc<Nudger>, config: &Config) -> Option<JoinHandle<()>> {
    if !config.nudge_enabled {
        info!("Nudge sweep disabled");
        return None;
    }
    let interval = config.nudge_interval;
    Some(tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Nudge sweep started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            nudger.sweep().await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Tenant, TenantStatus};
    use crate::store::LibSqlStore;
    use crate::workflow::CancelRegistry;
    use async_trait::async_trait;
    use uuid::Uuid;

    /// Runner that never finishes, so picked-up tasks stay pending.
    struct InertRunner;

    #[async_trait]
    impl crate::queue::TaskRunner for InertRunner {
        async fn run(&self, _tenant: &str, _agent: &str, _task_id: Uuid) {
            std::future::pending::<()>().await;
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        nudger: Nudger,
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
        let queues = Arc::new(QueueRegistry::new(
            Arc::clone(&stores),
            Arc::new(InertRunner),
            CancelRegistry::new(),
            hub.clone(),
            3,
        ));
        Fixture {
            _dir: dir,
            nudger: Nudger::new(canonical, stores, queues, hub),
            store,
        }
    }

    #[tokio::test]
    async fn agent_with_backlog_gets_one_nudge() {
        let fx = fixture().await;
        let agent = Agent::new("yuki", "Yuki", std::env::temp_dir());
        fx.store.create_agent(&agent).await.unwrap();
        for i in 0..3 {
            fx.store
                .create_task(&Task::new("yuki", format!("task {i}"), 0))
                .await
                .unwrap();
        }
        fx.store
            .create_message(&Message::new(None, "yuki", "hi", "hello"))
            .await
            .unwrap();

        assert_eq!(fx.nudger.sweep().await, 1);

        let nudge = fx.store.find_pending_nudge("yuki").await.unwrap().unwrap();
        assert!(nudge.prompt.contains("3 pending tasks"));
        assert!(nudge.prompt.contains("1 unread message"));
        assert_eq!(nudge.priority, NUDGE_PRIORITY);
        assert!(nudge.is_nudge());

        // Idempotent: nothing changed, so a second sweep adds nothing
        assert_eq!(fx.nudger.sweep().await, 0);
    }

    #[tokio::test]
    async fn busy_agent_is_not_nudged() {
        let fx = fixture().await;
        let agent = Agent::new("yuki", "Yuki", std::env::temp_dir());
        fx.store.create_agent(&agent).await.unwrap();

        let in_flight = Task::new("yuki", "current work", 0);
        fx.store.create_task(&in_flight).await.unwrap();
        fx.store.mark_task_running(in_flight.id).await.unwrap();
        fx.store
            .set_agent_state("yuki", AgentStatus::Running, Some(in_flight.id))
            .await
            .unwrap();
        // Backlog exists, but the agent is mid-invocation
        fx.store
            .create_task(&Task::new("yuki", "waiting behind", 0))
            .await
            .unwrap();

        assert_eq!(fx.nudger.sweep().await, 0);
        assert!(fx.store.find_pending_nudge("yuki").await.unwrap().is_none());

        // Back to idle with the backlog still pending, the nudge lands
        fx.store
            .set_task_status(in_flight.id, TaskStatus::Completed, Some("done"))
            .await
            .unwrap();
        fx.store
            .set_agent_state("yuki", AgentStatus::Idle, None)
            .await
            .unwrap();
        assert_eq!(fx.nudger.sweep().await, 1);
    }

    #[tokio::test]
    async fn quiet_agent_is_left_alone() {
        let fx = fixture().await;
        let agent = Agent::new("sable", "Sable", std::env::temp_dir());
        fx.store.create_agent(&agent).await.unwrap();

        assert_eq!(fx.nudger.sweep().await, 0);
        assert!(fx.store.find_pending_nudge("sable").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_nudger_does_not_spawn() {
        let fx = fixture().await;
        let config = Config {
            nudge_enabled: false,
            ..Config::default()
        };
        assert!(spawn_nudge_loop(Arc::new(fx.nudger), &config).is_none());
    }

    #[test]
    fn prompt_names_exact_counts() {
        assert!(nudge_prompt(1, 0).contains("1 pending task waiting"));
        assert!(nudge_prompt(0, 2).contains("2 unread messages"));
        let both = nudge_prompt(3, 1);
        assert!(both.contains("3 pending tasks and 1 unread message"));
    }
}
