//! Per-agent lifecycle workflow.
//!
//! One long-lived loop per agent: it waits for inbound message signals (or
//! a periodic unread check) and turns each message into a pending task. The
//! inner loop restarts itself with fresh state after a bounded number of
//! turns; the supervisor respawns it carrying only the agent identity, so
//! no unbounded state accumulates across a long-lived agent.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{EventHub, HubEvent};
use crate::model::Task;
use crate::queue::QueueRegistry;
use crate::store::{Store, StoreRegistry};

/// Inbound notification that a message was addressed to this agent.
#[derive(Debug, Clone)]
pub struct MessageSignal {
    pub message_id: Uuid,
    pub from: Option<String>,
    pub subject: String,
}

/// What the lifecycle loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Started, nothing processed yet.
    Idle,
    /// Turning a message into a task.
    Working,
    /// Blocked on the next signal or tick.
    Waiting,
}

/// Live status of one agent's lifecycle loop.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub phase: LifecyclePhase,
    pub messages_processed: u64,
}

/// Handle to a spawned lifecycle loop.
pub struct LifecycleHandle {
    signals: mpsc::Sender<MessageSignal>,
    status: watch::Receiver<LifecycleStatus>,
    handle: JoinHandle<()>,
}

impl LifecycleHandle {
    /// Notify the loop of a new message. Fails only after shutdown.
    pub async fn signal(&self, signal: MessageSignal) -> bool {
        self.signals.send(signal).await.is_ok()
    }

    /// Observe the loop's live status.
    pub fn status(&self) -> watch::Receiver<LifecycleStatus> {
        self.status.clone()
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

enum LoopExit {
    /// Turn budget reached; respawn with fresh state.
    Restart,
    /// Signal channel closed; stop for good.
    Closed,
}

/// Spawn the supervised lifecycle loop for one agent.
pub fn spawn_lifecycle(
    tenant: String,
    agent: String,
    stores: Arc<StoreRegistry>,
    queues: Arc<QueueRegistry>,
    hub: EventHub,
    config: &Config,
) -> LifecycleHandle {
    let (signal_tx, signal_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(LifecycleStatus {
        phase: LifecyclePhase::Idle,
        messages_processed: 0,
    });
    let check_interval = config.lifecycle_check_interval;
    let max_iterations = config.lifecycle_max_iterations;

    let handle = tokio::spawn(supervise(
        tenant,
        agent,
        stores,
        queues,
        hub,
        check_interval,
        max_iterations,
        signal_rx,
        status_tx,
    ));

    LifecycleHandle {
        signals: signal_tx,
        status: status_rx,
        handle,
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    tenant: String,
    agent: String,
    stores: Arc<StoreRegistry>,
    queues: Arc<QueueRegistry>,
    hub: EventHub,
    check_interval: Duration,
    max_iterations: u32,
    mut signal_rx: mpsc::Receiver<MessageSignal>,
    status_tx: watch::Sender<LifecycleStatus>,
) {
    info!(tenant = %tenant, agent = %agent, "Lifecycle loop started");
    loop {
        let exit = run_agent_loop(
            &tenant,
            &agent,
            &stores,
            &queues,
            &hub,
            check_interval,
            max_iterations,
            &mut signal_rx,
            &status_tx,
        )
        .await;

        match exit {
            LoopExit::Restart => {
                // Fresh state; only the agent identity carries over.
                info!(tenant = %tenant, agent = %agent, "Lifecycle loop restarting after turn budget");
                status_tx.send_replace(LifecycleStatus {
                    phase: LifecyclePhase::Idle,
                    messages_processed: 0,
                });
            }
            LoopExit::Closed => {
                info!(tenant = %tenant, agent = %agent, "Lifecycle loop stopped");
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_agent_loop(
    tenant: &str,
    agent: &str,
    stores: &Arc<StoreRegistry>,
    queues: &Arc<QueueRegistry>,
    hub: &EventHub,
    check_interval: Duration,
    max_iterations: u32,
    signal_rx: &mut mpsc::Receiver<MessageSignal>,
    status_tx: &watch::Sender<LifecycleStatus>,
) -> LoopExit {
    let mut processed: u64 = 0;
    let mut iterations: u32 = 0;
    let mut tick = tokio::time::interval(check_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately: catch unread backlog from before the
    // loop existed.

    loop {
        tokio::select! {
            signal = signal_rx.recv() => {
                let Some(signal) = signal else {
                    return LoopExit::Closed;
                };
                status_tx.send_modify(|s| s.phase = LifecyclePhase::Working);
                if handle_signal(tenant, agent, stores, queues, hub, &signal).await {
                    processed += 1;
                }
            }
            _ = tick.tick() => {
                status_tx.send_modify(|s| s.phase = LifecyclePhase::Working);
                processed += drain_unread(tenant, agent, stores, queues, hub).await;
            }
        }

        iterations += 1;
        status_tx.send_replace(LifecycleStatus {
            phase: LifecyclePhase::Waiting,
            messages_processed: processed,
        });

        if iterations >= max_iterations {
            return LoopExit::Restart;
        }
    }
}

/// Turn one signaled message into a pending task. Returns whether a task
/// was created.
async fn handle_signal(
    tenant: &str,
    agent: &str,
    stores: &Arc<StoreRegistry>,
    queues: &Arc<QueueRegistry>,
    hub: &EventHub,
    signal: &MessageSignal,
) -> bool {
    let store = match stores.store_for(tenant).await {
        Ok(store) => store,
        Err(e) => {
            warn!(tenant = %tenant, agent = %agent, error = %e, "Lifecycle store unavailable");
            return false;
        }
    };

    let created = create_message_task(
        tenant,
        agent,
        &store,
        queues,
        hub,
        signal.from.as_deref(),
        &signal.subject,
    )
    .await;

    if created {
        if let Err(e) = store.mark_message_read(signal.message_id).await {
            warn!(message_id = %signal.message_id, error = %e, "Failed to mark message read");
        }
    }
    created
}

/// Periodic unread check: every unread message becomes a task. Returns how
/// many were processed.
async fn drain_unread(
    tenant: &str,
    agent: &str,
    stores: &Arc<StoreRegistry>,
    queues: &Arc<QueueRegistry>,
    hub: &EventHub,
) -> u64 {
    let store = match stores.store_for(tenant).await {
        Ok(store) => store,
        Err(e) => {
            warn!(tenant = %tenant, agent = %agent, error = %e, "Lifecycle store unavailable");
            return 0;
        }
    };

    let unread = match store.list_unread(agent).await {
        Ok(unread) => unread,
        Err(e) => {
            warn!(tenant = %tenant, agent = %agent, error = %e, "Unread check failed");
            return 0;
        }
    };
    if unread.is_empty() {
        return 0;
    }
    debug!(tenant = %tenant, agent = %agent, count = unread.len(), "Unread messages found");

    let mut processed = 0;
    for message in unread {
        let created = create_message_task(
            tenant,
            agent,
            &store,
            queues,
            hub,
            message.from_agent.as_deref(),
            &message.subject,
        )
        .await;
        if !created {
            continue;
        }
        if let Err(e) = store.mark_message_read(message.id).await {
            warn!(message_id = %message.id, error = %e, "Failed to mark message read");
        }
        processed += 1;
    }
    processed
}

async fn create_message_task(
    tenant: &str,
    agent: &str,
    store: &Arc<dyn Store>,
    queues: &Arc<QueueRegistry>,
    hub: &EventHub,
    from: Option<&str>,
    subject: &str,
) -> bool {
    let sender = from.unwrap_or("a human operator");
    let task = Task::new(
        agent,
        format!("Handle the message from {sender}: {subject}"),
        0,
    )
    .with_context(
        "Check your inbox for the full message body. Reply to the sender if a response \
         is expected.",
    );

    if let Err(e) = store.create_task(&task).await {
        warn!(tenant = %tenant, agent = %agent, error = %e, "Failed to create message task");
        return false;
    }
    hub.publish(HubEvent::TaskCreated {
        task_id: task.id,
        tenant: tenant.to_string(),
        assignee: agent.to_string(),
        delegator_id: None,
    });
    queues.enqueue(tenant, agent, task.id, task.priority).await;
    info!(tenant = %tenant, agent = %agent, task_id = %task.id, "Message task created");
    true
}
