//! Per-(tenant, agent) serialized work queues.
//!
//! Each (tenant namespace, agent name) key owns one consumer task, so an
//! agent never runs two tasks at once while different agents run fully in
//! parallel. Items pop lowest priority first, FIFO within a priority.
//!
//! Pickup is re-validated against the store: anything no longer `pending`
//! for this agent is silently skipped. Admission is idempotent — a task id
//! already waiting in a queue is not admitted twice.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventHub, HubEvent};
use crate::model::TaskStatus;
use crate::store::StoreRegistry;
use crate::workflow::CancelRegistry;

/// Executes one picked-up task to its next stable state. Implemented by the
/// task execution workflow; test doubles script their own behavior.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, tenant: &str, agent: &str, task_id: Uuid);
}

/// Heap entry. Ordered so that `BinaryHeap::pop` yields the lowest priority
/// first and, within a priority, the earliest admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueItem {
    priority: i64,
    seq: u64,
    task_id: Uuid,
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueItem>,
    /// Task ids currently waiting in the heap. Guards duplicate admission;
    /// ids leave the set on pop, so re-admission after pickup is allowed
    /// (retry, follow-up) and pickup re-validation guards correctness.
    waiting: HashSet<Uuid>,
    next_seq: u64,
}

/// One agent's queue: heap + wakeup for its single consumer.
struct AgentQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl AgentQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                waiting: HashSet::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Admit a task. Returns false when the id is already waiting.
    async fn push(&self, task_id: Uuid, priority: i64) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.waiting.insert(task_id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueItem {
            priority,
            seq,
            task_id,
        });
        drop(inner);
        self.notify.notify_one();
        true
    }

    async fn pop(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock().await;
        let item = inner.heap.pop()?;
        inner.waiting.remove(&item.task_id);
        Some(item)
    }
}

struct QueueHandle {
    queue: Arc<AgentQueue>,
    consumer: JoinHandle<()>,
}

/// All agent queues, keyed by (tenant namespace, agent name). Owned by the
/// composition root.
pub struct QueueRegistry {
    stores: Arc<StoreRegistry>,
    runner: Arc<dyn TaskRunner>,
    cancels: CancelRegistry,
    hub: EventHub,
    max_task_retries: u32,
    queues: Mutex<HashMap<(String, String), QueueHandle>>,
}

impl QueueRegistry {
    pub fn new(
        stores: Arc<StoreRegistry>,
        runner: Arc<dyn TaskRunner>,
        cancels: CancelRegistry,
        hub: EventHub,
        max_task_retries: u32,
    ) -> Self {
        Self {
            stores,
            runner,
            cancels,
            hub,
            max_task_retries,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a task into its agent's queue, spawning the consumer on first
    /// use of the key. Returns false when the id was already waiting.
    pub async fn enqueue(&self, tenant: &str, agent: &str, task_id: Uuid, priority: i64) -> bool {
        let queue = self.queue_for(tenant, agent).await;
        let admitted = queue.push(task_id, priority).await;
        if admitted {
            debug!(tenant = %tenant, agent = %agent, task_id = %task_id, priority, "Task enqueued");
        } else {
            debug!(tenant = %tenant, agent = %agent, task_id = %task_id, "Duplicate enqueue ignored");
        }
        admitted
    }

    /// Cancel a task wherever it currently is.
    ///
    /// A task with a live workflow gets the cancel signal (the workflow
    /// finalizes it). A still-pending task is finalized directly; pickup
    /// re-validation will skip its queue entry. Returns whether anything
    /// was cancelled.
    pub async fn cancel(&self, tenant: &str, task_id: Uuid) -> Result<bool> {
        if self.cancels.cancel(task_id) {
            info!(tenant = %tenant, task_id = %task_id, "Cancel signal sent to running workflow");
            return Ok(true);
        }

        let store = self.stores.store_for(tenant).await?;
        match store.get_task(task_id).await? {
            Some(task) if task.status == TaskStatus::Pending => {
                store
                    .set_task_status(task_id, TaskStatus::Cancelled, Some("cancelled"))
                    .await?;
                self.hub.publish(HubEvent::TaskStatusChanged {
                    task_id,
                    tenant: tenant.to_string(),
                    status: TaskStatus::Cancelled,
                });
                info!(tenant = %tenant, task_id = %task_id, "Pending task cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Re-admit a failed task, consuming one retry.
    ///
    /// Returns false when the task does not exist, is not `failed`, or its
    /// retry budget is exhausted (it stays permanently failed).
    pub async fn retry(&self, tenant: &str, task_id: Uuid) -> Result<bool> {
        let store = self.stores.store_for(tenant).await?;
        let Some(task) = store.get_task(task_id).await? else {
            return Ok(false);
        };
        if !store.retry_task(task_id, self.max_task_retries).await? {
            debug!(tenant = %tenant, task_id = %task_id, "Retry refused, task not failed or budget spent");
            return Ok(false);
        }
        self.hub.publish(HubEvent::TaskStatusChanged {
            task_id,
            tenant: tenant.to_string(),
            status: TaskStatus::Pending,
        });
        self.enqueue(tenant, &task.assignee, task_id, task.priority)
            .await;
        info!(tenant = %tenant, task_id = %task_id, "Failed task re-admitted for retry");
        Ok(true)
    }

    /// Stop all consumers. In-flight runner calls are aborted.
    pub async fn shutdown(&self) {
        let mut queues = self.queues.lock().await;
        for ((tenant, agent), handle) in queues.drain() {
            handle.consumer.abort();
            debug!(tenant = %tenant, agent = %agent, "Queue consumer stopped");
        }
    }

    async fn queue_for(&self, tenant: &str, agent: &str) -> Arc<AgentQueue> {
        let key = (tenant.to_string(), agent.to_string());
        let mut queues = self.queues.lock().await;
        if let Some(handle) = queues.get(&key) {
            return Arc::clone(&handle.queue);
        }

        let queue = Arc::new(AgentQueue::new());
        let consumer = tokio::spawn(run_consumer(
            tenant.to_string(),
            agent.to_string(),
            Arc::clone(&queue),
            Arc::clone(&self.stores),
            Arc::clone(&self.runner),
        ));
        queues.insert(
            key,
            QueueHandle {
                queue: Arc::clone(&queue),
                consumer,
            },
        );
        info!(tenant = %tenant, agent = %agent, "Queue consumer started");
        queue
    }
}

/// Single consumer for one (tenant, agent) key. Pops, re-validates, runs.
async fn run_consumer(
    tenant: String,
    agent: String,
    queue: Arc<AgentQueue>,
    stores: Arc<StoreRegistry>,
    runner: Arc<dyn TaskRunner>,
) {
    loop {
        let Some(item) = queue.pop().await else {
            // notify_one stores a permit, so a push racing this await
            // still wakes us.
            queue.notify.notified().await;
            continue;
        };

        let store = match stores.store_for(&tenant).await {
            Ok(store) => store,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Namespace store unavailable, dropping queue entry");
                continue;
            }
        };

        // Pickup re-validation: only a still-pending task assigned to this
        // agent actually runs. Everything else was overtaken (cancelled,
        // reassigned, already ran) and is skipped without error.
        let task = match store.get_task(item.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(tenant = %tenant, task_id = %item.task_id, "Queued task no longer exists, skipping");
                continue;
            }
            Err(e) => {
                warn!(tenant = %tenant, task_id = %item.task_id, error = %e, "Pickup validation failed, skipping");
                continue;
            }
        };
        if task.status != TaskStatus::Pending || task.assignee != agent {
            debug!(
                tenant = %tenant,
                task_id = %item.task_id,
                status = %task.status,
                assignee = %task.assignee,
                "Stale queue entry, skipping"
            );
            continue;
        }

        runner.run(&tenant, &agent, item.task_id).await;

        // A task the workflow re-pended (follow-up work) re-enters this
        // same queue under its id.
        match store.get_task(item.task_id).await {
            Ok(Some(after)) if after.status == TaskStatus::Pending => {
                debug!(tenant = %tenant, task_id = %item.task_id, "Task re-pended, re-admitting");
                queue.push(item.task_id, after.priority).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(tenant = %tenant, task_id = %item.task_id, error = %e, "Post-run status check failed");
            }
        }
    }
}
