//! Task execution workflow.
//!
//! Drives one picked-up task through load → mark_running → invoke →
//! finalize → reset_agent, journaling each completed step. The invoke step
//! is never retried and never re-run on resume; a conversation that was
//! interrupted finalizes as failed instead of silently running again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::WorkflowError;
use crate::events::{EventHub, HubEvent};
use crate::model::{Agent, AgentStatus, Task, TaskStatus};
use crate::queue::TaskRunner;
use crate::runtime::{
    AgentEvent, AgentRuntime, Invocation, InvocationResult, ResultOutcome, ToolServerHandle,
};
use crate::store::{Store, StoreRegistry};

use super::{CancelRegistry, FOLLOW_UP_MARKER, retry_step};

/// Journal step names in execution order.
const STEPS: &[&str] = &["load", "mark_running", "invoke", "finalize"];

/// 1-based position of a step; 0 for an unknown (or absent) journal entry.
fn step_index(name: &str) -> usize {
    STEPS
        .iter()
        .position(|s| *s == name)
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Where a running workflow currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Load,
    MarkRunning,
    Invoke,
    Finalize,
    ResetAgent,
    Done,
}

/// Live status of one task workflow, observable through a watch receiver.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub status: TaskStatus,
    pub phase: WorkflowPhase,
    /// Runtime events relayed so far in the invoke phase.
    pub events_relayed: u64,
}

/// Executes tasks popped from the agent queues.
pub struct TaskWorkflow {
    stores: Arc<StoreRegistry>,
    runtime: Arc<dyn AgentRuntime>,
    cancels: CancelRegistry,
    hub: EventHub,
    config: Config,
    statuses: Mutex<HashMap<Uuid, watch::Receiver<WorkflowStatus>>>,
}

impl TaskWorkflow {
    pub fn new(
        stores: Arc<StoreRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        cancels: CancelRegistry,
        hub: EventHub,
        config: Config,
    ) -> Self {
        Self {
            stores,
            runtime,
            cancels,
            hub,
            config,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Watch the live status of a task's workflow, if one is running.
    pub fn status_of(&self, task_id: Uuid) -> Option<watch::Receiver<WorkflowStatus>> {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&task_id)
            .cloned()
    }

    async fn execute(
        &self,
        tenant: &str,
        agent_name: &str,
        task_id: Uuid,
    ) -> Result<(), WorkflowError> {
        let attempts = self.config.step_max_attempts;
        let backoff = self.config.step_backoff;

        let store = retry_step("open_store", attempts, backoff, || {
            self.stores.store_for(tenant)
        })
        .await?;

        let mut cancel_rx = self.cancels.register(task_id);
        let (status_tx, status_rx) = watch::channel(WorkflowStatus {
            status: TaskStatus::Pending,
            phase: WorkflowPhase::Load,
            events_relayed: 0,
        });
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id, status_rx);

        let outcome = self
            .run_steps(tenant, agent_name, task_id, &store, &mut cancel_rx, &status_tx)
            .await;

        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_id);
        self.cancels.unregister(task_id);
        outcome
    }

    async fn run_steps(
        &self,
        tenant: &str,
        agent_name: &str,
        task_id: Uuid,
        store: &Arc<dyn Store>,
        cancel_rx: &mut watch::Receiver<bool>,
        status_tx: &watch::Sender<WorkflowStatus>,
    ) -> Result<(), WorkflowError> {
        let attempts = self.config.step_max_attempts;
        let backoff = self.config.step_backoff;

        // Journal position from a previous interrupted run, if any.
        let resume_idx = retry_step("read_journal", attempts, backoff, || {
            store.last_step(task_id)
        })
        .await?
        .as_deref()
        .map(step_index)
        .unwrap_or(0);
        if resume_idx > 0 {
            info!(task_id = %task_id, resume_idx, "Resuming task workflow from journal");
        }

        // Step: load. Reads always happen (later steps need the rows); only
        // the journal write is skipped on resume.
        let task = retry_step("load", attempts, backoff, || store.get_task(task_id))
            .await?
            .ok_or(WorkflowError::TaskNotFound(task_id))?;
        let agent = retry_step("load", attempts, backoff, || store.get_agent(agent_name))
            .await?
            .ok_or_else(|| WorkflowError::AgentNotFound(agent_name.to_string()))?;
        if resume_idx < step_index("load") {
            retry_step("journal", attempts, backoff, || {
                store.record_step(task_id, "load")
            })
            .await?;
        }

        // Step: mark_running.
        if resume_idx < step_index("mark_running") {
            if !task.status.can_transition_to(TaskStatus::Running) {
                return Err(WorkflowError::InvalidTransition {
                    id: task_id,
                    from: task.status.to_string(),
                    to: TaskStatus::Running.to_string(),
                });
            }
            status_tx.send_modify(|s| s.phase = WorkflowPhase::MarkRunning);
            retry_step("mark_running", attempts, backoff, || {
                store.mark_task_running(task_id)
            })
            .await?;
            retry_step("mark_running", attempts, backoff, || {
                store.set_agent_state(agent_name, AgentStatus::Running, Some(task_id))
            })
            .await?;
            self.hub.publish(HubEvent::TaskStatusChanged {
                task_id,
                tenant: tenant.to_string(),
                status: TaskStatus::Running,
            });
            self.hub.publish(HubEvent::AgentStatusChanged {
                agent: agent_name.to_string(),
                tenant: tenant.to_string(),
                status: AgentStatus::Running,
            });
            retry_step("journal", attempts, backoff, || {
                store.record_step(task_id, "mark_running")
            })
            .await?;
            info!(task_id = %task_id, agent = %agent_name, "Task running");
        }
        status_tx.send_modify(|s| {
            s.status = TaskStatus::Running;
            s.phase = WorkflowPhase::Invoke;
        });

        // Step: invoke.
        let mut cancelled = false;
        let result = if resume_idx >= step_index("mark_running") {
            // The previous run got at least as far as starting the
            // invocation; its outcome is unknown and must not re-run.
            warn!(task_id = %task_id, "Invocation was interrupted, finalizing as failed");
            InvocationResult::failure("interrupted before the invocation finished")
        } else if *cancel_rx.borrow() {
            cancelled = true;
            InvocationResult::failure("cancelled")
        } else {
            self.invoke(tenant, &task, &agent, cancel_rx, status_tx, &mut cancelled)
                .await
        };
        if resume_idx < step_index("invoke") {
            retry_step("journal", attempts, backoff, || {
                store.record_step(task_id, "invoke")
            })
            .await?;
        }

        // Step: finalize.
        if resume_idx < step_index("finalize") {
            status_tx.send_modify(|s| s.phase = WorkflowPhase::Finalize);
            retry_step("finalize", attempts, backoff, || {
                store.update_task_metrics(
                    task_id,
                    result.cost_usd,
                    result.duration_ms,
                    result.num_turns,
                )
            })
            .await?;

            let (final_status, result_text) = final_disposition(cancelled, &result);
            let applied = retry_step("finalize", attempts, backoff, || {
                store.finalize_task_if_running(task_id, final_status, &result_text)
            })
            .await?;
            if applied {
                self.hub.publish(HubEvent::TaskStatusChanged {
                    task_id,
                    tenant: tenant.to_string(),
                    status: final_status,
                });
                info!(
                    task_id = %task_id,
                    agent = %agent_name,
                    status = %final_status,
                    cost_usd = result.cost_usd,
                    num_turns = result.num_turns,
                    "Task finalized"
                );
            } else {
                // Another path (cancel, recovery) advanced the task first.
                debug!(task_id = %task_id, "Finalize skipped, status already advanced");
            }
            status_tx.send_modify(|s| s.status = final_status);
            retry_step("journal", attempts, backoff, || {
                store.record_step(task_id, "finalize")
            })
            .await?;
        }

        // Step: reset_agent. Clearing the journal is its completion record.
        status_tx.send_modify(|s| s.phase = WorkflowPhase::ResetAgent);
        retry_step("reset_agent", attempts, backoff, || {
            store.set_agent_state(agent_name, AgentStatus::Idle, None)
        })
        .await?;
        self.hub.publish(HubEvent::AgentStatusChanged {
            agent: agent_name.to_string(),
            tenant: tenant.to_string(),
            status: AgentStatus::Idle,
        });
        retry_step("journal", attempts, backoff, || store.clear_steps(task_id)).await?;
        status_tx.send_modify(|s| s.phase = WorkflowPhase::Done);

        Ok(())
    }

    /// Drive the runtime adapter, relaying every event live. Returns the
    /// terminal result, synthesizing a failure when the stream ends without
    /// one or when a cancel signal arrives mid-invoke.
    async fn invoke(
        &self,
        tenant: &str,
        task: &Task,
        agent: &Agent,
        cancel_rx: &mut watch::Receiver<bool>,
        status_tx: &watch::Sender<WorkflowStatus>,
        cancelled: &mut bool,
    ) -> InvocationResult {
        let prompt = if task.context.is_empty() {
            task.prompt.clone()
        } else {
            format!("{}\n\nContext:\n{}", task.prompt, task.context)
        };
        let inv = Invocation {
            agent: agent.name.clone(),
            task_id: task.id,
            prompt,
            system_prompt: format!(
                "You are {} ({}), an autonomous agent. Work inside your workspace directory. \
                 End your final message with \"{FOLLOW_UP_MARKER}\" if the task needs another \
                 session to finish.",
                agent.display_name, agent.name
            ),
            cwd: agent.workspace.clone(),
            tool_server: ToolServerHandle::default(),
            model: self.config.default_model.clone(),
        };

        let mut stream = self.runtime.invoke(inv);
        let mut final_result = None;

        loop {
            tokio::select! {
                _ = wait_for_cancel(cancel_rx) => {
                    info!(task_id = %task.id, "Cancel received mid-invoke, abandoning stream");
                    *cancelled = true;
                    break;
                }
                event = stream.next() => {
                    let Some(event) = event else { break };
                    status_tx.send_modify(|s| s.events_relayed += 1);
                    let terminal = match &event {
                        AgentEvent::Result { result } => {
                            final_result = Some(result.clone());
                            true
                        }
                        _ => false,
                    };
                    self.hub.publish(HubEvent::AgentActivity {
                        task_id: task.id,
                        tenant: tenant.to_string(),
                        agent: agent.name.clone(),
                        event,
                    });
                    if terminal {
                        break;
                    }
                }
            }
        }
        // Dropping the stream tears the backing process/engine down.
        drop(stream);

        if *cancelled {
            InvocationResult::failure("cancelled")
        } else {
            final_result.unwrap_or_else(|| {
                InvocationResult::failure("stream ended without a result event")
            })
        }
    }
}

/// Pends until a cancel signal arrives; never resolves otherwise.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender lives in the registry until the run ends, so this only
            // happens in teardown races. Stop watching instead of spinning.
            std::future::pending::<()>().await;
        }
    }
}

/// Map an invocation result to the task's next status and result text.
fn final_disposition(cancelled: bool, result: &InvocationResult) -> (TaskStatus, String) {
    if cancelled {
        return (TaskStatus::Failed, "cancelled".to_string());
    }
    let output = if result.output.is_empty() {
        "(no output)".to_string()
    } else {
        result.output.clone()
    };
    match result.outcome {
        ResultOutcome::Success if output.contains(FOLLOW_UP_MARKER) => {
            (TaskStatus::Pending, output)
        }
        ResultOutcome::Success => (TaskStatus::Completed, output),
        ResultOutcome::MaxTurns => (
            TaskStatus::Failed,
            format!("Hit the turn limit before finishing. Last output: {output}"),
        ),
        ResultOutcome::Error => (TaskStatus::Failed, output),
    }
}

#[async_trait]
impl TaskRunner for TaskWorkflow {
    async fn run(&self, tenant: &str, agent: &str, task_id: Uuid) {
        if let Err(e) = self.execute(tenant, agent, task_id).await {
            warn!(tenant = %tenant, agent = %agent, task_id = %task_id, error = %e, "Task workflow failed");
        }
    }
}
