//! Unified `Store` trait — single async interface for all persistence.
//!
//! One implementation handle exists per tenant namespace; the canonical
//! (control-plane) namespace additionally holds the tenant table.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Agent, AgentStatus, Message, Task, TaskStatus, Tenant, TenantStatus};

/// Backend-agnostic persistence trait covering tasks, agents, messages,
/// tenants, and the workflow step journal.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Mark a task running and stamp `started_at`.
    async fn mark_task_running(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Set a task's status, optionally replacing its result text.
    ///
    /// Stamps `completed_at` when `status` is terminal.
    async fn set_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Finalize a task only if it is still `running`.
    ///
    /// Returns false (without writing) when another path already advanced
    /// the status — the lost-update guard for the finalize step.
    async fn finalize_task_if_running(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: &str,
    ) -> Result<bool, DatabaseError>;

    /// Persist invocation metrics on a task.
    async fn update_task_metrics(
        &self,
        id: Uuid,
        cost_usd: f64,
        duration_ms: i64,
        num_turns: i64,
    ) -> Result<(), DatabaseError>;

    /// Re-enter `pending` from `failed`, consuming one retry.
    ///
    /// Returns false when the task is not `failed` or its retry budget is
    /// exhausted (the task stays permanently failed).
    async fn retry_task(&self, id: Uuid, max_retries: u32) -> Result<bool, DatabaseError>;

    /// Count an agent's tasks in a given status.
    async fn count_tasks(&self, assignee: &str, status: TaskStatus)
    -> Result<u64, DatabaseError>;

    /// All tasks currently in `status`, oldest first.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// Find an agent's pending system-nudge task, if one exists.
    async fn find_pending_nudge(&self, assignee: &str) -> Result<Option<Task>, DatabaseError>;

    // ── Agents ──────────────────────────────────────────────────────

    /// Insert a new agent.
    async fn create_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    /// Get an agent by its stable name.
    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, DatabaseError>;

    /// All agents in this namespace.
    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError>;

    /// Set an agent's status and current-task reference together.
    async fn set_agent_state(
        &self,
        name: &str,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a new message.
    async fn create_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Count unread messages addressed to an agent.
    async fn unread_count(&self, to_agent: &str) -> Result<u64, DatabaseError>;

    /// Unread messages addressed to an agent, oldest first.
    async fn list_unread(&self, to_agent: &str) -> Result<Vec<Message>, DatabaseError>;

    /// Mark a message read.
    async fn mark_message_read(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Workflow step journal ───────────────────────────────────────

    /// Record that a workflow step completed for a task.
    async fn record_step(&self, task_id: Uuid, step: &str) -> Result<(), DatabaseError>;

    /// Last recorded step for a task, if any.
    async fn last_step(&self, task_id: Uuid) -> Result<Option<String>, DatabaseError>;

    /// Clear a task's step journal (workflow finished).
    async fn clear_steps(&self, task_id: Uuid) -> Result<(), DatabaseError>;

    // ── Tenants (canonical namespace only) ──────────────────────────

    /// Insert a tenant row.
    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError>;

    /// Get a tenant by schema name.
    async fn get_tenant(&self, schema_name: &str) -> Result<Option<Tenant>, DatabaseError>;

    /// Get a tenant by slug.
    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, DatabaseError>;

    /// All tenants in a given status.
    async fn list_tenants(&self, status: TenantStatus) -> Result<Vec<Tenant>, DatabaseError>;

    /// Update a tenant's status.
    async fn set_tenant_status(
        &self,
        schema_name: &str,
        status: TenantStatus,
    ) -> Result<(), DatabaseError>;

    /// Remove a tenant row. Returns whether one existed.
    async fn delete_tenant(&self, schema_name: &str) -> Result<bool, DatabaseError>;
}
