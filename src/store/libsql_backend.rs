//! libSQL `Store` implementation.
//!
//! Supports local file and in-memory databases. One backend instance exists
//! per tenant namespace; the canonical namespace additionally carries the
//! tenants table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Agent, AgentStatus, Message, MessageStatus, Task, TaskStatus, Tenant, TenantStatus,
};
use crate::store::migrations;
use crate::store::traits::Store;

/// libSQL store backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use,
/// so a single connection is reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let backend = Self::open_raw(path).await?;
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Store opened");
        Ok(backend)
    }

    /// Open an existing namespace file without touching its schema.
    ///
    /// Tenant namespaces get their tables from the provisioner's template
    /// clone, not from the migration runner.
    pub async fn open_existing(path: &Path) -> Result<Self, DatabaseError> {
        let backend = Self::open_raw(path).await?;
        debug!(path = %path.display(), "Namespace store opened");
        Ok(backend)
    }

    /// Create an in-memory store (for tests).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let backend = Self::open_raw(Path::new(":memory:")).await?;
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    async fn open_raw(path: &Path) -> Result<Self, DatabaseError> {
        if path != Path::new(":memory:") {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Connection(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("bad {entity} uuid {s:?}: {e}")))
}

const TASK_COLUMNS: &str = "id, assignee, delegator_id, prompt, context, priority, status, \
     result, cost_usd, duration_ms, num_turns, retries, created_at, started_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?;
    let delegator_str: Option<String> = row.get(2).ok();
    let status_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?;

    Ok(Task {
        id: parse_uuid(&id_str, "task")?,
        assignee: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?,
        delegator_id: match delegator_str {
            Some(s) => Some(parse_uuid(&s, "delegator")?),
            None => None,
        },
        prompt: row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?,
        context: row.get(4).unwrap_or_default(),
        priority: row.get(5).unwrap_or(0),
        status: status_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        result: row.get(7).ok(),
        cost_usd: row.get(8).unwrap_or(0.0),
        duration_ms: row.get(9).unwrap_or(0),
        num_turns: row.get(10).unwrap_or(0),
        retries: row.get::<i64>(11).unwrap_or(0) as u32,
        created_at: parse_datetime(&row.get::<String>(12).unwrap_or_default()),
        started_at: parse_optional_datetime(row.get(13).ok()),
        completed_at: parse_optional_datetime(row.get(14).ok()),
    })
}

const AGENT_COLUMNS: &str =
    "id, name, display_name, status, current_task_id, workspace, created_at";

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("agent row: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("agent row: {e}")))?;
    let current_str: Option<String> = row.get(4).ok();
    let workspace: String = row.get(5).unwrap_or_default();

    Ok(Agent {
        id: parse_uuid(&id_str, "agent")?,
        name: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("agent row: {e}")))?,
        display_name: row.get(2).unwrap_or_default(),
        status: status_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        current_task_id: match current_str {
            Some(s) => Some(parse_uuid(&s, "current task")?),
            None => None,
        },
        workspace: PathBuf::from(workspace),
        created_at: parse_datetime(&row.get::<String>(6).unwrap_or_default()),
    })
}

const MESSAGE_COLUMNS: &str = "id, from_agent, to_agent, subject, body, status, created_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("message row: {e}")))?;
    let status_str: String = row.get(5).unwrap_or_else(|_| "unread".into());

    Ok(Message {
        id: parse_uuid(&id_str, "message")?,
        from_agent: row.get(1).ok(),
        to_agent: row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("message row: {e}")))?,
        subject: row.get(3).unwrap_or_default(),
        body: row.get(4).unwrap_or_default(),
        status: if status_str == "read" {
            MessageStatus::Read
        } else {
            MessageStatus::Unread
        },
        created_at: parse_datetime(&row.get::<String>(6).unwrap_or_default()),
    })
}

fn row_to_tenant(row: &libsql::Row) -> Result<Tenant, DatabaseError> {
    let status_str: String = row.get(2).unwrap_or_else(|_| "provisioning".into());
    Ok(Tenant {
        slug: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("tenant row: {e}")))?,
        schema_name: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("tenant row: {e}")))?,
        status: status_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&row.get::<String>(3).unwrap_or_default()),
    })
}

#[async_trait]
impl Store for LibSqlStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (id, assignee, delegator_id, prompt, context, priority, status, \
                 result, cost_usd, duration_ms, num_turns, retries, created_at, started_at, completed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    task.id.to_string(),
                    task.assignee.clone(),
                    task.delegator_id.map(|d| d.to_string()),
                    task.prompt.clone(),
                    task.context.clone(),
                    task.priority,
                    task.status.as_str(),
                    task.result.clone(),
                    task.cost_usd,
                    task.duration_ms,
                    task.num_turns,
                    task.retries as i64,
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task_id = %task.id, assignee = %task.assignee, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_task_running(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_task_running: {e}")))?;
        Ok(())
    }

    async fn set_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        self.conn()
            .execute(
                "UPDATE tasks SET status = ?1, \
                 result = COALESCE(?2, result), \
                 completed_at = COALESCE(?3, completed_at) \
                 WHERE id = ?4",
                params![status.as_str(), result, completed_at, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_status: {e}")))?;
        Ok(())
    }

    async fn finalize_task_if_running(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: &str,
    ) -> Result<bool, DatabaseError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, completed_at = ?3 \
                 WHERE id = ?4 AND status = 'running'",
                params![status.as_str(), result, completed_at, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn update_task_metrics(
        &self,
        id: Uuid,
        cost_usd: f64,
        duration_ms: i64,
        num_turns: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET cost_usd = ?1, duration_ms = ?2, num_turns = ?3 WHERE id = ?4",
                params![cost_usd, duration_ms, num_turns, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_metrics: {e}")))?;
        Ok(())
    }

    async fn retry_task(&self, id: Uuid, max_retries: u32) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', retries = retries + 1, \
                 result = NULL, started_at = NULL, completed_at = NULL \
                 WHERE id = ?1 AND status = 'failed' AND retries < ?2",
                params![id.to_string(), max_retries as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn count_tasks(
        &self,
        assignee: &str,
        status: TaskStatus,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE assignee = ?1 AND status = ?2",
                params![assignee, status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks: {e}")))?
        {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn find_pending_nudge(&self, assignee: &str) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE assignee = ?1 AND status = 'pending' AND context LIKE ?2 \
                     LIMIT 1"
                ),
                params![
                    assignee,
                    format!("{}%", crate::model::NUDGE_CONTEXT_PREFIX)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_pending_nudge: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_pending_nudge: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn create_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agents (id, name, display_name, status, current_task_id, workspace, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    agent.id.to_string(),
                    agent.name.clone(),
                    agent.display_name.clone(),
                    agent.status.as_str(),
                    agent.current_task_id.map(|t| t.to_string()),
                    agent.workspace.to_string_lossy().to_string(),
                    agent.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_agent: {e}")))?;
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent: {e}")))?
        {
            Some(row) => Ok(Some(row_to_agent(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents: {e}")))?;

        let mut agents = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents: {e}")))?
        {
            agents.push(row_to_agent(&row)?);
        }
        Ok(agents)
    }

    async fn set_agent_state(
        &self,
        name: &str,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE agents SET status = ?1, current_task_id = ?2 WHERE name = ?3",
                params![
                    status.as_str(),
                    current_task_id.map(|t| t.to_string()),
                    name
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_agent_state: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "agent".into(),
                id: name.into(),
            });
        }
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn create_message(&self, message: &Message) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO messages (id, from_agent, to_agent, subject, body, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.to_string(),
                    message.from_agent.clone(),
                    message.to_agent.clone(),
                    message.subject.clone(),
                    message.body.clone(),
                    message.status.as_str(),
                    message.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_message: {e}")))?;
        Ok(())
    }

    async fn unread_count(&self, to_agent: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE to_agent = ?1 AND status = 'unread'",
                params![to_agent],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unread_count: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("unread_count: {e}")))?
        {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }

    async fn list_unread(&self, to_agent: &str) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE to_agent = ?1 AND status = 'unread' ORDER BY created_at ASC"
                ),
                params![to_agent],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unread: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unread: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn mark_message_read(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = 'read' WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_read: {e}")))?;
        Ok(())
    }

    // ── Workflow step journal ───────────────────────────────────────

    async fn record_step(&self, task_id: Uuid, step: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workflow_steps (task_id, step, recorded_at) VALUES (?1, ?2, ?3)",
                params![task_id.to_string(), step, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_step: {e}")))?;
        Ok(())
    }

    async fn last_step(&self, task_id: Uuid) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT step FROM workflow_steps WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_step: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("last_step: {e}")))?
        {
            Some(row) => Ok(Some(row.get(0).map_err(|e| {
                DatabaseError::Query(format!("last_step: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn clear_steps(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM workflow_steps WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_steps: {e}")))?;
        Ok(())
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (slug, schema_name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    tenant.slug.clone(),
                    tenant.schema_name.clone(),
                    tenant.status.as_str(),
                    tenant.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_tenant: {e}")))?;
        Ok(())
    }

    async fn get_tenant(&self, schema_name: &str) -> Result<Option<Tenant>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT slug, schema_name, status, created_at FROM tenants WHERE schema_name = ?1",
                params![schema_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant: {e}")))?
        {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT slug, schema_name, status, created_at FROM tenants WHERE slug = ?1",
                params![slug],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant_by_slug: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant_by_slug: {e}")))?
        {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tenants(&self, status: TenantStatus) -> Result<Vec<Tenant>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT slug, schema_name, status, created_at FROM tenants WHERE status = ?1 \
                 ORDER BY slug ASC",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tenants: {e}")))?;

        let mut tenants = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tenants: {e}")))?
        {
            tenants.push(row_to_tenant(&row)?);
        }
        Ok(tenants)
    }

    async fn set_tenant_status(
        &self,
        schema_name: &str,
        status: TenantStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tenants SET status = ?1 WHERE schema_name = ?2",
                params![status.as_str(), schema_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_tenant_status: {e}")))?;
        Ok(())
    }

    async fn delete_tenant(&self, schema_name: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM tenants WHERE schema_name = ?1",
                params![schema_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_tenant: {e}")))?;
        Ok(changed > 0)
    }
}
