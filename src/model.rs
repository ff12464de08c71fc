//! Core data model — tasks, agents, tenants, messages.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context prefix marking system-generated nudge tasks.
pub const NUDGE_CONTEXT_PREFIX: &str = "SYSTEM NUDGE:";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in an agent's queue.
    Pending,
    /// An agent is actively working on it.
    Running,
    /// Waiting on an external dependency mid-execution.
    Blocked,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Deliberately stopped before completion.
    Cancelled,
}

impl TaskStatus {
    /// Check whether a transition to `target` is allowed.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Failed) |
            (Running, Blocked) | (Running, Cancelled) |
            // Follow-up work re-enters the queue under the same id
            (Running, Pending) |
            (Blocked, Running) | (Blocked, Cancelled) |
            // Operator-driven retry
            (Failed, Pending)
        )
    }

    /// Terminal states have no automatic outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of assigned work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// Name of the agent this task is assigned to.
    pub assignee: String,
    /// Task that spawned this one, if any (delegation chain).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegator_id: Option<Uuid>,
    /// What the agent is asked to do.
    pub prompt: String,
    /// Free-form context for the agent.
    pub context: String,
    /// Lower runs first.
    pub priority: i64,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Human-readable outcome, set when the task reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Invocation cost in USD, filled on completion.
    pub cost_usd: f64,
    /// Invocation wall time, filled on completion.
    pub duration_ms: i64,
    /// Conversation turns used, filled on completion.
    pub num_turns: i64,
    /// Operator retries consumed so far.
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task for `assignee`.
    pub fn new(assignee: impl Into<String>, prompt: impl Into<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            assignee: assignee.into(),
            delegator_id: None,
            prompt: prompt.into(),
            context: String::new(),
            priority,
            status: TaskStatus::Pending,
            result: None,
            cost_usd: 0.0,
            duration_ms: 0,
            num_turns: 0,
            retries: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_delegator(mut self, delegator_id: Uuid) -> Self {
        self.delegator_id = Some(delegator_id);
        self
    }

    /// Whether this is a system-generated nudge task.
    pub fn is_nudge(&self) -> bool {
        self.context.starts_with(NUDGE_CONTEXT_PREFIX)
    }
}

/// Status of an agent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Error,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// A named, addressable worker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Stable key used for queue naming and workspace paths.
    pub name: String,
    pub display_name: String,
    pub status: AgentStatus,
    /// The task currently being executed, if any.
    ///
    /// Invariant: `Some` iff `status == Running` and that task is `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,
    /// Private working directory, persisted across invocations.
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: display_name.into(),
            status: AgentStatus::Idle,
            current_task_id: None,
            workspace,
            created_at: Utc::now(),
        }
    }
}

/// Status of a tenant namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Provisioning,
    Active,
    Deleting,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Deleting => "deleting",
        }
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "deleting" => Ok(Self::Deleting),
            other => Err(format!("unknown tenant status: {other}")),
        }
    }
}

/// An isolation boundary with its own data namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// URL-safe identifier.
    pub slug: String,
    /// Namespace name; unique, validated against a strict pattern.
    pub schema_name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Derive a tenant from a display name: the slug keeps hyphens, the
    /// schema name replaces them with underscores and gains a prefix.
    pub fn from_name(name: &str) -> Self {
        let slug: String = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .trim_matches('-')
            .to_string();
        let schema_name = format!("tenant_{}", slug.replace('-', "_"));
        Self {
            slug,
            schema_name,
            status: TenantStatus::Provisioning,
            created_at: Utc::now(),
        }
    }
}

/// Read status of an inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
        }
    }
}

/// A message addressed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Sending agent, or None for a human sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    pub to_agent: String,
    pub subject: String,
    pub body: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from_agent: Option<String>,
        to_agent: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_agent,
            to_agent: to_agent.into(),
            subject: subject.into(),
            body: body.into(),
            status: MessageStatus::Unread,
            created_at: Utc::now(),
        }
    }
}
