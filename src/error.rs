//! Error types for the agency scheduler.

use uuid::Uuid;

/// Top-level error type for the scheduler core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Tenant error: {0}")]
    Tenant(#[from] TenantError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Agent runtime adapter errors.
///
/// These never cross the event-stream boundary — the adapter maps them
/// into a terminal failure `Result` event before yielding.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to spawn runtime process {bin}: {reason}")]
    Spawn { bin: String, reason: String },

    #[error("Runtime process exited without a result event")]
    NoResult,

    #[error("Runtime engine failed: {0}")]
    Engine(String),
}

/// Task execution workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Agent {0} not found")]
    AgentNotFound(String),

    #[error("Task {id}: invalid transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Step {step} failed after {attempts} attempts: {reason}")]
    StepExhausted {
        step: String,
        attempts: u32,
        reason: String,
    },
}

/// Tenant provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error(
        "Invalid schema name {0:?}: must start with a lowercase letter and \
         contain only lowercase letters, digits, and underscores"
    )]
    InvalidSchemaName(String),

    #[error("Tenant {0} not found")]
    NotFound(String),

    #[error("Tenant {schema} has {count} running agent(s), refusing to drop")]
    AgentsRunning { schema: String, count: usize },

    #[error("Provisioning {schema} failed: {reason}")]
    ProvisionFailed { schema: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace directory errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace {path}: {source}")]
    Create {
        path: String,
        source: std::io::Error,
    },
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
