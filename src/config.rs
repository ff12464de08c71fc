//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Which runtime backend to use for agent invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Spawn an external CLI process per invocation.
    Cli,
    /// Drive an in-process execution engine.
    Embedded,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for tenant namespace database files.
    pub data_root: PathBuf,
    /// Root directory for per-agent workspaces.
    pub workspace_root: PathBuf,
    /// Runtime backend selection.
    pub runtime: RuntimeKind,
    /// Binary invoked by the CLI runtime backend.
    pub cli_bin: String,
    /// Default model hint passed to the runtime (None = runtime default).
    pub default_model: Option<String>,
    /// Idle-agent nudge sweep interval.
    pub nudge_interval: Duration,
    /// Whether the nudge sweep runs at all.
    pub nudge_enabled: bool,
    /// Lifecycle workflow periodic unread-message check interval.
    pub lifecycle_check_interval: Duration,
    /// Lifecycle loop turns before the workflow restarts with fresh state.
    pub lifecycle_max_iterations: u32,
    /// Orphaned-task reconciliation sweep interval.
    pub recovery_interval: Duration,
    /// Maximum attempts per retryable workflow step.
    pub step_max_attempts: u32,
    /// Base backoff for workflow step retries (doubles per attempt).
    pub step_backoff: Duration,
    /// Maximum operator-driven retries before a task fails permanently.
    pub max_task_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            workspace_root: PathBuf::from("./workspaces"),
            runtime: RuntimeKind::Cli,
            cli_bin: "claude".to_string(),
            default_model: None,
            nudge_interval: Duration::from_secs(120),
            nudge_enabled: true,
            lifecycle_check_interval: Duration::from_secs(60),
            lifecycle_max_iterations: 1000,
            recovery_interval: Duration::from_secs(300),
            step_max_attempts: 3,
            step_backoff: Duration::from_millis(500),
            max_task_retries: 3,
        }
    }
}

impl Config {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("AGENCY_DATA_ROOT") {
            cfg.data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGENCY_WORKSPACE_ROOT") {
            cfg.workspace_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGENCY_RUNTIME") {
            cfg.runtime = match v.as_str() {
                "embedded" => RuntimeKind::Embedded,
                _ => RuntimeKind::Cli,
            };
        }
        if let Ok(v) = std::env::var("AGENCY_CLI_BIN") {
            cfg.cli_bin = v;
        }
        if let Ok(v) = std::env::var("AGENCY_MODEL") {
            cfg.default_model = Some(v);
        }
        if let Some(mins) = env_u64("AGENCY_NUDGE_INTERVAL_MINUTES") {
            cfg.nudge_interval = Duration::from_secs(mins * 60);
        }
        if let Ok(v) = std::env::var("AGENCY_NUDGE_ENABLED") {
            cfg.nudge_enabled = v != "false";
        }
        if let Some(secs) = env_u64("AGENCY_LIFECYCLE_CHECK_SECS") {
            cfg.lifecycle_check_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("AGENCY_LIFECYCLE_MAX_ITERATIONS") {
            cfg.lifecycle_max_iterations = n as u32;
        }
        if let Some(secs) = env_u64("AGENCY_RECOVERY_INTERVAL_SECS") {
            cfg.recovery_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("AGENCY_STEP_MAX_ATTEMPTS") {
            cfg.step_max_attempts = n as u32;
        }
        if let Some(ms) = env_u64("AGENCY_STEP_BACKOFF_MS") {
            cfg.step_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("AGENCY_MAX_TASK_RETRIES") {
            cfg.max_task_retries = n as u32;
        }

        cfg
    }

    /// Path of the canonical (control-plane) database file.
    pub fn canonical_db_path(&self) -> PathBuf {
        self.data_root.join("canonical.db")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok().filter(|n| *n > 0)
}
