//! Durable workflows — per-task execution and per-agent lifecycle.
//!
//! Durability comes from a step journal in the store: each completed step is
//! recorded, so a restarted process resumes a task after the last step that
//! actually finished instead of re-running it.

pub mod lifecycle;
mod task;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::error::WorkflowError;

pub use lifecycle::{
    LifecycleHandle, LifecyclePhase, LifecycleStatus, MessageSignal, spawn_lifecycle,
};
pub use task::{TaskWorkflow, WorkflowPhase, WorkflowStatus};

/// Marker an agent puts in its output to re-enter the queue instead of
/// completing.
pub const FOLLOW_UP_MARKER: &str = "NEEDS FOLLOW-UP";

/// Per-task cancellation signals, shared between the queue front door and
/// the running workflows.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task's cancel channel; the workflow holds the receiver
    /// for its whole run.
    pub fn register(&self, task_id: Uuid) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id, tx);
        rx
    }

    /// Signal cancellation. Returns false when no workflow is registered
    /// for the id.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.get(&task_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Drop a task's channel once its workflow finished.
    pub fn unregister(&self, task_id: Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_id);
    }

    /// Whether a workflow is currently registered for the id.
    pub fn is_live(&self, task_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&task_id)
    }
}

/// Run a fallible step with exponential backoff and jitter.
///
/// Used for the I/O steps around an invocation; the invocation itself is
/// never retried (a half-finished conversation must not silently re-run).
pub(crate) async fn retry_step<T, E, F, Fut>(
    step: &str,
    max_attempts: u32,
    base_backoff: Duration,
    mut op: F,
) -> Result<T, WorkflowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(WorkflowError::StepExhausted {
                    step: step.to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                let backoff = base_backoff * 2u32.saturating_pow(attempt - 1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                warn!(step, attempt, error = %e, "Workflow step failed, retrying");
                tokio::time::sleep(backoff + jitter).await;
            }
        }
    }
}
