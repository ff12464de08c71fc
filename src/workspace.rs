//! Per-agent workspace directories.
//!
//! Every agent gets a private working directory under the workspace root,
//! namespaced by tenant. It persists across invocations; the runtime runs
//! with it as the working directory.

use std::path::PathBuf;

use tracing::debug;

use crate::error::WorkspaceError;

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure an agent's workspace exists and return its path. Idempotent.
    pub fn ensure(&self, tenant: &str, agent: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.root.join(tenant).join(agent);
        std::fs::create_dir_all(&path).map_err(|e| WorkspaceError::Create {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(path = %path.display(), "Workspace ready");
        Ok(path)
    }
}
