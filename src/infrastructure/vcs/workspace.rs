//! Workspace management: isolated working copies for agent jobs.
//!
//! Paths follow `<tmp>/workflow-wt-{id}`, where `{id}` is the ticket id for
//! per-ticket stages and the job id for global jobs. All stages of a ticket
//! share one workspace so working artifacts survive across stages.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::Vcs;

const WORKSPACE_PREFIX: &str = "workflow-wt-";

pub struct WorkspaceManager {
    vcs: Arc<dyn Vcs>,
    tmp_root: PathBuf,
    open: Mutex<HashMap<String, PathBuf>>,
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn Vcs>, tmp_root: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            tmp_root: tmp_root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Workspace path for an id, whether or not it exists yet.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.tmp_root.join(format!("{}{}", WORKSPACE_PREFIX, id))
    }

    /// Create the workspace lazily; reuse it on every later call.
    pub async fn ensure(&self, id: &str, at: Option<&str>) -> DomainResult<PathBuf> {
        let mut open = self.open.lock().await;
        if let Some(path) = open.get(id) {
            return Ok(path.clone());
        }

        let path = self.path_for(id);
        if path.exists() {
            // Left over from an earlier run of this process lifetime; reuse.
            open.insert(id.to_string(), path.clone());
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.tmp_root)
            .await
            .map_err(|e| DomainError::WorkspaceError(format!("create tmp root: {}", e)))?;
        self.vcs.add_workspace(id, &path, at).await?;
        info!(workspace = %id, path = %path.display(), "Workspace created");
        open.insert(id.to_string(), path.clone());
        Ok(path)
    }

    /// Close the workspace and remove its path.
    pub async fn close_and_remove(&self, id: &str) -> DomainResult<()> {
        let path = self.path_for(id);
        if let Err(e) = self.vcs.close_workspace(id).await {
            warn!(workspace = %id, error = %e, "Failed to close workspace");
        }
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| DomainError::WorkspaceError(format!("remove {}: {}", path.display(), e)))?;
        }
        self.open.lock().await.remove(id);
        Ok(())
    }

    /// Remove orphaned workspace paths left behind by a crashed run.
    ///
    /// A path qualifies when it matches the workspace prefix, does not belong
    /// to an id in `keep`, and is older than the threshold.
    pub async fn reap_orphans(&self, keep: &[String], older_than: Duration) -> DomainResult<u64> {
        let mut reaped = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.tmp_root).await else {
            return Ok(0);
        };
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|e| {
            DomainError::WorkspaceError(format!("read tmp root: {}", e))
        }) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_prefix(WORKSPACE_PREFIX) else {
                continue;
            };
            if keep.iter().any(|k| k.as_str() == id) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            if matches!(modified, Some(m) if m > cutoff) {
                continue;
            }
            if let Err(e) = self.close_and_remove(id).await {
                warn!(workspace = %id, error = %e, "Failed to reap orphan workspace");
            } else {
                info!(workspace = %id, "Reaped orphan workspace");
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
