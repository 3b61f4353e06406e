//! Subprocess driver for the functional VCS binary.

mod workspace;

pub use workspace::WorkspaceManager;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::Vcs;

/// Drives the VCS binary in the repository root.
pub struct JjVcs {
    bin: String,
    repo_root: PathBuf,
}

impl JjVcs {
    pub fn new(bin: impl Into<String>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            repo_root: repo_root.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> DomainResult<String> {
        debug!(args = ?args, "vcs invocation");
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| {
                DomainError::ExecutionFailed(format!("Failed to run {}: {}", self.bin, e))
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(DomainError::ExecutionFailed(format!(
                "{} {} failed: {}",
                self.bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

/// Revset identifying a ticket branch bookmark.
pub fn bookmark_revset(name: &str) -> String {
    format!("bookmark(\"{}\")", name)
}

/// Validates a bookmark name to prevent flag or revset injection.
pub fn validate_bookmark_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::ValidationFailed(
            "Bookmark name cannot be empty".to_string(),
        ));
    }
    if name.starts_with('-') {
        return Err(DomainError::ValidationFailed(format!(
            "Invalid bookmark name '{}': must not start with '-'",
            name
        )));
    }
    if name.contains("..") {
        return Err(DomainError::ValidationFailed(format!(
            "Invalid bookmark name '{}': must not contain '..'",
            name
        )));
    }
    for ch in name.chars() {
        if ch.is_ascii_control()
            || matches!(ch, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '"' | '(' | ')')
        {
            return Err(DomainError::ValidationFailed(format!(
                "Invalid bookmark name '{}': contains disallowed character '{}'",
                name, ch
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Vcs for JjVcs {
    async fn fetch(&self) -> DomainResult<()> {
        self.run(&["git", "fetch"]).await.map(|_| ())
    }

    async fn git_fetch(&self) -> DomainResult<()> {
        self.run(&["git", "fetch"]).await.map(|_| ())
    }

    async fn rebase(&self, source_bookmark: &str, destination: &str) -> DomainResult<()> {
        validate_bookmark_name(source_bookmark)?;
        let revset = bookmark_revset(source_bookmark);
        match self.run(&["rebase", "-b", &revset, "-d", destination]).await {
            Ok(_) => Ok(()),
            Err(DomainError::ExecutionFailed(detail)) => Err(DomainError::RebaseConflict {
                bookmark: source_bookmark.to_string(),
                detail,
            }),
            Err(e) => Err(e),
        }
    }

    async fn set_bookmark(&self, name: &str, revset: &str) -> DomainResult<()> {
        validate_bookmark_name(name)?;
        self.run(&["bookmark", "set", name, "-r", revset])
            .await
            .map(|_| ())
    }

    async fn delete_bookmark(&self, name: &str) -> DomainResult<()> {
        validate_bookmark_name(name)?;
        self.run(&["bookmark", "delete", name]).await.map(|_| ())
    }

    async fn push_bookmark(&self, name: &str) -> DomainResult<()> {
        validate_bookmark_name(name)?;
        match self.run(&["git", "push", "--bookmark", name]).await {
            Ok(_) => Ok(()),
            Err(DomainError::ExecutionFailed(detail)) => Err(DomainError::PushFailure(detail)),
            Err(e) => Err(e),
        }
    }

    async fn add_workspace(&self, name: &str, path: &Path, at: Option<&str>) -> DomainResult<()> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["workspace", "add", name, path_str.as_ref()];
        if let Some(rev) = at {
            args.push("--at-operation");
            args.push(rev);
        }
        match self.run(&args).await {
            Ok(_) => Ok(()),
            Err(DomainError::ExecutionFailed(detail)) => Err(DomainError::WorkspaceError(detail)),
            Err(e) => Err(e),
        }
    }

    async fn close_workspace(&self, name: &str) -> DomainResult<()> {
        match self.run(&["workspace", "close", name]).await {
            Ok(_) => Ok(()),
            Err(DomainError::ExecutionFailed(detail)) => Err(DomainError::WorkspaceError(detail)),
            Err(e) => Err(e),
        }
    }

    async fn log(&self, revset: &str) -> DomainResult<String> {
        self.run(&["log", "-r", revset, "--reversed"]).await
    }

    async fn diff_summary(&self, revset: &str) -> DomainResult<String> {
        self.run(&["diff", "-r", revset, "--summary"]).await
    }
}
