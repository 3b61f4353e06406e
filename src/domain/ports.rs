//! Ports: the seams between the engine core and its collaborators.
//!
//! Repository-pattern traits for the two stores, plus subprocess-backed ports
//! for agents and the VCS binary. Production implementations live under
//! `infrastructure`; tests substitute mocks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ActiveJob, AgentSpec, OutputRow};

/// Durable log of task outputs, one relation per schema key.
#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Validate the payload against the declared schema and upsert by
    /// `(schema_key, run_id, node_id, iteration)`.
    async fn put(&self, schema_key: &str, row: &OutputRow) -> DomainResult<()>;

    /// Exact lookup for the given iteration.
    async fn get_exact(
        &self,
        schema_key: &str,
        run_id: &str,
        node_id: &str,
        iteration: i64,
    ) -> DomainResult<Option<OutputRow>>;

    /// Row with the largest iteration for `(run, node)`.
    async fn get_latest(
        &self,
        schema_key: &str,
        run_id: &str,
        node_id: &str,
    ) -> DomainResult<Option<OutputRow>>;

    /// Iteration-ascending scan of one run's relation.
    async fn scan(&self, schema_key: &str, run_id: &str) -> DomainResult<Vec<OutputRow>>;

    /// Scan the relation across every run. Used by the resume scan.
    async fn scan_all_runs(&self, schema_key: &str) -> DomainResult<Vec<OutputRow>>;
}

/// Transient set of in-flight jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Idempotent insert keyed on `job_id`.
    async fn insert_if_absent(&self, job: &ActiveJob) -> DomainResult<()>;

    /// Idempotent delete.
    async fn remove(&self, job_id: &str) -> DomainResult<()>;

    /// Active jobs, ascending by `created_at_ms`.
    async fn active(&self) -> DomainResult<Vec<ActiveJob>>;
}

/// One subprocess invocation of an agent command-line tool.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub agent_id: String,
    pub spec: AgentSpec,
    pub prompt: String,
    /// Working directory the agent operates in (a workspace path, usually).
    pub cwd: Option<PathBuf>,
    /// Wall-clock deadline for this single invocation.
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

/// Low-level agent execution: spawn, feed the prompt, collect stdout.
///
/// Classifies failures (non-zero exit, auth signature, rate limit, timeout,
/// cancellation) but performs no JSON extraction — that is the invoker's job.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, invocation: AgentInvocation) -> DomainResult<String>;
}

/// Functional version-control operations, driven over the VCS binary.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Update remote-tracking refs.
    async fn fetch(&self) -> DomainResult<()>;

    /// Fetch from the remote git peer.
    async fn git_fetch(&self) -> DomainResult<()>;

    /// Replay `bookmark("{source}")` onto the destination revset.
    /// Conflicts surface as `DomainError::RebaseConflict`.
    async fn rebase(&self, source_bookmark: &str, destination: &str) -> DomainResult<()>;

    /// Point a bookmark at a revset (fast-forward).
    async fn set_bookmark(&self, name: &str, revset: &str) -> DomainResult<()>;

    async fn delete_bookmark(&self, name: &str) -> DomainResult<()>;

    /// Push a bookmark to the remote git peer.
    async fn push_bookmark(&self, name: &str) -> DomainResult<()>;

    /// Materialize a new working copy.
    async fn add_workspace(&self, name: &str, path: &Path, at: Option<&str>) -> DomainResult<()>;

    /// Dismiss a working copy.
    async fn close_workspace(&self, name: &str) -> DomainResult<()>;

    /// Commits in the revset, oldest first.
    async fn log(&self, revset: &str) -> DomainResult<String>;

    /// Files changed in the revset.
    async fn diff_summary(&self, revset: &str) -> DomainResult<String>;
}

/// Input to the post-rebase semantic review gate.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub ticket_id: String,
    pub commit_log: String,
    pub summary_diff: String,
    pub mainline_commits: String,
}

/// Verdict of the review gate.
#[derive(Debug, Clone)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub findings: Vec<String>,
}

/// Optional semantic review of a rebased window entry before CI.
#[async_trait]
pub trait ReviewGate: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> DomainResult<ReviewVerdict>;
}
