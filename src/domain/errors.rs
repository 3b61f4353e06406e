//! Domain errors for the Super-Ralph engine.

use thiserror::Error;

/// Domain-level errors that can occur while driving a run.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Schema mismatch at {path}: expected {expected}, got {actual}")]
    SchemaMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown schema key: {0}")]
    UnknownSchema(String),

    #[error("Output not found: {schema}/{node_id}@{iteration}")]
    NotFound {
        schema: String,
        node_id: String,
        iteration: i64,
    },

    #[error("Agent failed: {0}")]
    AgentFailure(String),

    #[error("Agent authentication failed: {0}")]
    AuthFailure(String),

    #[error("Agent rate limited: {agent_id}, resume at {resume_at_ms}")]
    RateLimited { agent_id: String, resume_at_ms: i64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Task timed out after {0} seconds")]
    Timeout(u64),

    #[error("Rebase conflict on {bookmark}: {detail}")]
    RebaseConflict { bookmark: String, detail: String },

    #[error("CI failed for {ticket_id}: {detail}")]
    CiFailure { ticket_id: String, detail: String },

    #[error("Push failed: {0}")]
    PushFailure(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Workspace error: {0}")]
    WorkspaceError(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::ValidationFailed(err.to_string())
    }
}

impl DomainError {
    /// Whether this error terminates the whole run rather than a single task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DomainError::StorageUnavailable(_))
    }
}
