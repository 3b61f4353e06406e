//! Merge-queue records: landing outcomes and eviction diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a ticket was evicted from a landing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    RebaseConflict,
    ReviewFailed,
    CiFailed,
    PushFailed,
    WorkspaceError,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictionReason::RebaseConflict => "rebase_conflict",
            EvictionReason::ReviewFailed => "review_failed",
            EvictionReason::CiFailed => "ci_failed",
            EvictionReason::PushFailed => "push_failed",
            EvictionReason::WorkspaceError => "workspace_error",
        };
        write!(f, "{}", s)
    }
}

/// VCS diagnostics collected when a landing attempt fails.
///
/// Threaded verbatim into the ticket's next research/plan/implement prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionContext {
    /// Commits on the ticket branch since the branch point.
    pub branch_commits: String,
    /// Files changed by the attempted change (summary diff).
    pub summary_diff: String,
    /// Commits landed on mainline since the branch point.
    pub mainline_commits: String,
}

/// One entry of a `merge_queue_result` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeEntry {
    pub ticket_id: String,
    pub landed: bool,
    pub evicted: bool,
    pub reason: Option<String>,
    pub branch_commits: Option<String>,
    pub summary_diff: Option<String>,
    pub mainline_commits: Option<String>,
    pub ci_output: Option<String>,
    /// How many times this entry was invalidated by an earlier window failure.
    pub invalidated: i64,
}

impl MergeEntry {
    pub fn landed(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            landed: true,
            evicted: false,
            reason: None,
            branch_commits: None,
            summary_diff: None,
            mainline_commits: None,
            ci_output: None,
            invalidated: 0,
        }
    }

    pub fn evicted(
        ticket_id: impl Into<String>,
        reason: EvictionReason,
        context: EvictionContext,
        ci_output: Option<String>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            landed: false,
            evicted: true,
            reason: Some(reason.to_string()),
            branch_commits: Some(context.branch_commits),
            summary_diff: Some(context.summary_diff),
            mainline_commits: Some(context.mainline_commits),
            ci_output,
            invalidated: 0,
        }
    }

    pub fn eviction_context(&self) -> Option<EvictionContext> {
        if !self.evicted {
            return None;
        }
        Some(EvictionContext {
            branch_commits: self.branch_commits.clone().unwrap_or_default(),
            summary_diff: self.summary_diff.clone().unwrap_or_default(),
            mainline_commits: self.mainline_commits.clone().unwrap_or_default(),
        })
    }
}

/// The `land` row written per ticket when the merge queue resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LandRecord {
    pub ticket_id: String,
    pub landed: bool,
    pub evicted: bool,
    pub reason: Option<String>,
    pub branch_commits: Option<String>,
    pub summary_diff: Option<String>,
    pub mainline_commits: Option<String>,
}

impl From<&MergeEntry> for LandRecord {
    fn from(entry: &MergeEntry) -> Self {
        Self {
            ticket_id: entry.ticket_id.clone(),
            landed: entry.landed,
            evicted: entry.evicted,
            reason: entry.reason.clone(),
            branch_commits: entry.branch_commits.clone(),
            summary_diff: entry.summary_diff.clone(),
            mainline_commits: entry.mainline_commits.clone(),
        }
    }
}
