//! Agent-backed semantic review gate for the merge queue.
//!
//! Reviews a rebased window entry before CI: the agent sees the commit log
//! of the rebased branch, the summary diff, and the commits landed on
//! mainline since branching, and returns an approve/reject verdict.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::errors::DomainResult;
use crate::domain::models::{merge_queue_agent, AgentPool};
use crate::domain::ports::{ReviewGate, ReviewRequest, ReviewVerdict};
use crate::domain::schema::{list, record, Schema};
use super::invoker::{AgentInvoker, AgentTaskSpec};

fn verdict_schema() -> Schema {
    record(vec![
        ("approved", Schema::Bool),
        ("findings", list(Schema::Str)),
    ])
}

/// Review gate that delegates the verdict to an agent from the pool.
pub struct AgentReviewGate {
    invoker: Arc<AgentInvoker>,
    spec: AgentTaskSpec,
    cancel: CancellationToken,
}

impl AgentReviewGate {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        agents: Vec<String>,
        retries: u32,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invoker,
            spec: AgentTaskSpec {
                agents,
                retries,
                timeout,
            },
            cancel,
        }
    }

    /// Build the gate from the configured pool: the agent flagged
    /// `is_merge_queue` reviews, with the rest of the pool as fallback.
    /// `None` when no agent carries the flag — the queue then runs without
    /// a semantic gate.
    pub fn from_pool(
        invoker: Arc<AgentInvoker>,
        pool: &AgentPool,
        retries: u32,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Option<Self> {
        let primary = merge_queue_agent(pool)?;
        let mut agents = vec![primary.to_string()];
        agents.extend(pool.keys().filter(|id| id.as_str() != primary).cloned());
        Some(Self::new(invoker, agents, retries, timeout, cancel))
    }

    fn prompt(request: &ReviewRequest) -> String {
        format!(
            "Review this rebased change for ticket {} before it lands on mainline.\n\
             Reject it when the rebase left the change semantically stale against\n\
             what landed since branching, or when the commits no longer do what\n\
             they claim. Approve otherwise.\n\n\
             Commits on the ticket branch:\n{}\n\n\
             Files changed:\n{}\n\n\
             Commits on mainline since branching:\n{}\n\n\
             Respond with ONLY a JSON object matching exactly:\n{}",
            request.ticket_id,
            request.commit_log,
            request.summary_diff,
            request.mainline_commits,
            verdict_schema().outline(),
        )
    }
}

#[async_trait]
impl ReviewGate for AgentReviewGate {
    async fn review(&self, request: ReviewRequest) -> DomainResult<ReviewVerdict> {
        let prompt = Self::prompt(&request);
        let value = self
            .invoker
            .invoke(
                &self.spec,
                &prompt,
                &verdict_schema(),
                None,
                self.cancel.clone(),
            )
            .await?;

        let approved = value
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let findings = value
            .get("findings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        info!(ticket = %request.ticket_id, approved, "Merge-queue review verdict");
        Ok(ReviewVerdict { approved, findings })
    }
}
