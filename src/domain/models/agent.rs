//! Agent pool definitions consumed from configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of the configured agent pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Executable kind, e.g. `"claude"` or `"codex"`. Invoked as a
    /// command-line tool with the prompt on stdin.
    #[serde(rename = "type")]
    pub kind: String,
    /// Model override passed to the tool, when it takes one.
    #[serde(default)]
    pub model: Option<String>,
    /// Whether this agent may serve as the scheduler.
    #[serde(default)]
    pub is_scheduler: bool,
    /// Whether this agent may serve the merge-queue review gate.
    #[serde(default)]
    pub is_merge_queue: bool,
}

/// The configured pool, keyed by agent id. BTreeMap keeps iteration stable.
pub type AgentPool = BTreeMap<String, AgentSpec>;

/// Pick the scheduler agent id from the pool: the first entry flagged
/// `is_scheduler`, else the first entry.
pub fn scheduler_agent(pool: &AgentPool) -> Option<&str> {
    pool.iter()
        .find(|(_, spec)| spec.is_scheduler)
        .or_else(|| pool.iter().next())
        .map(|(id, _)| id.as_str())
}

/// Pick the merge-queue review agent id, if any is flagged.
pub fn merge_queue_agent(pool: &AgentPool) -> Option<&str> {
    pool.iter()
        .find(|(_, spec)| spec.is_merge_queue)
        .map(|(id, _)| id.as_str())
}
