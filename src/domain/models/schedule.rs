//! Typed views of the scheduler agent's `ticket_schedule` output.

use serde::{Deserialize, Serialize};

/// One job the scheduler agent asked the engine to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub job_type: String,
    pub agent_id: String,
    pub ticket_id: Option<String>,
    pub focus_id: Option<String>,
    pub reason: Option<String>,
}

impl ScheduledJob {
    /// Job id, which doubles as the node id of the rendered task.
    ///
    /// Per-ticket stages use `"{ticketId}:{stage}"`; global jobs use the job
    /// type itself, suffixed with the focus id when one is present.
    pub fn job_id(&self) -> String {
        if let Some(stage) = self.job_type.strip_prefix("ticket:") {
            let ticket = self.ticket_id.as_deref().unwrap_or("unknown");
            format!("{}:{}", ticket, stage)
        } else if let Some(ref focus) = self.focus_id {
            format!("{}:{}", self.job_type, focus)
        } else {
            self.job_type.clone()
        }
    }
}

/// A rate-limit annotation: exclude the agent until the resume time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedAgent {
    pub agent_id: String,
    pub resume_at_ms: i64,
}

/// The full schedule payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketSchedule {
    pub jobs: Vec<ScheduledJob>,
    pub rate_limited_agents: Vec<RateLimitedAgent>,
}
