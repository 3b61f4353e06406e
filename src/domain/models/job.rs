//! Active jobs: the transient in-flight set bridging scheduler output and
//! the component tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::errors::DomainError;
use crate::domain::models::ticket::Stage;

/// Kind of work an active job renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    Discovery,
    ProgressUpdate,
    CodebaseReview,
    IntegrationTest,
    TicketStage(Stage),
}

impl JobType {
    /// Repeating job types complete per loop iteration and may be scheduled
    /// again after the loop advances. One-shot per-ticket stages complete
    /// across iterations.
    pub fn is_repeating(self) -> bool {
        matches!(self, JobType::Discovery | JobType::ProgressUpdate)
    }

    /// Schema key whose row marks this job as complete.
    pub fn schema_key(self) -> &'static str {
        match self {
            JobType::Discovery => "discover",
            JobType::ProgressUpdate => "progress",
            JobType::CodebaseReview => "category_review",
            JobType::IntegrationTest => "integration_test",
            JobType::TicketStage(stage) => stage.schema_key(),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Discovery => write!(f, "discovery"),
            JobType::ProgressUpdate => write!(f, "progress-update"),
            JobType::CodebaseReview => write!(f, "codebase-review"),
            JobType::IntegrationTest => write!(f, "integration-test"),
            JobType::TicketStage(stage) => write!(f, "ticket:{}", stage),
        }
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(JobType::Discovery),
            "progress-update" => Ok(JobType::ProgressUpdate),
            "codebase-review" => Ok(JobType::CodebaseReview),
            "integration-test" => Ok(JobType::IntegrationTest),
            other => {
                if let Some(stage) = other.strip_prefix("ticket:") {
                    Ok(JobType::TicketStage(stage.parse()?))
                } else {
                    Err(DomainError::ValidationFailed(format!(
                        "Unknown job type: {}",
                        other
                    )))
                }
            }
        }
    }
}

/// A job currently executing (or queued to execute) in this run.
///
/// `job_id` is unique and doubles as the node id of the task the job renders.
/// Active jobs are strictly transient: inserted by the scheduler-agent bridge
/// and deleted once the corresponding output row appears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub job_type: String,
    pub agent_id: String,
    pub ticket_id: Option<String>,
    pub focus_id: Option<String>,
    pub created_at_ms: i64,
}

impl ActiveJob {
    pub fn job_type(&self) -> Result<JobType, DomainError> {
        self.job_type.parse()
    }
}
