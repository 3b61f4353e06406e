//! Ticket model and the complexity-tier pipeline vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::errors::DomainError;

/// Priority of a discovered ticket. Closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Rank used for merge-queue ordering. Lower sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

/// Review severity. Closed enumeration; `None` means no findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Minor,
    Major,
    Critical,
}

/// Completion status reported by implement/review-fix/report stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Partial,
    Complete,
    Blocked,
}

/// Complexity tier fixing the stage sequence a ticket must pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Trivial,
    Small,
    Medium,
    Large,
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplexityTier::Trivial => "trivial",
            ComplexityTier::Small => "small",
            ComplexityTier::Medium => "medium",
            ComplexityTier::Large => "large",
        };
        write!(f, "{}", s)
    }
}

/// One step of a ticket's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Research,
    Plan,
    Implement,
    Test,
    BuildVerify,
    SpecReview,
    CodeReview,
    ReviewFix,
    Report,
    Land,
}

impl Stage {
    /// Stable kebab-case name used inside node ids (`"{ticket}:{stage}"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Research => "research",
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::Test => "test",
            Stage::BuildVerify => "build-verify",
            Stage::SpecReview => "spec-review",
            Stage::CodeReview => "code-review",
            Stage::ReviewFix => "review-fix",
            Stage::Report => "report",
            Stage::Land => "land",
        }
    }

    /// Schema key under which this stage's output rows are stored.
    pub fn schema_key(self) -> &'static str {
        match self {
            Stage::Research => "research",
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::Test => "test_results",
            Stage::BuildVerify => "build_verify",
            Stage::SpecReview => "spec_review",
            Stage::CodeReview => "code_review",
            Stage::ReviewFix => "review_fix",
            Stage::Report => "report",
            Stage::Land => "land",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(Stage::Research),
            "plan" => Ok(Stage::Plan),
            "implement" => Ok(Stage::Implement),
            "test" => Ok(Stage::Test),
            "build-verify" => Ok(Stage::BuildVerify),
            "spec-review" => Ok(Stage::SpecReview),
            "code-review" => Ok(Stage::CodeReview),
            "review-fix" => Ok(Stage::ReviewFix),
            "report" => Ok(Stage::Report),
            "land" => Ok(Stage::Land),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown stage: {}",
                other
            ))),
        }
    }
}

/// Node id for a per-ticket stage task: `"{ticketId}:{stage}"`.
pub fn stage_node_id(ticket_id: &str, stage: Stage) -> String {
    format!("{}:{}", ticket_id, stage.as_str())
}

/// A discovered unit of work.
///
/// The authoritative source of tickets is the set of `discover` rows in the
/// output store; rows are processed in iteration order with later rows
/// overriding earlier ones per ticket id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: Priority,
    pub complexity_tier: ComplexityTier,
    pub acceptance_criteria: Option<Vec<String>>,
    pub relevant_files: Vec<String>,
    pub reference_files: Vec<String>,
}

impl Ticket {
    /// Ticket ids must not contain the `:` delimiter used in stage node ids.
    pub fn validate_id(id: &str) -> Result<(), DomainError> {
        if id.is_empty() {
            return Err(DomainError::ValidationFailed(
                "Ticket id cannot be empty".to_string(),
            ));
        }
        if id.contains(':') {
            return Err(DomainError::ValidationFailed(format!(
                "Ticket id '{}' must not contain ':'",
                id
            )));
        }
        Ok(())
    }

    /// Branch bookmark for this ticket.
    pub fn bookmark(&self) -> String {
        format!("ticket/{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_str() {
        for stage in [
            Stage::Research,
            Stage::Plan,
            Stage::Implement,
            Stage::Test,
            Stage::BuildVerify,
            Stage::SpecReview,
            Stage::CodeReview,
            Stage::ReviewFix,
            Stage::Report,
            Stage::Land,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn stage_node_id_follows_convention() {
        assert_eq!(stage_node_id("T-1", Stage::BuildVerify), "T-1:build-verify");
    }

    #[test]
    fn ticket_id_rejects_colon() {
        assert!(Ticket::validate_id("T-1").is_ok());
        assert!(Ticket::validate_id("T:1").is_err());
        assert!(Ticket::validate_id("").is_err());
    }

    #[test]
    fn priority_rank_orders_critical_first() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }
}
