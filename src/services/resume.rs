//! Durability: cross-run scan for in-progress tickets.
//!
//! On startup the output store is scanned across every previous run; tickets
//! with some stage row but no successful land are handed to the scheduler
//! agent as resumable, with priority over fresh discovery.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::domain::errors::DomainResult;
use crate::domain::models::Stage;
use crate::domain::ports::OutputStore;

/// A ticket found mid-pipeline in an earlier run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableTicket {
    pub ticket_id: String,
    /// Furthest-advanced stage with an output row.
    pub stage: Stage,
    /// The run that produced that row.
    pub run_id: String,
}

/// Resume ranking: later pipeline stages first.
fn stage_rank(stage: Stage) -> u8 {
    match stage {
        Stage::Report => 8,
        Stage::ReviewFix => 7,
        Stage::CodeReview => 6,
        Stage::SpecReview => 5,
        Stage::BuildVerify => 4,
        Stage::Test => 3,
        Stage::Implement => 2,
        Stage::Plan => 1,
        Stage::Research => 0,
        Stage::Land => 0,
    }
}

const PIPELINE_STAGES: &[Stage] = &[
    Stage::Research,
    Stage::Plan,
    Stage::Implement,
    Stage::Test,
    Stage::BuildVerify,
    Stage::SpecReview,
    Stage::CodeReview,
    Stage::ReviewFix,
    Stage::Report,
];

fn split_node_id(node_id: &str) -> Option<(&str, &str)> {
    node_id.split_once(':')
}

/// Scan for resumable tickets from runs other than `current_run`.
pub async fn scan_resumable(
    store: &dyn OutputStore,
    current_run: &str,
) -> DomainResult<Vec<ResumableTicket>> {
    // Tickets that already landed (in any run) are done.
    let mut landed: HashSet<String> = HashSet::new();
    for row in store.scan_all_runs("land").await? {
        if row.payload.get("landed").and_then(Value::as_bool) == Some(true) {
            if let Some((ticket, _)) = split_node_id(&row.node_id) {
                landed.insert(ticket.to_string());
            }
        }
    }

    let mut furthest: HashMap<String, ResumableTicket> = HashMap::new();
    for stage in PIPELINE_STAGES {
        for row in store.scan_all_runs(stage.schema_key()).await? {
            if row.run_id == current_run {
                continue;
            }
            let Some((ticket, stage_name)) = split_node_id(&row.node_id) else {
                continue;
            };
            if stage_name != stage.as_str() || landed.contains(ticket) {
                continue;
            }
            let candidate = ResumableTicket {
                ticket_id: ticket.to_string(),
                stage: *stage,
                run_id: row.run_id.clone(),
            };
            match furthest.get(ticket) {
                Some(existing) if stage_rank(existing.stage) >= stage_rank(*stage) => {}
                _ => {
                    furthest.insert(ticket.to_string(), candidate);
                }
            }
        }
    }

    let mut resumable: Vec<ResumableTicket> = furthest.into_values().collect();
    resumable.sort_by(|a, b| {
        stage_rank(b.stage)
            .cmp(&stage_rank(a.stage))
            .then_with(|| a.ticket_id.cmp(&b.ticket_id))
    });
    if !resumable.is_empty() {
        info!(count = resumable.len(), "Found resumable tickets from earlier runs");
    }
    Ok(resumable)
}
