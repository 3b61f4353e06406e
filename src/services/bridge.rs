//! Scheduler-agent bridge: turns the scheduler agent's `ticket_schedule`
//! output into job-queue mutations, and reaps completed jobs.
//!
//! Runs at every frame boundary, before render: reap, then reconcile, then
//! the reconciler reads the queue and renders one task per active job.

use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    stage_node_id, ActiveJob, JobType, Severity, Ticket, TicketSchedule,
};
use crate::domain::ports::JobQueue;
use crate::services::context::FrameSnapshot;
use crate::services::pipeline;

/// Whether the output corresponding to a job exists.
///
/// Repeating job types check the current loop iteration so they can be
/// re-scheduled after an advance; one-shot per-ticket stages check across
/// iterations.
pub fn job_is_complete(
    snapshot: &FrameSnapshot,
    job_id: &str,
    job_type: JobType,
    current_iteration: i64,
) -> bool {
    let schema = job_type.schema_key();
    if job_type.is_repeating() {
        snapshot
            .output_maybe(schema, job_id, current_iteration)
            .is_some()
    } else {
        snapshot.latest(schema, job_id).is_some()
    }
}

/// Delete every active job whose output row has appeared.
pub async fn reap(
    queue: &dyn JobQueue,
    snapshot: &FrameSnapshot,
    current_iteration: i64,
) -> DomainResult<usize> {
    let mut reaped = 0;
    for job in queue.active().await? {
        let Ok(job_type) = job.job_type() else {
            warn!(job_id = %job.job_id, job_type = %job.job_type, "Dropping job with unknown type");
            queue.remove(&job.job_id).await?;
            continue;
        };
        if job_is_complete(snapshot, &job.job_id, job_type, current_iteration) {
            debug!(job_id = %job.job_id, "Reaping completed job");
            queue.remove(&job.job_id).await?;
            reaped += 1;
        }
    }
    Ok(reaped)
}

/// Severity of the latest review for a ticket, across both review schemas.
fn latest_review_severity(snapshot: &FrameSnapshot, ticket_id: &str) -> Option<Severity> {
    let mut best: Option<(i64, Severity)> = None;
    for (schema, stage) in [
        ("code_review", crate::domain::models::Stage::CodeReview),
        ("spec_review", crate::domain::models::Stage::SpecReview),
    ] {
        if let Some((payload, iteration)) =
            snapshot.latest(schema, &stage_node_id(ticket_id, stage))
        {
            if let Ok(severity) =
                serde_json::from_value::<Severity>(payload["severity"].clone())
            {
                if best.map(|(i, _)| iteration > i).unwrap_or(true) {
                    best = Some((iteration, severity));
                }
            }
        }
    }
    best.map(|(_, severity)| severity)
}

/// Insert every schedulable job of the latest schedule that has no output
/// yet, subject to the stage-order, same-ticket, and review-fix guards.
pub async fn reconcile(
    queue: &dyn JobQueue,
    snapshot: &FrameSnapshot,
    schedule: &TicketSchedule,
    tickets: &[Ticket],
    current_iteration: i64,
    now_ms: i64,
) -> DomainResult<usize> {
    let active = queue.active().await?;
    let mut busy_tickets: Vec<String> = active
        .iter()
        .filter_map(|job| job.ticket_id.clone())
        .collect();

    let mut inserted = 0;
    for (index, scheduled) in schedule.jobs.iter().enumerate() {
        let Ok(job_type) = scheduled.job_type.parse::<JobType>() else {
            warn!(job_type = %scheduled.job_type, "Skipping scheduled job with unknown type");
            continue;
        };
        let job_id = scheduled.job_id();

        if job_is_complete(snapshot, &job_id, job_type, current_iteration) {
            continue;
        }

        if let JobType::TicketStage(stage) = job_type {
            let Some(ticket_id) = scheduled.ticket_id.as_deref() else {
                warn!(job_id = %job_id, "Skipping ticket stage job without ticket id");
                continue;
            };
            let Some(ticket) = tickets.iter().find(|t| t.id == ticket_id) else {
                warn!(job_id = %job_id, "Skipping job for undiscovered ticket");
                continue;
            };
            // One workspace per ticket implies serial stage ordering.
            if busy_tickets.iter().any(|t| t.as_str() == ticket_id) {
                debug!(job_id = %job_id, "Ticket already has an active stage, skipping");
                continue;
            }
            let expected = pipeline::next_stage(snapshot, ticket_id, ticket.complexity_tier);
            if expected != Some(stage) {
                warn!(
                    job_id = %job_id,
                    expected = ?expected,
                    "Scheduled stage is not the ticket's next stage, skipping"
                );
                continue;
            }
            if stage == crate::domain::models::Stage::ReviewFix {
                let severity = latest_review_severity(snapshot, ticket_id);
                if !matches!(
                    severity,
                    Some(Severity::Minor) | Some(Severity::Major) | Some(Severity::Critical)
                ) {
                    debug!(job_id = %job_id, "No review findings, review-fix not warranted");
                    continue;
                }
            }
            busy_tickets.push(ticket_id.to_string());
        }

        let job = ActiveJob {
            job_id,
            job_type: scheduled.job_type.clone(),
            agent_id: scheduled.agent_id.clone(),
            ticket_id: scheduled.ticket_id.clone(),
            focus_id: scheduled.focus_id.clone(),
            created_at_ms: now_ms + index as i64,
        };
        queue.insert_if_absent(&job).await?;
        inserted += 1;
    }
    Ok(inserted)
}
