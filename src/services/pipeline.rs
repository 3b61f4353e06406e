//! Ticket pipeline model: tiers, stage transitions, tier completion.
//!
//! Tier assignment happens at discovery time and is immutable afterward for
//! that ticket id. Per-ticket stage rows are one-shot, so every read here is
//! the cross-iteration lookup.

use serde_json::Value;

use crate::domain::models::{stage_node_id, ComplexityTier, EvictionContext, Stage, Ticket};
use crate::services::context::FrameSnapshot;

const TRIVIAL: &[Stage] = &[Stage::Implement, Stage::BuildVerify];
const SMALL: &[Stage] = &[Stage::Implement, Stage::Test, Stage::BuildVerify];
const MEDIUM: &[Stage] = &[
    Stage::Research,
    Stage::Plan,
    Stage::Implement,
    Stage::Test,
    Stage::BuildVerify,
    Stage::CodeReview,
];
const LARGE: &[Stage] = &[
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

/// The ordered stage sequence for a tier.
pub fn tier_stages(tier: ComplexityTier) -> &'static [Stage] {
    match tier {
        ComplexityTier::Trivial => TRIVIAL,
        ComplexityTier::Small => SMALL,
        ComplexityTier::Medium => MEDIUM,
        ComplexityTier::Large => LARGE,
    }
}

/// The tier's final stage, whose output row marks tier completion.
pub fn final_stage(tier: ComplexityTier) -> Stage {
    *tier_stages(tier).last().expect("tiers are non-empty")
}

/// Furthest-advanced stage with an output row, reverse-walking the tier.
pub fn current_stage(
    snapshot: &FrameSnapshot,
    ticket_id: &str,
    tier: ComplexityTier,
) -> Option<Stage> {
    tier_stages(tier)
        .iter()
        .rev()
        .find(|stage| {
            snapshot
                .latest(stage.schema_key(), &stage_node_id(ticket_id, **stage))
                .is_some()
        })
        .copied()
}

/// First tier stage after the current one; the whole sequence starts at the
/// first stage when nothing ran yet. `None` once the tier is complete.
pub fn next_stage(
    snapshot: &FrameSnapshot,
    ticket_id: &str,
    tier: ComplexityTier,
) -> Option<Stage> {
    let stages = tier_stages(tier);
    match current_stage(snapshot, ticket_id, tier) {
        None => stages.first().copied(),
        Some(current) => {
            let idx = stages.iter().position(|s| *s == current)?;
            stages.get(idx + 1).copied()
        }
    }
}

/// Whether an output row exists for the tier's final stage.
pub fn is_tier_complete(snapshot: &FrameSnapshot, ticket_id: &str, tier: ComplexityTier) -> bool {
    let last = final_stage(tier);
    snapshot
        .latest(last.schema_key(), &stage_node_id(ticket_id, last))
        .is_some()
}

/// Fold all `discover` rows into the authoritative ticket table.
///
/// Rows are processed in iteration order; a later row overrides an earlier
/// one with the same ticket id (full-record override), keeping the first-seen
/// position.
pub fn tickets(snapshot: &FrameSnapshot) -> Vec<Ticket> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: std::collections::HashMap<String, Ticket> = std::collections::HashMap::new();

    for (_, _, payload) in snapshot.scan("discover") {
        let Some(list) = payload.get("tickets").and_then(Value::as_array) else {
            continue;
        };
        for raw in list {
            let Ok(ticket) = serde_json::from_value::<Ticket>(raw.clone()) else {
                continue;
            };
            if Ticket::validate_id(&ticket.id).is_err() {
                continue;
            }
            if !by_id.contains_key(&ticket.id) {
                order.push(ticket.id.clone());
            }
            by_id.insert(ticket.id.clone(), ticket);
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

/// Latest landing state for a ticket: `land` row first, then the newest
/// matching `merge_queue_result` entry.
pub fn landing_payload<'a>(snapshot: &'a FrameSnapshot, ticket_id: &str) -> Option<&'a Value> {
    if let Some((payload, _)) = snapshot.latest("land", &stage_node_id(ticket_id, Stage::Land)) {
        return Some(payload);
    }
    let mut rows = snapshot.scan("merge_queue_result");
    rows.reverse();
    for (_, _, payload) in rows {
        let Some(entries) = payload.get("entries").and_then(Value::as_array) else {
            continue;
        };
        if let Some(entry) = entries
            .iter()
            .find(|e| e.get("ticketId").and_then(Value::as_str) == Some(ticket_id))
        {
            return Some(entry);
        }
    }
    None
}

/// A ticket is completed iff its latest landing state says `landed`.
pub fn is_landed(snapshot: &FrameSnapshot, ticket_id: &str) -> bool {
    landing_payload(snapshot, ticket_id)
        .and_then(|p| p.get("landed"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Eviction diagnostics from the latest landing state, when it was an
/// eviction. Present at frame time means the next pipeline attempt threads
/// these artifacts into its prompts.
pub fn latest_eviction(snapshot: &FrameSnapshot, ticket_id: &str) -> Option<EvictionContext> {
    let payload = landing_payload(snapshot, ticket_id)?;
    if payload.get("evicted").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let text = |field: &str| {
        payload
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(EvictionContext {
        branch_commits: text("branchCommits"),
        summary_diff: text("summaryDiff"),
        mainline_commits: text("mainlineCommits"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket_json(id: &str, tier: &str) -> Value {
        json!({
            "id": id,
            "title": format!("Ticket {}", id),
            "description": "",
            "category": "core",
            "priority": "medium",
            "complexityTier": tier,
            "acceptanceCriteria": null,
            "relevantFiles": [],
            "referenceFiles": [],
        })
    }

    fn snapshot() -> FrameSnapshot {
        FrameSnapshot::default()
    }

    #[test]
    fn tier_table_matches_the_four_tiers() {
        assert_eq!(tier_stages(ComplexityTier::Trivial).len(), 2);
        assert_eq!(tier_stages(ComplexityTier::Small).len(), 3);
        assert_eq!(tier_stages(ComplexityTier::Medium).len(), 6);
        assert_eq!(tier_stages(ComplexityTier::Large).len(), 9);
        assert_eq!(final_stage(ComplexityTier::Trivial), Stage::BuildVerify);
        assert_eq!(final_stage(ComplexityTier::Medium), Stage::CodeReview);
        assert_eq!(final_stage(ComplexityTier::Large), Stage::Report);
    }

    #[test]
    fn next_stage_advances_stage_by_stage() {
        let mut snap = snapshot();
        let tier = ComplexityTier::Small;
        assert_eq!(next_stage(&snap, "T-1", tier), Some(Stage::Implement));

        snap.insert(
            "implement",
            "T-1:implement",
            0,
            json!({"ticketId": "T-1", "summary": "s", "filesChanged": [], "status": "complete", "notes": null}),
        );
        assert_eq!(current_stage(&snap, "T-1", tier), Some(Stage::Implement));
        assert_eq!(next_stage(&snap, "T-1", tier), Some(Stage::Test));
        assert!(!is_tier_complete(&snap, "T-1", tier));

        snap.insert(
            "test_results",
            "T-1:test",
            0,
            json!({"ticketId": "T-1", "passed": true, "failures": [], "output": null}),
        );
        snap.insert(
            "build_verify",
            "T-1:build-verify",
            1,
            json!({"ticketId": "T-1", "success": true, "output": null}),
        );
        assert_eq!(next_stage(&snap, "T-1", tier), None);
        assert!(is_tier_complete(&snap, "T-1", tier));
    }

    #[test]
    fn discovery_folds_last_write_wins() {
        let mut snap = snapshot();
        snap.insert(
            "discover",
            "discovery",
            0,
            json!({"tickets": [ticket_json("T-1", "small"), ticket_json("T-2", "trivial")]}),
        );
        let mut overridden = ticket_json("T-1", "large");
        overridden["title"] = json!("Ticket T-1 revised");
        snap.insert("discover", "discovery", 1, json!({"tickets": [overridden]}));

        let tickets = tickets(&snap);
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].id, "T-1");
        assert_eq!(tickets[0].complexity_tier, ComplexityTier::Large);
        assert_eq!(tickets[0].title, "Ticket T-1 revised");
        assert_eq!(tickets[1].id, "T-2");
    }

    #[test]
    fn landing_state_prefers_land_row() {
        let mut snap = snapshot();
        snap.insert(
            "land",
            "T-1:land",
            0,
            json!({
                "ticketId": "T-1", "landed": true, "evicted": false, "reason": null,
                "branchCommits": null, "summaryDiff": null, "mainlineCommits": null,
            }),
        );
        assert!(is_landed(&snap, "T-1"));
        assert!(latest_eviction(&snap, "T-1").is_none());
        assert!(!is_landed(&snap, "T-2"));
    }

    #[test]
    fn eviction_context_comes_from_merge_queue_result() {
        let mut snap = snapshot();
        snap.insert(
            "merge_queue_result",
            "merge-queue",
            2,
            json!({"entries": [{
                "ticketId": "T-3", "landed": false, "evicted": true,
                "reason": "rebase_conflict",
                "branchCommits": "c1", "summaryDiff": "M a.rs", "mainlineCommits": "m1",
                "ciOutput": null, "invalidated": 0,
            }]}),
        );
        assert!(!is_landed(&snap, "T-3"));
        let ctx = latest_eviction(&snap, "T-3").unwrap();
        assert_eq!(ctx.branch_commits, "c1");
        assert_eq!(ctx.summary_diff, "M a.rs");
        assert_eq!(ctx.mainline_commits, "m1");
    }
}
