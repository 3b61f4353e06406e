//! The schema catalog: one declarative schema per output relation.

use std::collections::HashMap;

use super::{list, nullable, record, Schema};
use crate::domain::errors::{DomainError, DomainResult};

const PRIORITY: &[&str] = &["critical", "high", "medium", "low"];
const SEVERITY: &[&str] = &["none", "minor", "major", "critical"];
const TIER: &[&str] = &["trivial", "small", "medium", "large"];
const STATUS: &[&str] = &["partial", "complete", "blocked"];

/// Registry mapping schema keys to structural schemas.
///
/// Every relation of the output store corresponds to exactly one key here;
/// `put` validates against the catalog before any write.
pub struct SchemaCatalog {
    schemas: HashMap<&'static str, Schema>,
}

impl SchemaCatalog {
    pub fn get(&self, key: &str) -> DomainResult<&Schema> {
        self.schemas
            .get(key)
            .ok_or_else(|| DomainError::UnknownSchema(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.schemas.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schemas.keys().copied()
    }
}

fn ticket_record() -> Schema {
    record(vec![
        ("id", Schema::Str),
        ("title", Schema::Str),
        ("description", Schema::Str),
        ("category", Schema::Str),
        ("priority", Schema::Enum(PRIORITY)),
        ("complexityTier", Schema::Enum(TIER)),
        ("acceptanceCriteria", nullable(list(Schema::Str))),
        ("relevantFiles", list(Schema::Str)),
        ("referenceFiles", list(Schema::Str)),
    ])
}

fn review_record() -> Schema {
    record(vec![
        ("ticketId", Schema::Str),
        ("severity", Schema::Enum(SEVERITY)),
        ("findings", list(Schema::Str)),
        ("approved", Schema::Bool),
    ])
}

fn merge_entry_record() -> Schema {
    record(vec![
        ("ticketId", Schema::Str),
        ("landed", Schema::Bool),
        ("evicted", Schema::Bool),
        ("reason", nullable(Schema::Str)),
        ("branchCommits", nullable(Schema::Str)),
        ("summaryDiff", nullable(Schema::Str)),
        ("mainlineCommits", nullable(Schema::Str)),
        ("ciOutput", nullable(Schema::Str)),
        ("invalidated", Schema::Int),
    ])
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        let mut schemas = HashMap::new();

        schemas.insert(
            "discover",
            record(vec![("tickets", list(ticket_record()))]),
        );
        schemas.insert(
            "research",
            record(vec![
                ("ticketId", Schema::Str),
                ("findings", Schema::Str),
                ("relevantFiles", list(Schema::Str)),
                ("risks", nullable(list(Schema::Str))),
            ]),
        );
        schemas.insert(
            "plan",
            record(vec![
                ("ticketId", Schema::Str),
                ("steps", list(Schema::Str)),
                ("filesToChange", list(Schema::Str)),
                ("testPlan", nullable(Schema::Str)),
            ]),
        );
        schemas.insert(
            "implement",
            record(vec![
                ("ticketId", Schema::Str),
                ("summary", Schema::Str),
                ("filesChanged", list(Schema::Str)),
                ("status", Schema::Enum(STATUS)),
                ("notes", nullable(Schema::Str)),
            ]),
        );
        schemas.insert(
            "test_results",
            record(vec![
                ("ticketId", Schema::Str),
                ("passed", Schema::Bool),
                ("failures", list(Schema::Str)),
                ("output", nullable(Schema::Str)),
            ]),
        );
        schemas.insert(
            "build_verify",
            record(vec![
                ("ticketId", Schema::Str),
                ("success", Schema::Bool),
                ("output", nullable(Schema::Str)),
            ]),
        );
        schemas.insert("spec_review", review_record());
        schemas.insert("code_review", review_record());
        schemas.insert(
            "review_fix",
            record(vec![
                ("ticketId", Schema::Str),
                ("summary", Schema::Str),
                ("filesChanged", list(Schema::Str)),
                ("status", Schema::Enum(STATUS)),
            ]),
        );
        schemas.insert(
            "report",
            record(vec![
                ("ticketId", Schema::Str),
                ("summary", Schema::Str),
                ("status", Schema::Enum(STATUS)),
            ]),
        );
        schemas.insert(
            "land",
            record(vec![
                ("ticketId", Schema::Str),
                ("landed", Schema::Bool),
                ("evicted", Schema::Bool),
                ("reason", nullable(Schema::Str)),
                ("branchCommits", nullable(Schema::Str)),
                ("summaryDiff", nullable(Schema::Str)),
                ("mainlineCommits", nullable(Schema::Str)),
            ]),
        );
        schemas.insert(
            "ticket_schedule",
            record(vec![
                (
                    "jobs",
                    list(record(vec![
                        ("jobType", Schema::Str),
                        ("agentId", Schema::Str),
                        ("ticketId", nullable(Schema::Str)),
                        ("focusId", nullable(Schema::Str)),
                        ("reason", nullable(Schema::Str)),
                    ])),
                ),
                (
                    "rateLimitedAgents",
                    list(record(vec![
                        ("agentId", Schema::Str),
                        ("resumeAtMs", Schema::Int),
                    ])),
                ),
            ]),
        );
        schemas.insert(
            "merge_queue_result",
            record(vec![("entries", list(merge_entry_record()))]),
        );
        schemas.insert(
            "interpret_config",
            record(vec![
                ("projectName", Schema::Str),
                ("goals", list(Schema::Str)),
                ("constraints", nullable(list(Schema::Str))),
            ]),
        );
        schemas.insert(
            "progress",
            record(vec![
                ("summary", Schema::Str),
                ("ticketsLanded", Schema::Int),
                ("ticketsInFlight", Schema::Int),
                ("blocked", nullable(list(Schema::Str))),
            ]),
        );
        schemas.insert(
            "monitor",
            record(vec![
                ("healthy", Schema::Bool),
                ("issues", list(Schema::Str)),
            ]),
        );
        schemas.insert(
            "category_review",
            record(vec![
                ("category", Schema::Str),
                ("severity", Schema::Enum(SEVERITY)),
                ("findings", list(Schema::Str)),
            ]),
        );
        schemas.insert(
            "integration_test",
            record(vec![
                ("passed", Schema::Bool),
                ("failures", list(Schema::Str)),
                ("output", nullable(Schema::Str)),
            ]),
        );

        Self { schemas }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::validate;
    use serde_json::json;

    #[test]
    fn catalog_contains_all_relations() {
        let catalog = SchemaCatalog::default();
        for key in [
            "discover",
            "research",
            "plan",
            "implement",
            "test_results",
            "build_verify",
            "spec_review",
            "code_review",
            "review_fix",
            "report",
            "land",
            "ticket_schedule",
            "merge_queue_result",
            "interpret_config",
            "progress",
            "monitor",
            "category_review",
            "integration_test",
        ] {
            assert!(catalog.contains(key), "missing schema for {}", key);
        }
        assert!(!catalog.contains("bogus"));
    }

    #[test]
    fn discover_payload_validates() {
        let catalog = SchemaCatalog::default();
        let payload = json!({
            "tickets": [{
                "id": "T-1",
                "title": "Fix flaky retry",
                "description": "Retry loop drops the last attempt",
                "category": "bugfix",
                "priority": "high",
                "complexityTier": "small",
                "acceptanceCriteria": null,
                "relevantFiles": ["src/retry.rs"],
                "referenceFiles": [],
            }],
        });
        assert!(validate(catalog.get("discover").unwrap(), &payload).is_ok());
    }

    #[test]
    fn ticket_schedule_payload_validates() {
        let catalog = SchemaCatalog::default();
        let payload = json!({
            "jobs": [{
                "jobType": "ticket:implement",
                "agentId": "coder",
                "ticketId": "T-1",
                "focusId": null,
                "reason": "next stage",
            }],
            "rateLimitedAgents": [{"agentId": "coder", "resumeAtMs": 1000}],
        });
        assert!(validate(catalog.get("ticket_schedule").unwrap(), &payload).is_ok());
    }

    #[test]
    fn serialized_models_conform_to_their_schemas() {
        use crate::domain::models::{EvictionContext, EvictionReason, MergeEntry};
        let catalog = SchemaCatalog::default();
        let entry = MergeEntry::evicted(
            "T-9",
            EvictionReason::RebaseConflict,
            EvictionContext::default(),
            None,
        );
        let payload = json!({"entries": [entry]});
        assert!(validate(catalog.get("merge_queue_result").unwrap(), &payload).is_ok());
    }
}
