//! Shared fixtures: in-memory database, a scriptable VCS, payload builders.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ralph::domain::errors::{DomainError, DomainResult};
use ralph::domain::models::{ComplexityTier, Priority, Ticket};
use ralph::domain::ports::{ReviewGate, ReviewRequest, ReviewVerdict, Vcs};
use ralph::domain::schema::SchemaCatalog;
use ralph::infrastructure::database::{
    AttemptLog, DatabaseConnection, SqliteJobQueue, SqliteOutputStore,
};

pub struct TestDb {
    pub db: DatabaseConnection,
    pub catalog: Arc<SchemaCatalog>,
    pub store: Arc<SqliteOutputStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub attempts: Arc<AttemptLog>,
}

pub async fn test_db() -> TestDb {
    let db = DatabaseConnection::new("sqlite::memory:")
        .await
        .expect("open in-memory database");
    let catalog = Arc::new(SchemaCatalog::default());
    db.bootstrap(&catalog).await.expect("bootstrap");
    let store = Arc::new(SqliteOutputStore::new(db.pool().clone(), catalog.clone()));
    let queue = Arc::new(SqliteJobQueue::new(db.pool().clone()));
    let attempts = Arc::new(AttemptLog::new(db.pool().clone()));
    TestDb {
        db,
        catalog,
        store,
        queue,
        attempts,
    }
}

/// Scriptable in-process VCS double. Workspaces become plain directories.
#[derive(Default)]
pub struct MockVcs {
    /// Source bookmarks whose rebase conflicts.
    pub conflicts: Mutex<HashSet<String>>,
    /// Pushes that fail before the first success.
    pub push_failures_remaining: AtomicU32,
    pub calls: Mutex<Vec<String>>,
    /// History of revsets the main bookmark was set to.
    pub main_positions: Mutex<Vec<String>>,
    pub deleted_bookmarks: Mutex<Vec<String>>,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conflict(self, bookmark: &str) -> Self {
        self.conflicts.lock().unwrap().insert(bookmark.to_string());
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn main_position(&self) -> Option<String> {
        self.main_positions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Vcs for MockVcs {
    async fn fetch(&self) -> DomainResult<()> {
        self.record("fetch".to_string());
        Ok(())
    }

    async fn git_fetch(&self) -> DomainResult<()> {
        self.record("git-fetch".to_string());
        Ok(())
    }

    async fn rebase(&self, source_bookmark: &str, destination: &str) -> DomainResult<()> {
        self.record(format!("rebase {} -> {}", source_bookmark, destination));
        if self.conflicts.lock().unwrap().contains(source_bookmark) {
            return Err(DomainError::RebaseConflict {
                bookmark: source_bookmark.to_string(),
                detail: "conflict in src/shared.rs".to_string(),
            });
        }
        Ok(())
    }

    async fn set_bookmark(&self, name: &str, revset: &str) -> DomainResult<()> {
        self.record(format!("bookmark set {} -r {}", name, revset));
        if name == "main" {
            self.main_positions.lock().unwrap().push(revset.to_string());
        }
        Ok(())
    }

    async fn delete_bookmark(&self, name: &str) -> DomainResult<()> {
        self.record(format!("bookmark delete {}", name));
        self.deleted_bookmarks.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn push_bookmark(&self, name: &str) -> DomainResult<()> {
        self.record(format!("push {}", name));
        if self.push_failures_remaining.load(Ordering::SeqCst) > 0 {
            self.push_failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(DomainError::PushFailure("remote rejected".to_string()));
        }
        Ok(())
    }

    async fn add_workspace(&self, name: &str, path: &Path, _at: Option<&str>) -> DomainResult<()> {
        self.record(format!("workspace add {}", name));
        std::fs::create_dir_all(path)
            .map_err(|e| DomainError::WorkspaceError(e.to_string()))
    }

    async fn close_workspace(&self, name: &str) -> DomainResult<()> {
        self.record(format!("workspace close {}", name));
        Ok(())
    }

    async fn log(&self, revset: &str) -> DomainResult<String> {
        Ok(format!("commits({})", revset))
    }

    async fn diff_summary(&self, revset: &str) -> DomainResult<String> {
        Ok(format!("files({})", revset))
    }
}

/// Scriptable review gate: rejects the named tickets, records every request.
#[derive(Default)]
pub struct ScriptedGate {
    pub reject: Mutex<HashSet<String>>,
    pub reviewed: Mutex<Vec<ReviewRequest>>,
}

impl ScriptedGate {
    pub fn rejecting(ticket_ids: &[&str]) -> Self {
        let gate = Self::default();
        let mut reject = gate.reject.lock().unwrap();
        for id in ticket_ids {
            reject.insert(id.to_string());
        }
        drop(reject);
        gate
    }
}

#[async_trait]
impl ReviewGate for ScriptedGate {
    async fn review(&self, request: ReviewRequest) -> DomainResult<ReviewVerdict> {
        let rejected = self.reject.lock().unwrap().contains(&request.ticket_id);
        self.reviewed.lock().unwrap().push(request);
        Ok(ReviewVerdict {
            approved: !rejected,
            findings: if rejected {
                vec!["change is stale against mainline".to_string()]
            } else {
                vec![]
            },
        })
    }
}

pub fn ticket(id: &str, tier: ComplexityTier, priority: Priority) -> Ticket {
    Ticket {
        id: id.to_string(),
        title: format!("Ticket {}", id),
        description: String::new(),
        category: "core".to_string(),
        priority,
        complexity_tier: tier,
        acceptance_criteria: None,
        relevant_files: vec![],
        reference_files: vec![],
    }
}

pub fn ticket_json(id: &str, tier: &str) -> Value {
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

pub fn implement_payload(ticket_id: &str) -> Value {
    json!({
        "ticketId": ticket_id,
        "summary": "implemented",
        "filesChanged": ["src/lib.rs"],
        "status": "complete",
        "notes": null,
    })
}

pub fn test_payload(ticket_id: &str) -> Value {
    json!({
        "ticketId": ticket_id,
        "passed": true,
        "failures": [],
        "output": null,
    })
}

pub fn build_verify_payload(ticket_id: &str) -> Value {
    json!({
        "ticketId": ticket_id,
        "success": true,
        "output": null,
    })
}

pub fn review_payload(ticket_id: &str, severity: &str) -> Value {
    json!({
        "ticketId": ticket_id,
        "severity": severity,
        "findings": [],
        "approved": severity == "none",
    })
}
