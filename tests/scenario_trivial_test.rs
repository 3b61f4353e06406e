//! End-to-end: a single trivial ticket discovered, implemented, verified,
//! and landed through the full workflow with scripted agents.

mod common;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use ralph::domain::errors::{DomainError, DomainResult};
use ralph::domain::models::AgentSpec;
use ralph::domain::ports::{AgentExecutor, AgentInvocation};
use ralph::infrastructure::agent::AgentInvoker;
use ralph::infrastructure::vcs::WorkspaceManager;
use ralph::services::config::Config;
use ralph::services::engine::{Engine, RunOutcome};
use ralph::services::merge_queue::{MergeCoordinator, MergeQueueSettings, OrderingStrategy};
use ralph::services::prompts::DefaultTemplates;
use ralph::services::workflow::SuperRalphWorkflow;

use common::{build_verify_payload, implement_payload, test_db, ticket_json, MockVcs};

/// Scripted agent: picks the reply by the prompt's intro line and records
/// every invocation's working directory.
struct ScriptedAgents {
    schedules: Mutex<VecDeque<Value>>,
    pub invocations: Mutex<Vec<(String, Option<PathBuf>)>>,
}

impl ScriptedAgents {
    fn new(schedules: Vec<Value>) -> Self {
        Self {
            schedules: Mutex::new(schedules.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    fn kind_of(prompt: &str) -> &'static str {
        if prompt.starts_with("Interpret the project configuration") {
            "interpret"
        } else if prompt.starts_with("You are the scheduler") {
            "schedule"
        } else if prompt.starts_with("Survey the repository") {
            "discovery"
        } else if prompt.starts_with("Implement this ticket") {
            "implement"
        } else if prompt.starts_with("Run the build commands") {
            "build-verify"
        } else {
            "other"
        }
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgents {
    async fn execute(&self, invocation: AgentInvocation) -> DomainResult<String> {
        let kind = Self::kind_of(&invocation.prompt);
        self.invocations
            .lock()
            .unwrap()
            .push((kind.to_string(), invocation.cwd.clone()));

        let payload = match kind {
            "interpret" => json!({
                "projectName": "demo",
                "goals": ["ship the ticket"],
                "constraints": null,
            }),
            "schedule" => self
                .schedules
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({"jobs": [], "rateLimitedAgents": []})),
            "discovery" => json!({"tickets": [ticket_json("T-X", "trivial")]}),
            "implement" => implement_payload("T-X"),
            "build-verify" => build_verify_payload("T-X"),
            other => {
                return Err(DomainError::AgentFailure(format!(
                    "unscripted prompt kind: {}",
                    other
                )))
            }
        };
        Ok(serde_json::to_string(&payload).expect("serialize"))
    }
}

fn stage_job(stage: &str) -> Value {
    json!({
        "jobType": format!("ticket:{}", stage),
        "agentId": "main",
        "ticketId": "T-X",
        "focusId": null,
        "reason": null,
    })
}

fn schedule(jobs: Vec<Value>) -> Value {
    json!({"jobs": jobs, "rateLimitedAgents": []})
}

#[tokio::test]
async fn trivial_ticket_flows_from_discovery_to_landing() {
    let db = test_db().await;
    let tmp = tempfile::tempdir().unwrap();

    let mut agents = ralph::domain::models::AgentPool::new();
    agents.insert(
        "main".to_string(),
        AgentSpec {
            kind: "fake".to_string(),
            model: None,
            is_scheduler: true,
            is_merge_queue: false,
        },
    );
    let config = Arc::new(Config {
        project_name: "demo".to_string(),
        agents,
        max_passes: 6,
        post_land_checks: vec!["true".to_string()],
        tmp_dir: Some(tmp.path().to_path_buf()),
        ..Config::default()
    });

    let executor = Arc::new(ScriptedAgents::new(vec![
        schedule(vec![json!({
            "jobType": "discovery",
            "agentId": "main",
            "ticketId": null,
            "focusId": null,
            "reason": null,
        })]),
        schedule(vec![stage_job("implement")]),
        schedule(vec![stage_job("build-verify")]),
    ]));
    let invoker = Arc::new(AgentInvoker::new(executor.clone(), config.agents.clone()));

    let vcs = Arc::new(MockVcs::new());
    let workspaces = Arc::new(WorkspaceManager::new(vcs.clone(), tmp.path()));
    let coordinator = Arc::new(MergeCoordinator::new(
        vcs.clone(),
        workspaces.clone(),
        None,
        db.store.clone(),
        "run-s",
        MergeQueueSettings {
            main_branch: "main".to_string(),
            max_depth: 3,
            ordering: OrderingStrategy::Priority,
            post_land_checks: config.post_land_checks.clone(),
            push_retries: 3,
        },
    ));

    let workflow = Arc::new(SuperRalphWorkflow::new(
        config.clone(),
        "ship ticket T-X",
        db.queue.clone(),
        invoker.clone(),
        coordinator,
        Arc::new(DefaultTemplates),
        db.catalog.clone(),
    ));

    let engine = Engine::new(
        "run-s",
        db.store.clone(),
        db.queue.clone(),
        db.catalog.clone(),
        invoker,
        workflow,
        config.max_concurrency,
        CancellationToken::new(),
    )
    .with_attempt_log(db.attempts.clone())
    .with_workspaces(workspaces.clone());

    let report = engine.run().await.expect("run");

    // The run completed with the ticket landed.
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.landed, vec!["T-X".to_string()]);
    assert!(report.evicted.is_empty());
    assert!(report.failed_tasks.is_empty());

    // Output rows exist for both trivial-tier stages under the node-id
    // convention, and for the landing.
    use ralph::domain::ports::OutputStore;
    assert!(db
        .store
        .get_latest("implement", "run-s", "T-X:implement")
        .await
        .unwrap()
        .is_some());
    assert!(db
        .store
        .get_latest("build_verify", "run-s", "T-X:build-verify")
        .await
        .unwrap()
        .is_some());
    let land = db
        .store
        .get_latest("land", "run-s", "T-X:land")
        .await
        .unwrap()
        .expect("land row");
    assert_eq!(land.payload["landed"], json!(true));

    // The merge queue cleaned up the ticket workspace.
    assert!(!workspaces.path_for("T-X").exists());

    // Every per-ticket stage ran in the same workspace path.
    let expected = tmp.path().join("workflow-wt-T-X");
    let invocations = executor.invocations.lock().unwrap();
    let stage_dirs: Vec<&Option<PathBuf>> = invocations
        .iter()
        .filter(|(kind, _)| kind == "implement" || kind == "build-verify")
        .map(|(_, cwd)| cwd)
        .collect();
    assert_eq!(stage_dirs.len(), 2);
    for cwd in stage_dirs {
        assert_eq!(cwd.as_deref(), Some(expected.as_path()));
    }

    // Mainline was fast-forwarded to the ticket branch and pushed.
    assert_eq!(vcs.main_position().unwrap(), "bookmark(\"ticket/T-X\")");
    assert!(vcs
        .deleted_bookmarks
        .lock()
        .unwrap()
        .contains(&"ticket/T-X".to_string()));
}
