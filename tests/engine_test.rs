//! Engine loop: frame fixpoint, loop iteration semantics, termination.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use ralph::domain::errors::{DomainError, DomainResult};
use ralph::domain::models::ActiveJob;
use ralph::domain::ports::{AgentExecutor, AgentInvocation, JobQueue, OutputStore};
use ralph::infrastructure::agent::AgentInvoker;
use ralph::services::engine::{Engine, RenderCtx, RunOutcome, WorkflowDef};
use ralph::services::tree::{
    ralph as ralph_loop, seq, task, workflow, MaxIterationsPolicy, Node, TaskAction,
};

use common::test_db;

/// No real agents in these tests; any invocation is a failure.
struct NoAgentExecutor;

#[async_trait]
impl AgentExecutor for NoAgentExecutor {
    async fn execute(&self, _invocation: AgentInvocation) -> DomainResult<String> {
        Err(DomainError::AgentFailure("no agents in this test".to_string()))
    }
}

fn invoker() -> Arc<AgentInvoker> {
    Arc::new(AgentInvoker::new(Arc::new(NoAgentExecutor), BTreeMap::new()))
}

fn monitor_payload() -> serde_json::Value {
    json!({"healthy": true, "issues": []})
}

fn static_task(id: &str) -> Node {
    task(id, "monitor", TaskAction::Static(monitor_payload())).build()
}

async fn run_engine(workflow_def: Arc<dyn WorkflowDef>) -> (common::TestDb, ralph::services::RunReport) {
    let db = test_db().await;
    let engine = Engine::new(
        "run-e",
        db.store.clone(),
        db.queue.clone(),
        db.catalog.clone(),
        invoker(),
        workflow_def,
        6,
        CancellationToken::new(),
    )
    .with_attempt_log(db.attempts.clone());
    let report = engine.run().await.expect("engine run");
    (db, report)
}

struct TwoStepWorkflow;

impl WorkflowDef for TwoStepWorkflow {
    fn render(&self, _ctx: &RenderCtx<'_>) -> DomainResult<Node> {
        Ok(workflow(
            "two-step",
            vec![static_task("alpha"), static_task("beta")],
        ))
    }
}

#[tokio::test]
async fn sequence_runs_to_fixed_point_and_terminates() {
    let (db, report) = run_engine(Arc::new(TwoStepWorkflow)).await;
    assert_eq!(report.outcome, RunOutcome::Completed);

    for node in ["alpha", "beta"] {
        let row = db
            .store
            .get_exact("monitor", "run-e", node, 0)
            .await
            .unwrap()
            .expect("output row");
        assert_eq!(row.payload, monitor_payload());
    }
}

/// Records, per render, the loop iteration plus what the cross-iteration and
/// iteration-scoped accessors see for stage-a.
struct LoopFlowWorkflow {
    seen: Arc<Mutex<Vec<(i64, Option<i64>, bool)>>>,
}

impl WorkflowDef for LoopFlowWorkflow {
    fn render(&self, ctx: &RenderCtx<'_>) -> DomainResult<Node> {
        let iteration = ctx.loops.iteration("ralph");
        let latest = ctx
            .snapshot
            .latest("monitor", "stage-a")
            .map(|(_, it)| it);
        let exact = ctx
            .snapshot
            .output_maybe("monitor", "stage-a", iteration)
            .is_some();
        self.seen.lock().unwrap().push((iteration, latest, exact));

        Ok(workflow(
            "loop-flow",
            vec![ralph_loop(
                "ralph",
                false,
                2,
                MaxIterationsPolicy::ReturnLast,
                vec![seq(vec![static_task("stage-a"), static_task("stage-b")])],
            )],
        ))
    }
}

#[tokio::test]
async fn cross_iteration_reads_use_latest_not_exact() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (db, report) = run_engine(Arc::new(LoopFlowWorkflow { seen: seen.clone() })).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.passes, 2);

    // Both iterations produced rows for both stages.
    for iteration in [0, 1] {
        for node in ["stage-a", "stage-b"] {
            assert!(db
                .store
                .get_exact("monitor", "run-e", node, iteration)
                .await
                .unwrap()
                .is_some());
        }
    }

    let seen = seen.lock().unwrap();
    // Immediately after the advance to iteration 1: the cross-iteration
    // accessor returns iteration 0's row, the iteration-scoped one is empty.
    assert!(
        seen.contains(&(1, Some(0), false)),
        "missing the latest-vs-exact divergence: {:?}",
        *seen
    );
    // After stage-a reruns in iteration 1 both agree again.
    assert!(seen.contains(&(1, Some(1), true)), "seen: {:?}", *seen);
}

struct FailingWorkflow {
    continue_on_fail: bool,
}

impl WorkflowDef for FailingWorkflow {
    fn render(&self, _ctx: &RenderCtx<'_>) -> DomainResult<Node> {
        // The payload violates the monitor schema, so the write fails.
        let bad = task("bad", "monitor", TaskAction::Static(json!({"oops": 1}))).retries(0);
        let bad = if self.continue_on_fail {
            bad.continue_on_fail()
        } else {
            bad
        };
        Ok(workflow("failing", vec![bad.build(), static_task("after")]))
    }
}

#[tokio::test]
async fn budget_exhausted_failure_terminates_the_run() {
    let (_db, report) = run_engine(Arc::new(FailingWorkflow {
        continue_on_fail: false,
    }))
    .await;
    assert_eq!(
        report.outcome,
        RunOutcome::Failed {
            node_id: "bad".to_string()
        }
    );
    assert!(report.failed_tasks.contains(&"bad".to_string()));
}

#[tokio::test]
async fn continue_on_fail_lets_the_run_complete() {
    let (db, report) = run_engine(Arc::new(FailingWorkflow {
        continue_on_fail: true,
    }))
    .await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.failed_tasks.contains(&"bad".to_string()));
    // The sibling still ran.
    assert!(db
        .store
        .get_exact("monitor", "run-e", "after", 0)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn cancellation_ends_the_run_without_dispatch() {
    let db = test_db().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = Engine::new(
        "run-e",
        db.store.clone(),
        db.queue.clone(),
        db.catalog.clone(),
        invoker(),
        Arc::new(TwoStepWorkflow),
        6,
        cancel,
    );
    let report = engine.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(db
        .store
        .get_exact("monitor", "run-e", "alpha", 0)
        .await
        .unwrap()
        .is_none());
}

struct EmptyWorkflow;

impl WorkflowDef for EmptyWorkflow {
    fn render(&self, _ctx: &RenderCtx<'_>) -> DomainResult<Node> {
        Ok(workflow("empty", vec![]))
    }
}

#[tokio::test]
async fn orphaned_jobs_do_not_livelock_the_engine() {
    let db = test_db().await;
    db.queue
        .insert_if_absent(&ActiveJob {
            job_id: "ghost".to_string(),
            job_type: "discovery".to_string(),
            agent_id: "nobody".to_string(),
            ticket_id: None,
            focus_id: None,
            created_at_ms: 1,
        })
        .await
        .unwrap();

    let engine = Engine::new(
        "run-e",
        db.store.clone(),
        db.queue.clone(),
        db.catalog.clone(),
        invoker(),
        Arc::new(EmptyWorkflow),
        6,
        CancellationToken::new(),
    );
    let report = engine.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}
