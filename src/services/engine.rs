//! Engine loop: the render → schedule → execute → persist fixpoint.
//!
//! Each frame takes a snapshot, lets the workflow reconcile the job queue,
//! renders the tree, dispatches every runnable task concurrently, and awaits
//! the whole frame before rendering again. A loop's iteration advances only
//! after every child terminated, and frame `f`'s writes are visible to the
//! snapshot of frame `f + 1`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ActiveJob, OutputRow};
use crate::domain::ports::{JobQueue, OutputStore};
use crate::domain::schema::SchemaCatalog;
use crate::infrastructure::agent::{AgentInvoker, AgentTaskSpec};
use crate::infrastructure::database::AttemptLog;
use crate::infrastructure::vcs::WorkspaceManager;
use crate::services::context::FrameSnapshot;
use crate::services::reconciler::{to_xml, TaskDescriptor};
use crate::services::resume::{scan_resumable, ResumableTicket};
use crate::services::scheduler::{schedule, ScheduleInput};
use crate::services::tree::{ComputeCtx, LoopStates, Node, TaskAction};

/// In-progress attempts older than this revert to pending on startup.
pub const STALE_ATTEMPT_THRESHOLD: Duration = Duration::from_secs(15 * 60);

/// Everything a render function may read for one frame.
pub struct RenderCtx<'a> {
    pub snapshot: &'a FrameSnapshot,
    pub loops: &'a LoopStates,
    pub jobs: &'a [ActiveJob],
    pub resumable: &'a [ResumableTicket],
    pub now_ms: i64,
}

/// A declarative workflow: an optional frame-boundary hook (the scheduler
/// bridge lives here) plus the pure render function.
#[async_trait]
pub trait WorkflowDef: Send + Sync {
    async fn before_frame(&self, _ctx: &RenderCtx<'_>) -> DomainResult<()> {
        Ok(())
    }

    fn render(&self, ctx: &RenderCtx<'_>) -> DomainResult<Node>;
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { node_id: String },
    Cancelled,
}

/// Structured end-of-run report.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub landed: Vec<String>,
    /// Evicted tickets with their last eviction reason.
    pub evicted: Vec<(String, String)>,
    pub passes: i64,
    pub failed_tasks: Vec<String>,
}

pub struct Engine {
    run_id: String,
    store: Arc<dyn OutputStore>,
    queue: Arc<dyn JobQueue>,
    catalog: Arc<SchemaCatalog>,
    invoker: Arc<AgentInvoker>,
    workflow: Arc<dyn WorkflowDef>,
    attempts: Option<Arc<AttemptLog>>,
    workspaces: Option<Arc<WorkspaceManager>>,
    max_concurrency: usize,
    cancel: CancellationToken,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        store: Arc<dyn OutputStore>,
        queue: Arc<dyn JobQueue>,
        catalog: Arc<SchemaCatalog>,
        invoker: Arc<AgentInvoker>,
        workflow: Arc<dyn WorkflowDef>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            queue,
            catalog,
            invoker,
            workflow,
            attempts: None,
            workspaces: None,
            max_concurrency,
            cancel,
        }
    }

    pub fn with_attempt_log(mut self, attempts: Arc<AttemptLog>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_workspaces(mut self, workspaces: Arc<WorkspaceManager>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    /// Drive the workflow to a fixed point.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(&self) -> DomainResult<RunReport> {
        self.recover().await?;
        let resumable = scan_resumable(self.store.as_ref(), &self.run_id).await?;

        let mut loops = LoopStates::default();
        let mut failed: HashSet<(String, i64)> = HashSet::new();
        let mut compute_failures: HashMap<(String, i64), u32> = HashMap::new();
        let mut idle_frames = 0u32;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }

            let snapshot =
                FrameSnapshot::load(self.store.as_ref(), &self.catalog, &self.run_id).await?;

            // Frame-boundary queue reconciliation, then re-read the queue.
            let jobs = self.queue.active().await?;
            let ctx = RenderCtx {
                snapshot: &snapshot,
                loops: &loops,
                jobs: &jobs,
                resumable: &resumable,
                now_ms: Utc::now().timestamp_millis(),
            };
            self.workflow.before_frame(&ctx).await?;
            let jobs = self.queue.active().await?;

            let ctx = RenderCtx {
                snapshot: &snapshot,
                loops: &loops,
                jobs: &jobs,
                resumable: &resumable,
                now_ms: Utc::now().timestamp_millis(),
            };
            let tree = self.workflow.render(&ctx)?;
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!(snapshot = %to_xml(&tree, &loops), "Rendered tree");
            }

            let sched = schedule(
                &tree,
                &ScheduleInput {
                    snapshot: &snapshot,
                    loops: &loops,
                    failed: &failed,
                    max_concurrency: self.max_concurrency,
                },
            )?;

            if let Some(fatal) = sched
                .failed_tasks
                .iter()
                .find(|d| !d.continue_on_fail)
            {
                error!(node_id = %fatal.node_id, "Unrecoverable task failure");
                break RunOutcome::Failed {
                    node_id: fatal.node_id.clone(),
                };
            }

            if sched.runnable.is_empty() && sched.advances.is_empty() {
                if jobs.is_empty() {
                    info!("No runnable tasks, no advances, no active jobs; run complete");
                    break RunOutcome::Completed;
                }
                // Active jobs that no rendered task covers are orphaned; a
                // second identical frame cannot make progress.
                idle_frames += 1;
                if idle_frames >= 3 {
                    warn!(
                        orphaned = jobs.len(),
                        "Frames are idle with active jobs remaining; terminating"
                    );
                    break RunOutcome::Completed;
                }
                continue;
            }
            idle_frames = 0;

            debug!(
                runnable = sched.runnable.len(),
                advances = sched.advances.len(),
                active_jobs = jobs.len(),
                "Dispatching frame"
            );

            let fatal = self
                .dispatch_frame(sched.runnable, &mut failed, &mut compute_failures)
                .await?;
            if let Some(node_id) = fatal {
                break RunOutcome::Failed { node_id };
            }

            for loop_id in &sched.advances {
                loops.advance(loop_id);
                info!(loop_id = %loop_id, iteration = loops.iteration(loop_id), "Loop advanced");
            }
        };

        self.report(outcome, &loops, &failed).await
    }

    /// Startup recovery: stale attempts revert to pending and orphaned
    /// workspace paths are reaped.
    async fn recover(&self) -> DomainResult<()> {
        if let Some(ref attempts) = self.attempts {
            let recovered = attempts.recover_stale(STALE_ATTEMPT_THRESHOLD).await?;
            if recovered > 0 {
                warn!(recovered, "Recovered stale attempts from a previous run");
            }
        }
        if let Some(ref workspaces) = self.workspaces {
            let keep: Vec<String> = self
                .queue
                .active()
                .await?
                .into_iter()
                .map(|job| job.ticket_id.unwrap_or(job.job_id))
                .collect();
            workspaces
                .reap_orphans(&keep, STALE_ATTEMPT_THRESHOLD)
                .await?;
        }
        Ok(())
    }

    /// Execute every runnable task of the frame and await them all.
    /// Returns the node id of a fatal (non-`continueOnFail`) failure.
    async fn dispatch_frame(
        &self,
        runnable: Vec<TaskDescriptor>,
        failed: &mut HashSet<(String, i64)>,
        compute_failures: &mut HashMap<(String, i64), u32>,
    ) -> DomainResult<Option<String>> {
        let mut set: JoinSet<(TaskDescriptor, DomainResult<()>)> = JoinSet::new();

        for descriptor in runnable {
            if let Some(ref attempts) = self.attempts {
                let prior = compute_failures
                    .get(&(descriptor.node_id.clone(), descriptor.iteration))
                    .copied()
                    .unwrap_or(0);
                attempts
                    .start(
                        &self.run_id,
                        &descriptor.node_id,
                        descriptor.iteration,
                        prior as i64 + 1,
                    )
                    .await?;
            }

            let cwd = match descriptor.workspace_id {
                Some(ref workspace_id) => match self.workspaces {
                    Some(ref workspaces) => Some(workspaces.ensure(workspace_id, None).await?),
                    None => {
                        warn!(workspace = %workspace_id, "No workspace manager configured");
                        None
                    }
                },
                None => None,
            };

            let run_id = self.run_id.clone();
            let store = self.store.clone();
            let catalog = self.catalog.clone();
            let invoker = self.invoker.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let result =
                    execute_task(&descriptor, run_id, store, catalog, invoker, cwd, cancel).await;
                (descriptor, result)
            });
        }

        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            let (descriptor, result) = joined
                .map_err(|e| DomainError::ExecutionFailed(format!("Task panicked: {}", e)))?;
            let key = (descriptor.node_id.clone(), descriptor.iteration);
            match result {
                Ok(()) => {
                    if let Some(ref attempts) = self.attempts {
                        attempts
                            .finish(&self.run_id, &descriptor.node_id, descriptor.iteration)
                            .await?;
                    }
                }
                Err(DomainError::Cancelled) => {
                    // The node reverts to pending; the cancellation check at
                    // the top of the next frame ends the run.
                    if let Some(ref attempts) = self.attempts {
                        attempts
                            .cancel(&self.run_id, &descriptor.node_id, descriptor.iteration)
                            .await?;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(node_id = %descriptor.node_id, error = %e, "Task failed");
                    if let Some(ref attempts) = self.attempts {
                        attempts
                            .fail(&self.run_id, &descriptor.node_id, descriptor.iteration)
                            .await?;
                    }
                    let exhausted = match descriptor.action {
                        // The invoker consumed the whole retry budget.
                        TaskAction::Agent { .. } => true,
                        _ => {
                            let count = compute_failures.entry(key.clone()).or_insert(0);
                            *count += 1;
                            *count > descriptor.retries
                        }
                    };
                    if exhausted {
                        failed.insert(key);
                        if !descriptor.continue_on_fail && fatal.is_none() {
                            fatal = Some(descriptor.node_id.clone());
                        }
                    }
                }
            }
        }
        Ok(fatal)
    }

    /// Assemble the user-visible report from the final store state.
    async fn report(
        &self,
        outcome: RunOutcome,
        loops: &LoopStates,
        failed: &HashSet<(String, i64)>,
    ) -> DomainResult<RunReport> {
        let snapshot =
            FrameSnapshot::load(self.store.as_ref(), &self.catalog, &self.run_id).await?;

        let mut tickets: Vec<String> = Vec::new();
        for (node_id, _, _) in snapshot.scan("land") {
            if let Some((ticket, _)) = node_id.split_once(':') {
                if !tickets.iter().any(|t| t.as_str() == ticket) {
                    tickets.push(ticket.to_string());
                }
            }
        }

        let mut landed = Vec::new();
        let mut evicted = Vec::new();
        for ticket in tickets {
            if crate::services::pipeline::is_landed(&snapshot, &ticket) {
                landed.push(ticket);
            } else if let Some(payload) =
                crate::services::pipeline::landing_payload(&snapshot, &ticket)
            {
                let reason = payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                evicted.push((ticket, reason));
            }
        }

        Ok(RunReport {
            outcome,
            landed,
            evicted,
            passes: loops.max_iteration(),
            failed_tasks: failed.iter().map(|(node, _)| node.clone()).collect(),
        })
    }
}

/// Execute a single task and persist its validated output.
async fn execute_task(
    descriptor: &TaskDescriptor,
    run_id: String,
    store: Arc<dyn OutputStore>,
    catalog: Arc<SchemaCatalog>,
    invoker: Arc<AgentInvoker>,
    cwd: Option<std::path::PathBuf>,
    cancel: CancellationToken,
) -> DomainResult<()> {
    let schema = catalog.get(&descriptor.schema_key)?;

    let value = match &descriptor.action {
        TaskAction::Agent { agents, prompt } => {
            invoker
                .invoke(
                    &AgentTaskSpec {
                        agents: agents.clone(),
                        retries: descriptor.retries,
                        timeout: descriptor.timeout,
                    },
                    prompt,
                    schema,
                    cwd,
                    cancel,
                )
                .await?
        }
        TaskAction::Compute(callback) => {
            let future = callback(ComputeCtx {
                run_id: run_id.clone(),
                node_id: descriptor.node_id.clone(),
                iteration: descriptor.iteration,
                cancel: cancel.clone(),
            });
            match timeout(descriptor.timeout, cancel.run_until_cancelled(future)).await {
                Err(_) => return Err(DomainError::Timeout(descriptor.timeout.as_secs())),
                Ok(None) => return Err(DomainError::Cancelled),
                Ok(Some(result)) => result?,
            }
        }
        TaskAction::Static(value) => value.clone(),
    };

    store
        .put(
            &descriptor.schema_key,
            &OutputRow::new(run_id, descriptor.node_id.clone(), descriptor.iteration, value),
        )
        .await
}
