//! The Super-Ralph workflow: interpret the configuration, then drive the
//! ralph loop of schedule → jobs → merge queue until every discovered ticket
//! lands.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    scheduler_agent, ActiveJob, JobType, Stage, Ticket, TicketSchedule,
};
use crate::domain::ports::JobQueue;
use crate::domain::schema::SchemaCatalog;
use crate::infrastructure::agent::AgentInvoker;
use crate::services::bridge;
use crate::services::config::Config;
use crate::services::context::FrameSnapshot;
use crate::services::engine::{RenderCtx, WorkflowDef};
use crate::services::merge_queue::{MergeCoordinator, ReadyTicket, round_payload};
use crate::services::pipeline;
use crate::services::prompts::{PromptKind, PromptTemplates};
use crate::services::tree::{
    compute, merge_queue, par, ralph, seq, task, workflow, worktree, MaxIterationsPolicy, Node,
};

/// Loop id of the ralph loop; all repeating jobs are scoped to it.
pub const RALPH_LOOP: &str = "ralph";

/// Node id of the scheduler agent task.
pub const SCHEDULE_NODE: &str = "schedule";

/// Node id of the merge-queue task.
pub const MERGE_NODE: &str = "merge-queue";

pub struct SuperRalphWorkflow {
    config: Arc<Config>,
    initial_prompt: String,
    queue: Arc<dyn JobQueue>,
    invoker: Arc<AgentInvoker>,
    coordinator: Arc<MergeCoordinator>,
    templates: Arc<dyn PromptTemplates>,
    catalog: Arc<SchemaCatalog>,
}

impl SuperRalphWorkflow {
    pub fn new(
        config: Arc<Config>,
        initial_prompt: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        invoker: Arc<AgentInvoker>,
        coordinator: Arc<MergeCoordinator>,
        templates: Arc<dyn PromptTemplates>,
        catalog: Arc<SchemaCatalog>,
    ) -> Self {
        Self {
            config,
            initial_prompt: initial_prompt.into(),
            queue,
            invoker,
            coordinator,
            templates,
            catalog,
        }
    }

    fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.config.agent_timeout_secs)
    }

    /// Fallback chain: the named agent first, then the rest of the pool.
    fn agent_chain(&self, primary: &str) -> Vec<String> {
        let mut chain = vec![primary.to_string()];
        for id in self.config.agents.keys() {
            if id != primary {
                chain.push(id.clone());
            }
        }
        chain
    }

    fn scheduler_chain(&self) -> Vec<String> {
        match scheduler_agent(&self.config.agents) {
            Some(primary) => self.agent_chain(primary),
            None => Vec::new(),
        }
    }

    fn render_prompt(&self, kind: PromptKind, props: Value, schema_key: &str) -> String {
        match self.catalog.get(schema_key) {
            Ok(schema) => self.templates.render(kind, &props, schema),
            Err(_) => props.to_string(),
        }
    }

    fn project_props(&self) -> Value {
        json!({
            "projectName": self.config.project_name,
            "repoRoot": self.config.repo_root,
            "specsPath": self.config.specs_path,
            "referenceFiles": self.config.reference_files,
            "buildCmds": self.config.build_cmds,
            "testCmds": self.config.test_cmds,
            "codeStyle": self.config.code_style,
            "reviewChecklist": self.config.review_checklist,
            "preLandChecks": self.config.pre_land_checks,
            "postLandChecks": self.config.post_land_checks,
            "operatorPrompt": self.initial_prompt,
        })
    }

    /// Compact ticket table for the scheduler prompt.
    fn ticket_table(&self, snapshot: &FrameSnapshot, tickets: &[Ticket]) -> Value {
        let rows: Vec<Value> = tickets
            .iter()
            .map(|ticket| {
                let current =
                    pipeline::current_stage(snapshot, &ticket.id, ticket.complexity_tier);
                let next = pipeline::next_stage(snapshot, &ticket.id, ticket.complexity_tier);
                json!({
                    "id": ticket.id,
                    "title": ticket.title,
                    "category": ticket.category,
                    "priority": ticket.priority,
                    "complexityTier": ticket.complexity_tier,
                    "currentStage": current.map(|s| s.as_str()),
                    "nextStage": next.map(|s| s.as_str()),
                    "tierComplete": pipeline::is_tier_complete(snapshot, &ticket.id, ticket.complexity_tier),
                    "landed": pipeline::is_landed(snapshot, &ticket.id),
                })
            })
            .collect();
        Value::Array(rows)
    }

    fn schedule_task(&self, ctx: &RenderCtx<'_>, tickets: &[Ticket]) -> Node {
        let free_slots = self
            .config
            .max_concurrency
            .saturating_sub(ctx.jobs.len());
        let props = json!({
            "project": self.project_props(),
            "freeSlots": free_slots,
            "tickets": self.ticket_table(ctx.snapshot, tickets),
            "activeJobs": ctx.jobs,
            "agentPool": self.config.agents,
            "rateLimitedAgents": self.invoker.rate_limits(),
            "resumableTickets": ctx.resumable.iter().map(|r| json!({
                "ticketId": r.ticket_id,
                "stage": r.stage.as_str(),
                "runId": r.run_id,
            })).collect::<Vec<_>>(),
        });
        task(
            SCHEDULE_NODE,
            "ticket_schedule",
            crate::services::tree::TaskAction::Agent {
                agents: self.scheduler_chain(),
                prompt: self.render_prompt(PromptKind::Schedule, props, "ticket_schedule"),
            },
        )
        .retries(self.config.task_retries)
        .timeout(self.agent_timeout())
        .skip_if(free_slots == 0)
        .build()
    }

    /// One rendered task per active job.
    fn job_node(
        &self,
        ctx: &RenderCtx<'_>,
        job: &ActiveJob,
        tickets: &[Ticket],
    ) -> Option<Node> {
        let job_type = match job.job_type() {
            Ok(job_type) => job_type,
            Err(_) => {
                warn!(job_id = %job.job_id, "Orphaned job with unknown type");
                return None;
            }
        };
        let agents = self.agent_chain(&job.agent_id);
        let retries = self.config.task_retries;
        let timeout = self.agent_timeout();

        let node = match job_type {
            JobType::Discovery => {
                let props = json!({
                    "project": self.project_props(),
                    "knownTickets": tickets.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
                    "goals": ctx.snapshot.output_maybe("interpret_config", "interpret-config", 0),
                });
                worktree(
                    job.job_id.clone(),
                    vec![task(
                        job.job_id.clone(),
                        "discover",
                        crate::services::tree::TaskAction::Agent {
                            agents,
                            prompt: self.render_prompt(PromptKind::Discovery, props, "discover"),
                        },
                    )
                    .retries(retries)
                    .timeout(timeout)
                    .build()],
                )
            }
            JobType::ProgressUpdate => {
                let props = json!({
                    "tickets": self.ticket_table(ctx.snapshot, tickets),
                    "activeJobs": ctx.jobs,
                });
                task(
                    job.job_id.clone(),
                    "progress",
                    crate::services::tree::TaskAction::Agent {
                        agents,
                        prompt: self.render_prompt(PromptKind::Progress, props, "progress"),
                    },
                )
                .retries(retries)
                .timeout(timeout)
                .continue_on_fail()
                .build()
            }
            JobType::CodebaseReview => {
                let props = json!({
                    "project": self.project_props(),
                    "focus": job.focus_id,
                });
                worktree(
                    job.job_id.clone(),
                    vec![task(
                        job.job_id.clone(),
                        "category_review",
                        crate::services::tree::TaskAction::Agent {
                            agents,
                            prompt: self
                                .render_prompt(PromptKind::CategoryReview, props, "category_review"),
                        },
                    )
                    .retries(retries)
                    .timeout(timeout)
                    .continue_on_fail()
                    .build()],
                )
            }
            JobType::IntegrationTest => {
                let props = json!({
                    "project": self.project_props(),
                    "testCmds": self.config.test_cmds,
                });
                worktree(
                    job.job_id.clone(),
                    vec![task(
                        job.job_id.clone(),
                        "integration_test",
                        crate::services::tree::TaskAction::Agent {
                            agents,
                            prompt: self
                                .render_prompt(PromptKind::IntegrationTest, props, "integration_test"),
                        },
                    )
                    .retries(retries)
                    .timeout(timeout)
                    .continue_on_fail()
                    .build()],
                )
            }
            JobType::TicketStage(stage) => {
                let ticket_id = job.ticket_id.as_deref()?;
                let ticket = tickets.iter().find(|t| t.id == ticket_id)?;
                let eviction = match stage {
                    Stage::Research | Stage::Plan | Stage::Implement => {
                        pipeline::latest_eviction(ctx.snapshot, ticket_id)
                    }
                    _ => None,
                };
                let props = json!({
                    "project": self.project_props(),
                    "ticket": ticket,
                    "stage": stage.as_str(),
                    "priorStages": self.stage_outputs(ctx.snapshot, ticket),
                    "evictionContext": eviction,
                });
                let schema_key = stage.schema_key();
                worktree(
                    ticket_id.to_string(),
                    vec![task(
                        job.job_id.clone(),
                        schema_key,
                        crate::services::tree::TaskAction::Agent {
                            agents,
                            prompt: self
                                .render_prompt(PromptKind::Stage(stage), props, schema_key),
                        },
                    )
                    .retries(retries)
                    .timeout(timeout)
                    .continue_on_fail()
                    .build()],
                )
            }
        };
        Some(node)
    }

    /// Outputs of the ticket's earlier stages, for cross-stage data flow.
    fn stage_outputs(&self, snapshot: &FrameSnapshot, ticket: &Ticket) -> Value {
        let mut outputs = serde_json::Map::new();
        for stage in pipeline::tier_stages(ticket.complexity_tier) {
            let node_id = crate::domain::models::stage_node_id(&ticket.id, *stage);
            if let Some((payload, _)) = snapshot.latest(stage.schema_key(), &node_id) {
                outputs.insert(stage.as_str().to_string(), payload.clone());
            }
        }
        Value::Object(outputs)
    }

    fn ready_tickets(&self, snapshot: &FrameSnapshot, tickets: &[Ticket]) -> Vec<ReadyTicket> {
        tickets
            .iter()
            .enumerate()
            .filter(|(_, ticket)| {
                pipeline::is_tier_complete(snapshot, &ticket.id, ticket.complexity_tier)
                    && !pipeline::is_landed(snapshot, &ticket.id)
            })
            .map(|(index, ticket)| {
                let last = pipeline::final_stage(ticket.complexity_tier);
                let report_iteration = snapshot
                    .latest(
                        last.schema_key(),
                        &crate::domain::models::stage_node_id(&ticket.id, last),
                    )
                    .map(|(_, iteration)| iteration)
                    .unwrap_or(0);
                ReadyTicket {
                    ticket: ticket.clone(),
                    enqueue_seq: index,
                    report_iteration,
                }
            })
            .collect()
    }

    fn merge_task(&self, snapshot: &FrameSnapshot, tickets: &[Ticket]) -> Node {
        let ready = self.ready_tickets(snapshot, tickets);
        let skip = ready.is_empty();
        let coordinator = self.coordinator.clone();
        let action = compute(move |cctx| {
            let coordinator = coordinator.clone();
            let ready = ready.clone();
            async move {
                for entry in ready {
                    coordinator.admit(entry).await;
                }
                let entries = coordinator.process_round(cctx.iteration).await?;
                Ok(round_payload(&entries))
            }
        });
        task(MERGE_NODE, "merge_queue_result", action)
            .retries(0)
            .timeout(self.agent_timeout())
            .continue_on_fail()
            .skip_if(skip)
            .build()
    }

    fn interpret_task(&self) -> Node {
        let props = self.project_props();
        task(
            "interpret-config",
            "interpret_config",
            crate::services::tree::TaskAction::Agent {
                agents: self.scheduler_chain(),
                prompt: self.render_prompt(PromptKind::InterpretConfig, props, "interpret_config"),
            },
        )
        .retries(self.config.task_retries)
        .timeout(self.agent_timeout())
        .build()
    }
}

#[async_trait]
impl WorkflowDef for SuperRalphWorkflow {
    /// Frame boundary: reap completed jobs, then reconcile the latest
    /// schedule into the queue.
    async fn before_frame(&self, ctx: &RenderCtx<'_>) -> DomainResult<()> {
        let current_iteration = ctx.loops.iteration(RALPH_LOOP);
        bridge::reap(self.queue.as_ref(), ctx.snapshot, current_iteration).await?;

        let Some((payload, _)) = ctx.snapshot.latest("ticket_schedule", SCHEDULE_NODE) else {
            return Ok(());
        };
        let schedule: TicketSchedule = serde_json::from_value(payload.clone())?;
        self.invoker.note_rate_limits(&schedule.rate_limited_agents);

        let tickets = pipeline::tickets(ctx.snapshot);
        bridge::reconcile(
            self.queue.as_ref(),
            ctx.snapshot,
            &schedule,
            &tickets,
            current_iteration,
            ctx.now_ms,
        )
        .await?;
        Ok(())
    }

    fn render(&self, ctx: &RenderCtx<'_>) -> DomainResult<Node> {
        let tickets = pipeline::tickets(ctx.snapshot);
        let all_landed = !tickets.is_empty()
            && tickets
                .iter()
                .all(|ticket| pipeline::is_landed(ctx.snapshot, &ticket.id));

        let job_nodes: Vec<Node> = ctx
            .jobs
            .iter()
            .filter_map(|job| self.job_node(ctx, job, &tickets))
            .collect();

        Ok(workflow(
            "super-ralph",
            vec![
                self.interpret_task(),
                ralph(
                    RALPH_LOOP,
                    all_landed,
                    self.config.max_passes,
                    MaxIterationsPolicy::ReturnLast,
                    vec![seq(vec![
                        self.schedule_task(ctx, &tickets),
                        par("jobs", self.config.max_concurrency, job_nodes),
                        merge_queue("land", vec![self.merge_task(ctx.snapshot, &tickets)]),
                    ])],
                ),
            ],
        ))
    }
}
