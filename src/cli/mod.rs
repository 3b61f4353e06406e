//! CLI front-end: argument parsing, wiring, and the run command.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::domain::ports::ReviewGate;
use crate::domain::schema::SchemaCatalog;
use crate::infrastructure::agent::{AgentInvoker, AgentReviewGate, SubprocessAgentExecutor};
use crate::infrastructure::database::{
    AttemptLog, DatabaseConnection, SqliteJobQueue, SqliteOutputStore,
};
use crate::infrastructure::vcs::{JjVcs, WorkspaceManager};
use crate::services::config::Config;
use crate::services::engine::Engine;
use crate::services::merge_queue::{MergeCoordinator, MergeQueueSettings};
use crate::services::prompts::DefaultTemplates;
use crate::services::workflow::SuperRalphWorkflow;

#[derive(Parser)]
#[command(name = "ralph", about = "Multi-agent AI development orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start (or resume) a run against the configured repository.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "ralph.toml")]
        config: PathBuf,
        /// Natural-language description of the work.
        #[arg(short, long, default_value = "")]
        prompt: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing();
    match cli.command {
        Commands::Run { config, prompt } => run_workflow(&config, prompt).await,
    }
}

async fn run_workflow(config_path: &PathBuf, prompt: String) -> Result<()> {
    let config = Arc::new(Config::load(config_path).context("loading configuration")?);
    let run_id = format!("run-{}", Uuid::new_v4());
    info!(run_id = %run_id, project = %config.project_name, "Starting run");

    let catalog = Arc::new(SchemaCatalog::default());
    let db = DatabaseConnection::new(&config.database_url)
        .await
        .context("opening database")?;
    db.bootstrap(&catalog).await.context("bootstrapping schema")?;
    db.register_run(&run_id).await?;

    let store = Arc::new(SqliteOutputStore::new(db.pool().clone(), catalog.clone()));
    let queue = Arc::new(SqliteJobQueue::new(db.pool().clone()));
    let attempts = Arc::new(AttemptLog::new(db.pool().clone()));

    let vcs = Arc::new(JjVcs::new(config.vcs_bin.clone(), config.repo_root.clone()));
    let workspaces = Arc::new(WorkspaceManager::new(vcs.clone(), config.tmp_root()));

    let invoker = Arc::new(AgentInvoker::new(
        Arc::new(SubprocessAgentExecutor::new()),
        config.agents.clone(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    // The agent flagged is_merge_queue reviews rebased entries before CI;
    // without one the queue lands on CI alone.
    let review_gate = AgentReviewGate::from_pool(
        invoker.clone(),
        &config.agents,
        config.task_retries,
        std::time::Duration::from_secs(config.agent_timeout_secs),
        cancel.clone(),
    )
    .map(|gate| Arc::new(gate) as Arc<dyn ReviewGate>);

    let coordinator = Arc::new(MergeCoordinator::new(
        vcs.clone(),
        workspaces.clone(),
        review_gate,
        store.clone(),
        run_id.clone(),
        MergeQueueSettings {
            main_branch: config.main_branch.clone(),
            max_depth: config.max_speculative_depth,
            ordering: config.ordering_strategy,
            post_land_checks: config.post_land_checks.clone(),
            push_retries: 3,
        },
    ));

    let workflow = Arc::new(SuperRalphWorkflow::new(
        config.clone(),
        prompt,
        queue.clone(),
        invoker.clone(),
        coordinator,
        Arc::new(DefaultTemplates),
        catalog.clone(),
    ));

    let engine = Engine::new(
        run_id,
        store,
        queue,
        catalog,
        invoker,
        workflow,
        config.max_concurrency,
        cancel,
    )
    .with_attempt_log(attempts)
    .with_workspaces(workspaces);

    let report = engine.run().await.context("engine run")?;

    println!("Run {:?} after {} passes", report.outcome, report.passes);
    if !report.landed.is_empty() {
        println!("Landed: {}", report.landed.join(", "));
    }
    for (ticket, reason) in &report.evicted {
        println!("Evicted: {} ({})", ticket, reason);
    }
    for node in &report.failed_tasks {
        println!("Failed task: {}", node);
    }

    db.close().await;
    Ok(())
}
