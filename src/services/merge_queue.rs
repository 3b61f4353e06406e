//! Speculative merge-queue coordinator.
//!
//! Serializes landing of tier-complete tickets onto the mainline: stacked
//! rebase of a speculative window, an optional post-rebase semantic review
//! gate, parallel CI in ephemeral workspaces, fast-forward to the deepest
//! green entry, and structured eviction for everything that fails.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    EvictionContext, EvictionReason, LandRecord, MergeEntry, OutputRow, Stage, Ticket,
    stage_node_id,
};
use crate::domain::ports::{OutputStore, ReviewGate, ReviewRequest, Vcs};
use crate::infrastructure::vcs::{bookmark_revset, WorkspaceManager};
use crate::services::eviction::EvictionContextBuilder;

/// How ready tickets are ordered into the speculative window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingStrategy {
    /// critical > high > medium > low, tie-broken on enqueue sequence.
    Priority,
    /// Snapshot position.
    TicketOrder,
    /// Iteration of the terminal stage, then enqueue sequence.
    ReportCompleteFifo,
}

impl Default for OrderingStrategy {
    fn default() -> Self {
        OrderingStrategy::Priority
    }
}

/// A tier-complete, not-yet-landed ticket submitted to the queue.
#[derive(Debug, Clone)]
pub struct ReadyTicket {
    pub ticket: Ticket,
    /// Snapshot index at submission.
    pub enqueue_seq: usize,
    /// Iteration of the tier's terminal stage row.
    pub report_iteration: i64,
}

/// Coordinator tuning, from configuration.
#[derive(Debug, Clone)]
pub struct MergeQueueSettings {
    pub main_branch: String,
    /// Speculative window depth D.
    pub max_depth: usize,
    pub ordering: OrderingStrategy,
    pub post_land_checks: Vec<String>,
    pub push_retries: u32,
}

impl Default for MergeQueueSettings {
    fn default() -> Self {
        Self {
            main_branch: "main".to_string(),
            max_depth: 3,
            ordering: OrderingStrategy::Priority,
            post_land_checks: Vec::new(),
            push_retries: 3,
        }
    }
}

struct PendingEntry {
    ready: ReadyTicket,
    invalidated: i64,
    waiters: Vec<oneshot::Sender<MergeEntry>>,
}

#[derive(Default)]
struct CoordinatorState {
    pending: HashMap<String, PendingEntry>,
    resolved: HashMap<String, (i64, MergeEntry)>,
}

/// Per-run merge coordinator. `pending → resolved{landed|evicted}`; a
/// re-submission at a higher report iteration reopens the entry with a fresh
/// waiter list. Every waiter receives exactly one outcome.
pub struct MergeCoordinator {
    vcs: Arc<dyn Vcs>,
    workspaces: Arc<WorkspaceManager>,
    eviction: EvictionContextBuilder,
    review_gate: Option<Arc<dyn ReviewGate>>,
    store: Arc<dyn OutputStore>,
    run_id: String,
    settings: MergeQueueSettings,
    state: Mutex<CoordinatorState>,
}

impl MergeCoordinator {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        workspaces: Arc<WorkspaceManager>,
        review_gate: Option<Arc<dyn ReviewGate>>,
        store: Arc<dyn OutputStore>,
        run_id: impl Into<String>,
        settings: MergeQueueSettings,
    ) -> Self {
        let eviction = EvictionContextBuilder::new(vcs.clone(), settings.main_branch.clone());
        Self {
            vcs,
            workspaces,
            eviction,
            review_gate,
            store,
            run_id: run_id.into(),
            settings,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Admit a ready ticket without waiting for its outcome.
    pub async fn admit(&self, ready: ReadyTicket) {
        let mut state = self.state.lock().await;
        Self::admit_locked(&mut state, ready);
    }

    /// Admit a ready ticket and receive its (single) resolution.
    pub async fn enqueue(&self, ready: ReadyTicket) -> oneshot::Receiver<MergeEntry> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        let ticket_id = ready.ticket.id.clone();
        if let Some((resolved_at, entry)) = state.resolved.get(&ticket_id) {
            if *resolved_at >= ready.report_iteration {
                let _ = tx.send(entry.clone());
                return rx;
            }
        }
        Self::admit_locked(&mut state, ready);
        if let Some(pending) = state.pending.get_mut(&ticket_id) {
            pending.waiters.push(tx);
        }
        rx
    }

    fn admit_locked(state: &mut CoordinatorState, ready: ReadyTicket) {
        let ticket_id = ready.ticket.id.clone();
        if let Some((resolved_at, _)) = state.resolved.get(&ticket_id) {
            if *resolved_at >= ready.report_iteration {
                return;
            }
            // Higher-iteration re-enqueue reopens the entry.
            state.resolved.remove(&ticket_id);
        }
        match state.pending.get_mut(&ticket_id) {
            Some(pending) => {
                if ready.report_iteration > pending.ready.report_iteration {
                    pending.ready = ready;
                }
            }
            None => {
                state.pending.insert(
                    ticket_id,
                    PendingEntry {
                        ready,
                        invalidated: 0,
                        waiters: Vec::new(),
                    },
                );
            }
        }
    }

    fn order(&self, entries: Vec<ReadyTicket>) -> Vec<ReadyTicket> {
        order_ready(self.settings.ordering, entries)
    }

    /// Process one round: stack, review, verify, land, evict.
    ///
    /// Returns the entries resolved this round; unresolved submissions stay
    /// pending for the next round.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn process_round(&self, iteration: i64) -> DomainResult<Vec<MergeEntry>> {
        let mut candidates = {
            let state = self.state.lock().await;
            self.order(
                state
                    .pending
                    .values()
                    .map(|p| p.ready.clone())
                    .collect::<Vec<_>>(),
            )
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        self.vcs.fetch().await?;

        let mut resolved = Vec::new();

        // Stacked rebase with restart on first conflict.
        let window: Vec<ReadyTicket> = loop {
            let window: Vec<ReadyTicket> = candidates
                .iter()
                .take(self.settings.max_depth)
                .cloned()
                .collect();
            if window.is_empty() {
                return Ok(resolved);
            }
            match self.stack(&window).await? {
                None => break window,
                Some((conflicted, reason, detail)) => {
                    let entry = self
                        .evict(&conflicted, reason, Some(detail), iteration)
                        .await?;
                    resolved.push(entry);
                    candidates.retain(|r| r.ticket.id != conflicted.ticket.id);
                }
            }
        };

        // Post-rebase semantic review gate.
        let mut window = window;
        if let Some(gate) = self.review_gate.clone() {
            if let Some(rejected_at) = self.review_window(&gate, &window, iteration, &mut resolved).await? {
                // Entries after the rejected one are invalidated and retried
                // next round; entries before it still land.
                for later in &window[rejected_at + 1..] {
                    self.invalidate(&later.ticket.id).await;
                }
                window.truncate(rejected_at);
            }
        }
        if window.is_empty() {
            return Ok(resolved);
        }

        // Parallel CI in ephemeral workspaces.
        let failure = self.verify_window(&window).await;
        match failure {
            None => {
                let landed = self
                    .land_prefix(&window, window.len(), iteration, &mut resolved)
                    .await?;
                if !landed {
                    return Ok(resolved);
                }
            }
            Some((k, output)) => {
                if k > 0 {
                    let landed = self
                        .land_prefix(&window, k, iteration, &mut resolved)
                        .await?;
                    if !landed {
                        return Ok(resolved);
                    }
                }
                let entry = self
                    .evict(&window[k], EvictionReason::CiFailed, Some(output), iteration)
                    .await?;
                resolved.push(entry);
                for later in &window[k + 1..] {
                    self.invalidate(&later.ticket.id).await;
                }
            }
        }

        Ok(resolved)
    }

    /// Rebase each window entry onto its predecessor. `None` on success,
    /// otherwise the conflicted entry with its diagnostics.
    async fn stack(
        &self,
        window: &[ReadyTicket],
    ) -> DomainResult<Option<(ReadyTicket, EvictionReason, String)>> {
        let mut destination = self.settings.main_branch.clone();
        for ready in window {
            let bookmark = ready.ticket.bookmark();
            match self.vcs.rebase(&bookmark, &destination).await {
                Ok(()) => destination = bookmark_revset(&bookmark),
                Err(DomainError::RebaseConflict { detail, .. }) => {
                    info!(ticket = %ready.ticket.id, "Rebase conflict, evicting");
                    return Ok(Some((ready.clone(), EvictionReason::RebaseConflict, detail)));
                }
                Err(e) => {
                    warn!(ticket = %ready.ticket.id, error = %e, "VCS failure during stacking");
                    return Ok(Some((
                        ready.clone(),
                        EvictionReason::WorkspaceError,
                        e.to_string(),
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Run the review gate over the window. Returns the index of the first
    /// rejected entry after pushing its eviction into `resolved`.
    async fn review_window(
        &self,
        gate: &Arc<dyn ReviewGate>,
        window: &[ReadyTicket],
        iteration: i64,
        resolved: &mut Vec<MergeEntry>,
    ) -> DomainResult<Option<usize>> {
        for (i, ready) in window.iter().enumerate() {
            let context = self.eviction.build(&ready.ticket.id).await?;
            let verdict = gate
                .review(ReviewRequest {
                    ticket_id: ready.ticket.id.clone(),
                    commit_log: context.branch_commits.clone(),
                    summary_diff: context.summary_diff.clone(),
                    mainline_commits: context.mainline_commits.clone(),
                })
                .await?;
            if !verdict.approved {
                info!(ticket = %ready.ticket.id, "Review gate rejected entry");
                let entry = self
                    .evict(
                        ready,
                        EvictionReason::ReviewFailed,
                        Some(verdict.findings.join("\n")),
                        iteration,
                    )
                    .await?;
                resolved.push(entry);
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Run post-land checks for every window entry concurrently.
    /// Returns the lowest-indexed failure with its output.
    async fn verify_window(&self, window: &[ReadyTicket]) -> Option<(usize, String)> {
        if self.settings.post_land_checks.is_empty() {
            return None;
        }
        let mut set = JoinSet::new();
        for (i, ready) in window.iter().enumerate() {
            let ticket_id = ready.ticket.id.clone();
            let bookmark = ready.ticket.bookmark();
            let checks = self.settings.post_land_checks.clone();
            let workspaces = self.workspaces.clone();
            set.spawn(async move {
                let result = run_checks(&workspaces, &ticket_id, &bookmark, &checks).await;
                (i, result)
            });
        }

        let mut lowest: Option<(usize, String)> = None;
        while let Some(joined) = set.join_next().await {
            let Ok((i, result)) = joined else { continue };
            if let Err(output) = result {
                if lowest.as_ref().map(|(k, _)| i < *k).unwrap_or(true) {
                    lowest = Some((i, output));
                }
            }
        }
        lowest
    }

    /// Fast-forward mainline to `window[count - 1]`, push, clean up landed
    /// entries. Returns false when the push failed and the prefix was evicted.
    async fn land_prefix(
        &self,
        window: &[ReadyTicket],
        count: usize,
        iteration: i64,
        resolved: &mut Vec<MergeEntry>,
    ) -> DomainResult<bool> {
        let target = &window[count - 1];
        self.vcs
            .set_bookmark(
                &self.settings.main_branch,
                &bookmark_revset(&target.ticket.bookmark()),
            )
            .await?;

        if !self.push_with_retries().await {
            for ready in &window[..count] {
                let entry = self
                    .evict(
                        ready,
                        EvictionReason::PushFailed,
                        Some("push failed after retries".to_string()),
                        iteration,
                    )
                    .await?;
                resolved.push(entry);
            }
            return Ok(false);
        }

        for ready in &window[..count] {
            let ticket_id = &ready.ticket.id;
            if let Err(e) = self.vcs.delete_bookmark(&ready.ticket.bookmark()).await {
                warn!(ticket = %ticket_id, error = %e, "Failed to delete landed bookmark");
            }
            if let Err(e) = self.workspaces.close_and_remove(ticket_id).await {
                warn!(ticket = %ticket_id, error = %e, "Failed to clean landed workspace");
            }
            let entry = self
                .resolve(ticket_id, MergeEntry::landed(ticket_id.clone()), iteration)
                .await?;
            resolved.push(entry);
            info!(ticket = %ticket_id, "Ticket landed");
        }
        Ok(true)
    }

    async fn push_with_retries(&self) -> bool {
        for attempt in 0..self.settings.push_retries.max(1) {
            match self.vcs.push_bookmark(&self.settings.main_branch).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "Push failed, re-fetching");
                    let _ = self.vcs.git_fetch().await;
                }
            }
        }
        false
    }

    async fn evict(
        &self,
        ready: &ReadyTicket,
        reason: EvictionReason,
        output: Option<String>,
        iteration: i64,
    ) -> DomainResult<MergeEntry> {
        let context = self
            .eviction
            .build(&ready.ticket.id)
            .await
            .unwrap_or_else(|_| EvictionContext::default());
        if let Err(e) = self.workspaces.close_and_remove(&ready.ticket.id).await {
            warn!(ticket = %ready.ticket.id, error = %e, "Failed eviction workspace cleanup");
        }
        let entry = MergeEntry::evicted(ready.ticket.id.clone(), reason, context, output);
        self.resolve(&ready.ticket.id, entry, iteration).await
    }

    async fn invalidate(&self, ticket_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.get_mut(ticket_id) {
            pending.invalidated += 1;
        }
    }

    /// Move an entry from pending to resolved: stamp the invalidation
    /// counter, persist the land row, publish to waiters.
    async fn resolve(
        &self,
        ticket_id: &str,
        mut entry: MergeEntry,
        iteration: i64,
    ) -> DomainResult<MergeEntry> {
        let (report_iteration, waiters) = {
            let mut state = self.state.lock().await;
            match state.pending.remove(ticket_id) {
                Some(pending) => {
                    entry.invalidated = pending.invalidated;
                    (pending.ready.report_iteration, pending.waiters)
                }
                None => (iteration, Vec::new()),
            }
        };

        let land = LandRecord::from(&entry);
        self.store
            .put(
                "land",
                &OutputRow::new(
                    self.run_id.clone(),
                    stage_node_id(ticket_id, Stage::Land),
                    iteration,
                    serde_json::to_value(&land)?,
                ),
            )
            .await?;

        {
            let mut state = self.state.lock().await;
            state
                .resolved
                .insert(ticket_id.to_string(), (report_iteration, entry.clone()));
        }
        for waiter in waiters {
            let _ = waiter.send(entry.clone());
        }
        Ok(entry)
    }

    /// Number of currently pending entries.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

/// Run the post-land checks inside an ephemeral workspace for one entry.
async fn run_checks(
    workspaces: &WorkspaceManager,
    ticket_id: &str,
    bookmark: &str,
    checks: &[String],
) -> Result<(), String> {
    let ws_id = format!("ci-{}", ticket_id);
    let path = match workspaces
        .ensure(&ws_id, Some(&bookmark_revset(bookmark)))
        .await
    {
        Ok(path) => path,
        Err(e) => return Err(format!("workspace: {}", e)),
    };

    let mut failure = None;
    for check in checks {
        let output = Command::new("sh")
            .arg("-c")
            .arg(check)
            .current_dir(&path)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => continue,
            Ok(output) => {
                failure = Some(format!(
                    "check `{}` failed: {}{}",
                    check,
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr),
                ));
                break;
            }
            Err(e) => {
                failure = Some(format!("check `{}` did not run: {}", check, e));
                break;
            }
        }
    }

    let _ = workspaces.close_and_remove(&ws_id).await;
    match failure {
        None => Ok(()),
        Some(output) => Err(output),
    }
}

/// Build the merge-queue result payload from one round's resolutions.
pub fn round_payload(entries: &[MergeEntry]) -> serde_json::Value {
    json!({ "entries": entries })
}

/// Epoch milliseconds helper for submissions.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Order ready tickets per the configured strategy.
pub fn order_ready(
    strategy: OrderingStrategy,
    mut entries: Vec<ReadyTicket>,
) -> Vec<ReadyTicket> {
    match strategy {
        OrderingStrategy::Priority => {
            entries.sort_by_key(|r| (r.ticket.priority.rank(), r.enqueue_seq));
        }
        OrderingStrategy::TicketOrder => {
            entries.sort_by_key(|r| r.enqueue_seq);
        }
        OrderingStrategy::ReportCompleteFifo => {
            entries.sort_by_key(|r| (r.report_iteration, r.enqueue_seq));
        }
    }
    entries
}
