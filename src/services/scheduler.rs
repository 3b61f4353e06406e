//! Scheduler: computes node states over the rendered tree and emits the
//! runnable set plus loop-advance signals, under per-group concurrency caps.

use std::collections::{HashMap, HashSet};

use crate::domain::errors::DomainResult;
use crate::services::context::FrameSnapshot;
use crate::services::reconciler::{collect_descriptors, TaskDescriptor};
use crate::services::tree::{LoopStates, MaxIterationsPolicy, Node, TaskSpec};

/// State of a node for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Finished,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::Pending)
    }
}

/// Frame inputs the scheduler reads.
pub struct ScheduleInput<'a> {
    pub snapshot: &'a FrameSnapshot,
    pub loops: &'a LoopStates,
    /// Nodes whose retry budget is exhausted, keyed by `(node_id, iteration)`.
    pub failed: &'a HashSet<(String, i64)>,
    pub max_concurrency: usize,
}

/// Ordered runnable set plus per-loop advance signals.
#[derive(Debug, Default)]
pub struct ScheduleOutput {
    pub runnable: Vec<TaskDescriptor>,
    pub advances: Vec<String>,
    /// Terminally-failed tasks visible in this render.
    pub failed_tasks: Vec<TaskDescriptor>,
}

struct Walker<'a> {
    input: &'a ScheduleInput<'a>,
    out: ScheduleOutput,
    group_counts: HashMap<String, usize>,
    group_caps: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
struct WalkCtx {
    iteration: i64,
    loop_id: Option<String>,
    workspace_id: Option<String>,
    group: Option<String>,
}

/// Compute the runnable set and advance signals for one frame.
pub fn schedule(root: &Node, input: &ScheduleInput<'_>) -> DomainResult<ScheduleOutput> {
    // Validates node-id uniqueness; descriptor list itself is rebuilt below
    // during the walk so ordering tracks container semantics.
    let descriptors = collect_descriptors(root, input.loops)?;

    let mut walker = Walker {
        input,
        out: ScheduleOutput::default(),
        group_counts: HashMap::new(),
        group_caps: HashMap::new(),
    };
    walker.walk(root, &WalkCtx::default());

    for descriptor in descriptors {
        if walker.task_state_for(&descriptor.node_id, descriptor.iteration, &descriptor) == NodeState::Failed {
            walker.out.failed_tasks.push(descriptor);
        }
    }
    Ok(walker.out)
}

impl<'a> Walker<'a> {
    /// Node state determination for a task leaf, evaluated top-down:
    /// skip predicate, existing output row, exhausted retry budget, pending.
    fn task_state(&self, spec: &TaskSpec, iteration: i64) -> NodeState {
        if spec.skip {
            return NodeState::Skipped;
        }
        if self
            .input
            .snapshot
            .output_maybe(&spec.schema_key, &spec.id, iteration)
            .is_some()
        {
            return NodeState::Finished;
        }
        if self
            .input
            .failed
            .contains(&(spec.id.clone(), iteration))
        {
            return NodeState::Failed;
        }
        NodeState::Pending
    }

    fn task_state_for(
        &self,
        node_id: &str,
        iteration: i64,
        descriptor: &TaskDescriptor,
    ) -> NodeState {
        if descriptor.skip {
            return NodeState::Skipped;
        }
        if self
            .input
            .snapshot
            .output_maybe(&descriptor.schema_key, node_id, iteration)
            .is_some()
        {
            return NodeState::Finished;
        }
        if self.input.failed.contains(&(node_id.to_string(), iteration)) {
            return NodeState::Failed;
        }
        NodeState::Pending
    }

    fn subtree_state(&self, node: &Node, ctx: &WalkCtx) -> NodeState {
        match node {
            Node::Task(spec) => self.task_state(spec, ctx.iteration),
            Node::Workflow { children, .. }
            | Node::Sequence { children }
            | Node::Parallel { children, .. }
            | Node::MergeQueue { children, .. }
            | Node::Worktree { children, .. } => self.aggregate(children, ctx),
            Node::Branch {
                cond,
                when_true,
                when_false,
            } => {
                let active = if *cond { when_true } else { when_false };
                self.subtree_state(active, ctx)
            }
            Node::Loop {
                id,
                until,
                max_iterations,
                on_max,
                ..
            } => {
                if *until {
                    return NodeState::Finished;
                }
                if self.input.loops.iteration(id) >= *max_iterations {
                    return match on_max {
                        MaxIterationsPolicy::Fail => NodeState::Failed,
                        MaxIterationsPolicy::ReturnLast => NodeState::Finished,
                    };
                }
                NodeState::Pending
            }
        }
    }

    fn aggregate(&self, children: &[Node], ctx: &WalkCtx) -> NodeState {
        let mut failed = false;
        for child in children {
            match self.subtree_state(child, ctx) {
                NodeState::Pending => return NodeState::Pending,
                NodeState::Failed => failed = true,
                _ => {}
            }
        }
        if failed {
            NodeState::Failed
        } else {
            NodeState::Finished
        }
    }

    fn walk(&mut self, node: &Node, ctx: &WalkCtx) {
        match node {
            Node::Workflow { children, .. } | Node::Sequence { children } => {
                // First non-terminal child only.
                for child in children {
                    if self.subtree_state(child, ctx).is_terminal() {
                        continue;
                    }
                    self.walk(child, ctx);
                    break;
                }
            }
            Node::Parallel {
                group,
                max_concurrency,
                children,
            } => {
                self.walk_group(group, *max_concurrency, children, ctx);
            }
            Node::MergeQueue { group, children } => {
                self.walk_group(group, 1, children, ctx);
            }
            Node::Loop { id, children, .. } => {
                if self.subtree_state(node, ctx).is_terminal() {
                    return;
                }
                let inner = WalkCtx {
                    iteration: self.input.loops.iteration(id),
                    loop_id: Some(id.clone()),
                    ..ctx.clone()
                };
                let all_terminal = children
                    .iter()
                    .all(|child| self.subtree_state(child, &inner).is_terminal());
                if all_terminal {
                    self.out.advances.push(id.clone());
                    return;
                }
                for child in children {
                    if self.subtree_state(child, &inner).is_terminal() {
                        continue;
                    }
                    self.walk(child, &inner);
                    break;
                }
            }
            Node::Branch {
                cond,
                when_true,
                when_false,
            } => {
                let active = if *cond { when_true } else { when_false };
                if !self.subtree_state(active, ctx).is_terminal() {
                    self.walk(active, ctx);
                }
            }
            Node::Worktree {
                workspace_id,
                children,
            } => {
                let ctx = WalkCtx {
                    workspace_id: Some(workspace_id.clone()),
                    ..ctx.clone()
                };
                for child in children {
                    if self.subtree_state(child, &ctx).is_terminal() {
                        continue;
                    }
                    self.walk(child, &ctx);
                    break;
                }
            }
            Node::Task(spec) => self.emit(spec, ctx),
        }
    }

    fn walk_group(&mut self, group: &str, cap: usize, children: &[Node], ctx: &WalkCtx) {
        self.group_caps.insert(group.to_string(), cap);
        let ctx = WalkCtx {
            group: Some(group.to_string()),
            ..ctx.clone()
        };
        for child in children {
            if self.subtree_state(child, &ctx).is_terminal() {
                continue;
            }
            self.walk(child, &ctx);
        }
    }

    fn emit(&mut self, spec: &TaskSpec, ctx: &WalkCtx) {
        if self.task_state(spec, ctx.iteration) != NodeState::Pending {
            return;
        }
        if self.out.runnable.len() >= self.input.max_concurrency {
            return;
        }
        if let Some(ref group) = ctx.group {
            let cap = self.group_caps.get(group).copied().unwrap_or(usize::MAX);
            let count = self.group_counts.entry(group.clone()).or_insert(0);
            if *count >= cap {
                return;
            }
            *count += 1;
        }
        self.out.runnable.push(TaskDescriptor {
            node_id: spec.id.clone(),
            schema_key: spec.schema_key.clone(),
            action: spec.action.clone(),
            retries: spec.retries,
            timeout: spec.timeout,
            continue_on_fail: spec.continue_on_fail,
            skip: spec.skip,
            iteration: ctx.iteration,
            loop_id: ctx.loop_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
            group: ctx.group.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tree::{
        merge_queue, par, ralph, seq, task, worktree, TaskAction,
    };
    use serde_json::json;

    fn leaf(id: &str) -> Node {
        task(id, "report", TaskAction::Static(json!({}))).build()
    }

    fn input<'a>(
        snapshot: &'a FrameSnapshot,
        loops: &'a LoopStates,
        failed: &'a HashSet<(String, i64)>,
    ) -> ScheduleInput<'a> {
        ScheduleInput {
            snapshot,
            loops,
            failed,
            max_concurrency: 6,
        }
    }

    fn done(snapshot: &mut FrameSnapshot, node: &str, iteration: i64) {
        snapshot.insert(
            "report",
            node,
            iteration,
            json!({"ticketId": "T", "summary": "s", "status": "complete"}),
        );
    }

    #[test]
    fn sequence_emits_first_pending_child_only() {
        let mut snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let failed = HashSet::new();
        let tree = seq(vec![leaf("a"), leaf("b")]);

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        let ids: Vec<&str> = out.runnable.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        done(&mut snapshot, "a", 0);
        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        let ids: Vec<&str> = out.runnable.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn parallel_caps_emission_per_group() {
        let snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let failed = HashSet::new();
        let tree = par("g", 2, vec![leaf("a"), leaf("b"), leaf("c")]);

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        assert_eq!(out.runnable.len(), 2);
    }

    #[test]
    fn merge_queue_cap_is_one() {
        let snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let failed = HashSet::new();
        let tree = merge_queue("mq", vec![leaf("a"), leaf("b")]);

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        assert_eq!(out.runnable.len(), 1);
    }

    #[test]
    fn skip_predicate_yields_skipped_terminal() {
        let snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let failed = HashSet::new();
        let tree = seq(vec![
            task("a", "report", TaskAction::Static(json!({})))
                .skip_if(true)
                .build(),
            leaf("b"),
        ]);

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        let ids: Vec<&str> = out.runnable.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn loop_advances_when_children_terminal_for_iteration() {
        let mut snapshot = FrameSnapshot::default();
        let mut loops = LoopStates::default();
        let failed = HashSet::new();
        let tree = ralph(
            "ralph",
            false,
            4,
            MaxIterationsPolicy::ReturnLast,
            vec![leaf("inner")],
        );

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        assert_eq!(out.runnable.len(), 1);
        assert!(out.advances.is_empty());

        done(&mut snapshot, "inner", 0);
        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        assert!(out.runnable.is_empty());
        assert_eq!(out.advances, vec!["ralph"]);

        // After the advance the child is pending again for iteration 1.
        loops.advance("ralph");
        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        assert_eq!(out.runnable.len(), 1);
        assert_eq!(out.runnable[0].iteration, 1);
    }

    #[test]
    fn loop_until_or_max_iterations_terminates() {
        let mut snapshot = FrameSnapshot::default();
        done(&mut snapshot, "inner", 0);
        let mut loops = LoopStates::default();
        let failed = HashSet::new();

        let done_tree = ralph(
            "ralph",
            true,
            4,
            MaxIterationsPolicy::ReturnLast,
            vec![leaf("inner")],
        );
        let out = schedule(&done_tree, &input(&snapshot, &loops, &failed)).unwrap();
        assert!(out.runnable.is_empty());
        assert!(out.advances.is_empty());

        for _ in 0..4 {
            loops.advance("ralph");
        }
        let maxed = ralph(
            "ralph",
            false,
            4,
            MaxIterationsPolicy::ReturnLast,
            vec![leaf("inner")],
        );
        let out = schedule(&maxed, &input(&snapshot, &loops, &failed)).unwrap();
        assert!(out.runnable.is_empty());
        assert!(out.advances.is_empty());
    }

    #[test]
    fn failed_budget_stops_dispatch_and_reports() {
        let snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let mut failed = HashSet::new();
        failed.insert(("a".to_string(), 0));
        let tree = seq(vec![leaf("a"), leaf("b")]);

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        let ids: Vec<&str> = out.runnable.iter().map(|d| d.node_id.as_str()).collect();
        // The failed child is terminal; the sequence moves on.
        assert_eq!(ids, vec!["b"]);
        assert_eq!(out.failed_tasks.len(), 1);
        assert_eq!(out.failed_tasks[0].node_id, "a");
    }

    #[test]
    fn global_cap_bounds_total_emission() {
        let snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let failed = HashSet::new();
        let children: Vec<Node> = (0..10).map(|i| leaf(&format!("t{}", i))).collect();
        let tree = par("g", 10, children);

        let mut inp = input(&snapshot, &loops, &failed);
        inp.max_concurrency = 3;
        let out = schedule(&tree, &inp).unwrap();
        assert_eq!(out.runnable.len(), 3);
    }

    #[test]
    fn worktree_children_are_sequenced() {
        let snapshot = FrameSnapshot::default();
        let loops = LoopStates::default();
        let failed = HashSet::new();
        let tree = worktree("T-1", vec![leaf("T-1:implement"), leaf("T-1:build-verify")]);

        let out = schedule(&tree, &input(&snapshot, &loops, &failed)).unwrap();
        let ids: Vec<&str> = out.runnable.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["T-1:implement"]);
    }
}
