//! The declarative component tree.
//!
//! A tagged-variant AST built fresh on every frame by the workflow's render
//! function. The scheduler walks it directly; the reconciler flattens it into
//! task descriptors.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::DomainResult;

/// Default wall-clock deadline for a task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Context handed to a compute callback at dispatch time.
#[derive(Debug, Clone)]
pub struct ComputeCtx {
    pub run_id: String,
    pub node_id: String,
    pub iteration: i64,
    pub cancel: CancellationToken,
}

/// A pure-compute task body. Captures whatever frame data it needs at render
/// time; receives only dispatch identifiers.
pub type ComputeFn =
    Arc<dyn Fn(ComputeCtx) -> BoxFuture<'static, DomainResult<Value>> + Send + Sync>;

/// What a task does when dispatched.
#[derive(Clone)]
pub enum TaskAction {
    /// Invoke an agent with a fallback chain and a fully-rendered prompt.
    Agent { agents: Vec<String>, prompt: String },
    /// Run a compute callback.
    Compute(ComputeFn),
    /// Validate and persist a static payload.
    Static(Value),
}

impl fmt::Debug for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::Agent { agents, .. } => {
                f.debug_struct("Agent").field("agents", agents).finish()
            }
            TaskAction::Compute(_) => f.write_str("Compute"),
            TaskAction::Static(value) => f.debug_tuple("Static").field(value).finish(),
        }
    }
}

/// A leaf task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub schema_key: String,
    pub action: TaskAction,
    pub retries: u32,
    pub timeout: Duration,
    pub continue_on_fail: bool,
    /// Skip predicate, evaluated at render time.
    pub skip: bool,
}

/// Policy when a loop reaches its iteration ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxIterationsPolicy {
    Fail,
    ReturnLast,
}

/// A node of the component tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// Root container; semantically a Sequence.
    Workflow { name: String, children: Vec<Node> },
    /// Children reach terminal state in declaration order.
    Sequence { children: Vec<Node> },
    /// All non-terminal children schedulable, up to the group cap.
    Parallel {
        group: String,
        max_concurrency: usize,
        children: Vec<Node>,
    },
    /// Ralph loop: children re-render for iteration `i + 1` once all children
    /// terminate at iteration `i`. The `until` predicate is evaluated at
    /// render time against the frame snapshot.
    Loop {
        id: String,
        until: bool,
        max_iterations: i64,
        on_max: MaxIterationsPolicy,
        children: Vec<Node>,
    },
    /// Exactly one arm is active; the predicate was evaluated at render.
    Branch {
        cond: bool,
        when_true: Box<Node>,
        when_false: Box<Node>,
    },
    Task(TaskSpec),
    /// Children execute with `cwd` bound to the workspace for this id.
    Worktree { workspace_id: String, children: Vec<Node> },
    /// A Parallel variant with effective concurrency of 1.
    MergeQueue { group: String, children: Vec<Node> },
}

/// Per-loop iteration counters, owned by the engine across frames.
#[derive(Debug, Clone, Default)]
pub struct LoopStates {
    iterations: HashMap<String, i64>,
}

impl LoopStates {
    pub fn iteration(&self, loop_id: &str) -> i64 {
        self.iterations.get(loop_id).copied().unwrap_or(0)
    }

    pub fn advance(&mut self, loop_id: &str) {
        *self.iterations.entry(loop_id.to_string()).or_insert(0) += 1;
    }

    /// Largest iteration counter across all loops; the run's pass count.
    pub fn max_iteration(&self) -> i64 {
        self.iterations.values().copied().max().unwrap_or(0)
    }
}

// --- Construction DSL ---

pub fn workflow(name: impl Into<String>, children: Vec<Node>) -> Node {
    Node::Workflow {
        name: name.into(),
        children,
    }
}

pub fn seq(children: Vec<Node>) -> Node {
    Node::Sequence { children }
}

pub fn par(group: impl Into<String>, max_concurrency: usize, children: Vec<Node>) -> Node {
    Node::Parallel {
        group: group.into(),
        max_concurrency,
        children,
    }
}

pub fn ralph(
    id: impl Into<String>,
    until: bool,
    max_iterations: i64,
    on_max: MaxIterationsPolicy,
    children: Vec<Node>,
) -> Node {
    Node::Loop {
        id: id.into(),
        until,
        max_iterations,
        on_max,
        children,
    }
}

pub fn branch(cond: bool, when_true: Node, when_false: Node) -> Node {
    Node::Branch {
        cond,
        when_true: Box::new(when_true),
        when_false: Box::new(when_false),
    }
}

pub fn worktree(workspace_id: impl Into<String>, children: Vec<Node>) -> Node {
    Node::Worktree {
        workspace_id: workspace_id.into(),
        children,
    }
}

pub fn merge_queue(group: impl Into<String>, children: Vec<Node>) -> Node {
    Node::MergeQueue {
        group: group.into(),
        children,
    }
}

/// Fluent builder for task leaves.
pub struct TaskBuilder {
    spec: TaskSpec,
}

pub fn task(id: impl Into<String>, schema_key: impl Into<String>, action: TaskAction) -> TaskBuilder {
    TaskBuilder {
        spec: TaskSpec {
            id: id.into(),
            schema_key: schema_key.into(),
            action,
            retries: 2,
            timeout: DEFAULT_TASK_TIMEOUT,
            continue_on_fail: false,
            skip: false,
        },
    }
}

impl TaskBuilder {
    pub fn retries(mut self, retries: u32) -> Self {
        self.spec.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    pub fn continue_on_fail(mut self) -> Self {
        self.spec.continue_on_fail = true;
        self
    }

    pub fn skip_if(mut self, skip: bool) -> Self {
        self.spec.skip = skip;
        self
    }

    pub fn build(self) -> Node {
        Node::Task(self.spec)
    }
}

/// Convenience: a compute action from an async closure.
pub fn compute<F, Fut>(f: F) -> TaskAction
where
    F: Fn(ComputeCtx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = DomainResult<Value>> + Send + 'static,
{
    TaskAction::Compute(Arc::new(move |ctx| {
        let future: BoxFuture<'static, DomainResult<Value>> = Box::pin(f(ctx));
        future
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_defaults() {
        let node = task("t", "report", TaskAction::Static(json!({}))).build();
        let Node::Task(spec) = node else {
            panic!("expected task");
        };
        assert_eq!(spec.retries, 2);
        assert_eq!(spec.timeout, DEFAULT_TASK_TIMEOUT);
        assert!(!spec.continue_on_fail);
        assert!(!spec.skip);
    }

    #[test]
    fn loop_states_advance() {
        let mut loops = LoopStates::default();
        assert_eq!(loops.iteration("ralph"), 0);
        loops.advance("ralph");
        loops.advance("ralph");
        assert_eq!(loops.iteration("ralph"), 2);
        assert_eq!(loops.iteration("other"), 0);
    }
}
