//! Reconciler: flattens a rendered tree into task descriptors plus an
//! XML-like snapshot of the structure.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::services::tree::{LoopStates, Node, TaskAction, TaskSpec};

/// A task descriptor: one schedulable leaf with its resolved bindings.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub node_id: String,
    pub schema_key: String,
    pub action: TaskAction,
    pub retries: u32,
    pub timeout: Duration,
    pub continue_on_fail: bool,
    pub skip: bool,
    /// Iteration of the nearest enclosing loop, 0 outside any loop.
    pub iteration: i64,
    pub loop_id: Option<String>,
    pub workspace_id: Option<String>,
    /// Nearest enclosing concurrency group.
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct WalkCtx {
    iteration: i64,
    loop_id: Option<String>,
    workspace_id: Option<String>,
    group: Option<String>,
}

fn descriptor_from(spec: &TaskSpec, ctx: &WalkCtx) -> TaskDescriptor {
    TaskDescriptor {
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
    }
}

/// Flatten the tree into an ordered list of task descriptors.
///
/// Fails when two tasks share a node id within the render.
pub fn collect_descriptors(root: &Node, loops: &LoopStates) -> DomainResult<Vec<TaskDescriptor>> {
    let mut out = Vec::new();
    walk(root, &WalkCtx::default(), loops, &mut out);

    let mut seen = HashSet::new();
    for descriptor in &out {
        if !seen.insert(descriptor.node_id.as_str()) {
            return Err(DomainError::ValidationFailed(format!(
                "Duplicate node id in render: {}",
                descriptor.node_id
            )));
        }
    }
    Ok(out)
}

fn walk(node: &Node, ctx: &WalkCtx, loops: &LoopStates, out: &mut Vec<TaskDescriptor>) {
    match node {
        Node::Workflow { children, .. } | Node::Sequence { children } => {
            for child in children {
                walk(child, ctx, loops, out);
            }
        }
        Node::Parallel { group, children, .. } | Node::MergeQueue { group, children } => {
            let ctx = WalkCtx {
                group: Some(group.clone()),
                ..ctx.clone()
            };
            for child in children {
                walk(child, &ctx, loops, out);
            }
        }
        Node::Loop { id, children, .. } => {
            let ctx = WalkCtx {
                iteration: loops.iteration(id),
                loop_id: Some(id.clone()),
                ..ctx.clone()
            };
            for child in children {
                walk(child, &ctx, loops, out);
            }
        }
        Node::Branch {
            cond,
            when_true,
            when_false,
        } => {
            let active = if *cond { when_true } else { when_false };
            walk(active, ctx, loops, out);
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
                walk(child, &ctx, loops, out);
            }
        }
        Node::Task(spec) => out.push(descriptor_from(spec, ctx)),
    }
}

/// Render the tree structure as indented XML, for the scheduler prompt and
/// frame logs.
pub fn to_xml(root: &Node, loops: &LoopStates) -> String {
    let mut buf = String::new();
    write_xml(root, loops, 0, &mut buf);
    buf
}

fn write_xml(node: &Node, loops: &LoopStates, depth: usize, buf: &mut String) {
    let pad = "  ".repeat(depth);
    match node {
        Node::Workflow { name, children } => {
            let _ = writeln!(buf, "{}<workflow name=\"{}\">", pad, name);
            for child in children {
                write_xml(child, loops, depth + 1, buf);
            }
            let _ = writeln!(buf, "{}</workflow>", pad);
        }
        Node::Sequence { children } => {
            let _ = writeln!(buf, "{}<sequence>", pad);
            for child in children {
                write_xml(child, loops, depth + 1, buf);
            }
            let _ = writeln!(buf, "{}</sequence>", pad);
        }
        Node::Parallel {
            group,
            max_concurrency,
            children,
        } => {
            let _ = writeln!(
                buf,
                "{}<parallel group=\"{}\" max=\"{}\">",
                pad, group, max_concurrency
            );
            for child in children {
                write_xml(child, loops, depth + 1, buf);
            }
            let _ = writeln!(buf, "{}</parallel>", pad);
        }
        Node::MergeQueue { group, children } => {
            let _ = writeln!(buf, "{}<merge-queue group=\"{}\">", pad, group);
            for child in children {
                write_xml(child, loops, depth + 1, buf);
            }
            let _ = writeln!(buf, "{}</merge-queue>", pad);
        }
        Node::Loop {
            id,
            until,
            max_iterations,
            children,
            ..
        } => {
            let _ = writeln!(
                buf,
                "{}<loop id=\"{}\" iteration=\"{}\" until=\"{}\" max=\"{}\">",
                pad,
                id,
                loops.iteration(id),
                until,
                max_iterations
            );
            for child in children {
                write_xml(child, loops, depth + 1, buf);
            }
            let _ = writeln!(buf, "{}</loop>", pad);
        }
        Node::Branch {
            cond,
            when_true,
            when_false,
        } => {
            let _ = writeln!(buf, "{}<branch taken=\"{}\">", pad, cond);
            write_xml(when_true, loops, depth + 1, buf);
            write_xml(when_false, loops, depth + 1, buf);
            let _ = writeln!(buf, "{}</branch>", pad);
        }
        Node::Worktree {
            workspace_id,
            children,
        } => {
            let _ = writeln!(buf, "{}<worktree workspace=\"{}\">", pad, workspace_id);
            for child in children {
                write_xml(child, loops, depth + 1, buf);
            }
            let _ = writeln!(buf, "{}</worktree>", pad);
        }
        Node::Task(spec) => {
            let _ = writeln!(
                buf,
                "{}<task id=\"{}\" schema=\"{}\" skip=\"{}\"/>",
                pad, spec.id, spec.schema_key, spec.skip
            );
        }
    }
}
