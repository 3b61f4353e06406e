//! Prompt templates: opaque `(props) → String` producers.
//!
//! The engine core treats prompt content as external; this default set keeps
//! the orchestration self-contained. Eviction artifacts present in the props
//! are injected verbatim.

use serde_json::Value;

use crate::domain::models::Stage;
use crate::domain::schema::Schema;

/// Which prompt to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    InterpretConfig,
    Schedule,
    Discovery,
    Progress,
    CategoryReview,
    IntegrationTest,
    Stage(Stage),
}

/// Opaque prompt producer.
pub trait PromptTemplates: Send + Sync {
    fn render(&self, kind: PromptKind, props: &Value, schema: &Schema) -> String;
}

/// Built-in plain-text templates.
pub struct DefaultTemplates;

impl DefaultTemplates {
    fn intro(kind: PromptKind) -> &'static str {
        match kind {
            PromptKind::InterpretConfig => {
                "Interpret the project configuration and operator prompt into run goals."
            }
            PromptKind::Schedule => {
                "You are the scheduler. Issue exactly as many jobs as there are free slots.\n\
                 Rules: load-balance across agents; advance each ticket stage by stage along\n\
                 its tier; never schedule two stages of one ticket; only schedule review-fix\n\
                 when a review reported severity above none; resumable tickets take priority\n\
                 over discovery; respect rate-limited agents."
            }
            PromptKind::Discovery => {
                "Survey the repository and the goals. Emit the tickets worth doing, each with\n\
                 an id, category, priority, and complexity tier."
            }
            PromptKind::Progress => "Summarize run progress: landed, in flight, blocked.",
            PromptKind::CategoryReview => {
                "Review the named category of the codebase and report findings with severity."
            }
            PromptKind::IntegrationTest => {
                "Run the integration test suite in the current workspace and report results."
            }
            PromptKind::Stage(Stage::Research) => {
                "Research this ticket in the current workspace: collect the facts an\n\
                 implementer needs, with relevant files and risks."
            }
            PromptKind::Stage(Stage::Plan) => {
                "Write a step-by-step implementation plan for this ticket."
            }
            PromptKind::Stage(Stage::Implement) => {
                "Implement this ticket in the current workspace. Commit your work to the\n\
                 ticket branch."
            }
            PromptKind::Stage(Stage::Test) => {
                "Run the test suite for this ticket's changes and report results."
            }
            PromptKind::Stage(Stage::BuildVerify) => {
                "Run the build commands and verify the workspace builds cleanly."
            }
            PromptKind::Stage(Stage::SpecReview) => {
                "Review the change against the ticket's acceptance criteria."
            }
            PromptKind::Stage(Stage::CodeReview) => {
                "Review the change for correctness and style. Report severity honestly."
            }
            PromptKind::Stage(Stage::ReviewFix) => {
                "Fix the review findings in the current workspace."
            }
            PromptKind::Stage(Stage::Report) => {
                "Write the final report for this ticket."
            }
            PromptKind::Stage(Stage::Land) => "Land this ticket.",
        }
    }
}

impl PromptTemplates for DefaultTemplates {
    fn render(&self, kind: PromptKind, props: &Value, schema: &Schema) -> String {
        let mut prompt = String::new();
        prompt.push_str(Self::intro(kind));
        prompt.push_str("\n\n[Inputs]\n");
        prompt.push_str(
            &serde_json::to_string_pretty(props).unwrap_or_else(|_| props.to_string()),
        );

        // Eviction artifacts ride along verbatim so the next attempt knows
        // exactly why the last landing failed.
        if let Some(eviction) = props.get("evictionContext").filter(|v| !v.is_null()) {
            prompt.push_str("\n\n[Previous landing attempt failed]\n");
            for (label, field) in [
                ("Commits on the ticket branch:", "branchCommits"),
                ("Files changed:", "summaryDiff"),
                ("Commits on mainline since branching:", "mainlineCommits"),
            ] {
                if let Some(text) = eviction.get(field).and_then(Value::as_str) {
                    prompt.push_str(label);
                    prompt.push('\n');
                    prompt.push_str(text);
                    prompt.push('\n');
                }
            }
        }

        prompt.push_str("\n\nRespond with ONLY a JSON object matching exactly:\n");
        prompt.push_str(&schema.outline());
        prompt
    }
}
