//! Eviction context builder: VCS diagnostics for a failed landing attempt.

use std::sync::Arc;

use crate::domain::errors::DomainResult;
use crate::domain::models::EvictionContext;
use crate::domain::ports::Vcs;
use crate::infrastructure::vcs::bookmark_revset;

/// Collects the three artifacts persisted with every eviction: commits on
/// the ticket branch since the branch point, the summary diff of the
/// attempted change, and commits on mainline since the branch point.
pub struct EvictionContextBuilder {
    vcs: Arc<dyn Vcs>,
    main_branch: String,
}

impl EvictionContextBuilder {
    pub fn new(vcs: Arc<dyn Vcs>, main_branch: impl Into<String>) -> Self {
        Self {
            vcs,
            main_branch: main_branch.into(),
        }
    }

    pub async fn build(&self, ticket_id: &str) -> DomainResult<EvictionContext> {
        let branch = bookmark_revset(&format!("ticket/{}", ticket_id));
        let main = &self.main_branch;

        let branch_range = format!("{}..{}", main, branch);
        let mainline_range = format!("{}..{}", branch, main);

        let branch_commits = self.vcs.log(&branch_range).await?;
        let summary_diff = self.vcs.diff_summary(&branch_range).await?;
        let mainline_commits = self.vcs.log(&mainline_range).await?;

        Ok(EvictionContext {
            branch_commits,
            summary_diff,
            mainline_commits,
        })
    }
}
