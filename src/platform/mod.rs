//! Code-hosting platform capability.
//!
//! The engine only talks to the platform through [`PlatformClient`]. The
//! GitHub REST implementation is used in production; [`InMemoryPlatform`]
//! backs the test suite.

mod github;
mod memory;
mod types;

pub use github::GitHubClient;
pub use memory::InMemoryPlatform;
pub use types::{
    Comment, CommitInfo, EntryKind, FileChange, Issue, JobSummary, LabelAction, LabelEvent,
    NewPullRequest, PullRequest, RepoRef, Review, RunStatus, TreeChange, TreeEntry, WorkflowRun,
};

use async_trait::async_trait;

use crate::error::PlatformError;

/// Operations the engine needs from the code-hosting platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    // --- Issues and labels ---

    /// List open issues and pull requests assigned to `assignee`.
    async fn list_assigned(&self, assignee: &str) -> Result<Vec<Issue>, PlatformError>;

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> Result<Issue, PlatformError>;

    async fn list_comments(&self, repo: &RepoRef, number: u64)
    -> Result<Vec<Comment>, PlatformError>;

    async fn post_comment(
        &self,
        repo: &RepoRef,
        number: u64,
        body: &str,
    ) -> Result<Comment, PlatformError>;

    async fn list_label_events(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<LabelEvent>, PlatformError>;

    async fn add_label(&self, repo: &RepoRef, number: u64, label: &str)
    -> Result<(), PlatformError>;

    /// Remove a label. Fails with [`PlatformError::NotFound`] when the label is
    /// not currently applied, which makes removal usable as a conditional update.
    async fn remove_label(
        &self,
        repo: &RepoRef,
        number: u64,
        label: &str,
    ) -> Result<(), PlatformError>;

    // --- Pull requests ---

    async fn get_pull(&self, repo: &RepoRef, number: u64) -> Result<PullRequest, PlatformError>;

    /// Find the open pull request whose head is `branch`, if any.
    async fn find_pull_by_head(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<PullRequest>, PlatformError>;

    async fn list_pull_files(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<FileChange>, PlatformError>;

    async fn list_reviews(&self, repo: &RepoRef, number: u64) -> Result<Vec<Review>, PlatformError>;

    async fn create_pull(
        &self,
        repo: &RepoRef,
        pull: &NewPullRequest,
    ) -> Result<PullRequest, PlatformError>;

    async fn update_pull(
        &self,
        repo: &RepoRef,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, PlatformError>;

    // --- Git data ---

    async fn default_branch(&self, repo: &RepoRef) -> Result<String, PlatformError>;

    /// Head commit of `branch`, or `None` if the branch does not exist.
    async fn branch_head(&self, repo: &RepoRef, branch: &str)
    -> Result<Option<String>, PlatformError>;

    async fn get_commit(&self, repo: &RepoRef, sha: &str) -> Result<CommitInfo, PlatformError>;

    /// Recursive listing of a tree.
    async fn get_tree(&self, repo: &RepoRef, tree_sha: &str)
    -> Result<Vec<TreeEntry>, PlatformError>;

    async fn get_blob(&self, repo: &RepoRef, sha: &str) -> Result<Vec<u8>, PlatformError>;

    async fn create_blob(&self, repo: &RepoRef, content: &[u8]) -> Result<String, PlatformError>;

    async fn create_tree(
        &self,
        repo: &RepoRef,
        base_tree: &str,
        changes: &[TreeChange],
    ) -> Result<String, PlatformError>;

    async fn create_commit(
        &self,
        repo: &RepoRef,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, PlatformError>;

    /// Point `branch` at `sha`, creating it if needed and force-moving it otherwise.
    async fn set_branch(&self, repo: &RepoRef, branch: &str, sha: &str)
    -> Result<(), PlatformError>;

    // --- Workflows ---

    async fn dispatch_workflow(
        &self,
        repo: &RepoRef,
        workflow: &str,
        git_ref: &str,
    ) -> Result<(), PlatformError>;

    /// Recent runs of `workflow` on `branch`, newest first.
    async fn list_workflow_runs(
        &self,
        repo: &RepoRef,
        workflow: &str,
        branch: &str,
    ) -> Result<Vec<WorkflowRun>, PlatformError>;

    async fn list_run_jobs(
        &self,
        repo: &RepoRef,
        run_id: u64,
    ) -> Result<Vec<JobSummary>, PlatformError>;
}
