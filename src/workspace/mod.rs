//! Validation workspace.
//!
//! A workspace owns the staging overlay for one task attempt, runs the
//! remote validation pipeline against the staged changes, and finally lands
//! them as a single commit on the target branch.

mod memory;
mod remote;

pub use memory::MemoryWorkspace;
pub use remote::RemoteWorkspace;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::WorkspaceError;
use crate::fs::{Changelist, StagingFs};

/// An outstanding validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationHandle {
    pub workflow: String,
    pub branch: String,
    /// Commit the pipeline was dispatched for.
    pub head_sha: String,
    pub dispatched_at: DateTime<Utc>,
    /// The staged changes that were pushed for this run.
    pub changelist: Changelist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Pass,
    Fail { diagnostic: String },
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ValidationOutcome::Pass)
    }
}

/// The commit produced by [`Workspace::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub sha: String,
    pub branch: String,
}

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Read access to the staged view of the repository.
    fn fs(&self) -> &StagingFs;

    async fn stage(&mut self, path: &str, content: Vec<u8>) -> Result<(), WorkspaceError>;

    async fn delete(&mut self, path: &str) -> Result<(), WorkspaceError>;

    fn changelist(&self) -> Changelist {
        self.fs().get_changelist()
    }

    fn validation_configured(&self) -> bool;

    /// True when the current changelist is exactly the one that last passed.
    fn is_validated(&self) -> bool;

    /// Push the current changelist to the working branch and dispatch the
    /// validation pipeline.
    async fn trigger_validation(&mut self) -> Result<ValidationHandle, WorkspaceError>;

    /// Wait for the run behind `handle` to finish. Timeouts are reported as
    /// failures; cancellation as [`WorkspaceError::Cancelled`].
    async fn await_validation(
        &mut self,
        handle: &ValidationHandle,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, WorkspaceError>;

    /// Land the current changelist as one commit on the target branch. Can
    /// only succeed once per workspace.
    async fn commit(&mut self, message: &str) -> Result<CommitRef, WorkspaceError>;
}
