//! Workspace over an in-memory base with scripted validation verdicts.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::WorkspaceError;
use crate::fs::{Changelist, FileSystem, StagingFs};
use crate::workspace::{CommitRef, ValidationHandle, ValidationOutcome, Workspace};

/// Local workspace for tool tests and dry runs. Commits are recorded rather
/// than pushed anywhere.
pub struct MemoryWorkspace {
    staging: StagingFs,
    branch: String,
    validation_enabled: bool,
    verdicts: VecDeque<ValidationOutcome>,
    validated: Option<Changelist>,
    runs: usize,
    commits: Vec<Changelist>,
}

impl MemoryWorkspace {
    pub fn new(base: Arc<dyn FileSystem>, branch: impl Into<String>) -> Self {
        Self {
            staging: StagingFs::new(base),
            branch: branch.into(),
            validation_enabled: false,
            verdicts: VecDeque::new(),
            validated: None,
            runs: 0,
            commits: Vec::new(),
        }
    }

    /// Enable validation. Runs take `verdicts` in order, then pass.
    pub fn with_validation(mut self, verdicts: Vec<ValidationOutcome>) -> Self {
        self.validation_enabled = true;
        self.verdicts = verdicts.into();
        self
    }

    pub fn validation_runs(&self) -> usize {
        self.runs
    }

    pub fn commits(&self) -> &[Changelist] {
        &self.commits
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    fn fs(&self) -> &StagingFs {
        &self.staging
    }

    async fn stage(&mut self, path: &str, content: Vec<u8>) -> Result<(), WorkspaceError> {
        Ok(self.staging.write(path, content).await?)
    }

    async fn delete(&mut self, path: &str) -> Result<(), WorkspaceError> {
        Ok(self.staging.delete(path).await?)
    }

    fn validation_configured(&self) -> bool {
        self.validation_enabled
    }

    fn is_validated(&self) -> bool {
        self.validated.as_ref() == Some(&self.staging.get_changelist())
    }

    async fn trigger_validation(&mut self) -> Result<ValidationHandle, WorkspaceError> {
        if !self.validation_enabled {
            return Err(WorkspaceError::ValidationNotConfigured);
        }
        self.runs += 1;
        Ok(ValidationHandle {
            workflow: "local".to_string(),
            branch: format!("{}-validate", self.branch),
            head_sha: format!("run-{}", self.runs),
            dispatched_at: Utc::now(),
            changelist: self.staging.get_changelist(),
        })
    }

    async fn await_validation(
        &mut self,
        handle: &ValidationHandle,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, WorkspaceError> {
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }
        let outcome = self.verdicts.pop_front().unwrap_or(ValidationOutcome::Pass);
        if outcome.passed() {
            self.validated = Some(handle.changelist.clone());
        }
        Ok(outcome)
    }

    async fn commit(&mut self, _message: &str) -> Result<CommitRef, WorkspaceError> {
        if !self.commits.is_empty() {
            return Err(WorkspaceError::AlreadyCommitted(format!(
                "local-{}",
                self.commits.len()
            )));
        }
        let changelist = self.staging.get_changelist();
        if changelist.is_empty() {
            return Err(WorkspaceError::NothingStaged);
        }
        self.commits.push(changelist);
        Ok(CommitRef {
            sha: format!("local-{}", self.commits.len()),
            branch: self.branch.clone(),
        })
    }
}
