//! Platform-backed workspace.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ValidationConfig;
use crate::error::{PlatformError, WorkspaceError};
use crate::fs::{Changelist, RemoteTreeFs, StagingFs};
use crate::platform::{PlatformClient, RepoRef, TreeChange, WorkflowRun};
use crate::workspace::{CommitRef, ValidationHandle, ValidationOutcome, Workspace};

/// Stages edits over a fixed base commit and talks to the platform for
/// validation and the final commit.
pub struct RemoteWorkspace {
    platform: Arc<dyn PlatformClient>,
    repo: RepoRef,
    base_commit: String,
    base_tree: String,
    target_branch: String,
    validation_branch: String,
    validation: Option<ValidationConfig>,
    staging: StagingFs,
    validated: Option<Changelist>,
    committed: Option<String>,
}

impl RemoteWorkspace {
    /// Open a workspace whose base is `base_commit`.
    ///
    /// Validation runs are pushed to `validation_branch`; the final commit goes
    /// to `target_branch`.
    pub async fn open(
        platform: Arc<dyn PlatformClient>,
        repo: RepoRef,
        base_commit: &str,
        target_branch: impl Into<String>,
        validation_branch: impl Into<String>,
        validation: Option<ValidationConfig>,
    ) -> Result<Self, WorkspaceError> {
        let commit = platform.get_commit(&repo, base_commit).await?;
        let base = RemoteTreeFs::new(platform.clone(), repo.clone(), commit.tree_sha.clone());

        Ok(Self {
            platform,
            repo,
            base_commit: commit.sha,
            base_tree: commit.tree_sha,
            target_branch: target_branch.into(),
            validation_branch: validation_branch.into(),
            validation,
            staging: StagingFs::new(Arc::new(base)),
            validated: None,
            committed: None,
        })
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Write `changes` as blobs plus one tree on top of the base and wrap it
    /// in a commit whose only parent is the base commit.
    async fn write_commit(&self, changes: &Changelist, message: &str) -> Result<String, WorkspaceError> {
        let mut tree_changes = Vec::with_capacity(changes.len());
        for (path, content) in &changes.writes {
            let blob = self.platform.create_blob(&self.repo, content).await?;
            tree_changes.push(TreeChange {
                path: path.clone(),
                blob_sha: Some(blob),
            });
        }
        for path in &changes.deletes {
            tree_changes.push(TreeChange {
                path: path.clone(),
                blob_sha: None,
            });
        }

        let tree = self
            .platform
            .create_tree(&self.repo, &self.base_tree, &tree_changes)
            .await?;
        let sha = self
            .platform
            .create_commit(&self.repo, message, &tree, &[self.base_commit.clone()])
            .await?;
        Ok(sha)
    }

    async fn diagnose(&self, run: &WorkflowRun) -> String {
        let conclusion = run.conclusion.as_deref().unwrap_or("unknown");
        let mut out = format!(
            "Validation run {} concluded `{}`.",
            run.html_url, conclusion
        );

        match self.platform.list_run_jobs(&self.repo, run.id).await {
            Ok(jobs) => {
                let failed: Vec<_> = jobs
                    .iter()
                    .filter(|j| j.conclusion.as_deref() != Some("success"))
                    .collect();
                if !failed.is_empty() {
                    out.push_str("\nFailed jobs:");
                    for job in failed {
                        out.push_str(&format!(
                            "\n- {} ({})",
                            job.name,
                            job.conclusion.as_deref().unwrap_or("unknown")
                        ));
                        if !job.failed_steps.is_empty() {
                            out.push_str(&format!(
                                ": failed steps: {}",
                                job.failed_steps.join(", ")
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Could not fetch jobs for run {}: {}", run.id, e);
            }
        }
        out
    }
}

#[async_trait]
impl Workspace for RemoteWorkspace {
    fn fs(&self) -> &StagingFs {
        &self.staging
    }

    async fn stage(&mut self, path: &str, content: Vec<u8>) -> Result<(), WorkspaceError> {
        if let Some(sha) = &self.committed {
            return Err(WorkspaceError::AlreadyCommitted(sha.clone()));
        }
        self.staging.write(path, content).await?;
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), WorkspaceError> {
        if let Some(sha) = &self.committed {
            return Err(WorkspaceError::AlreadyCommitted(sha.clone()));
        }
        self.staging.delete(path).await?;
        Ok(())
    }

    fn validation_configured(&self) -> bool {
        self.validation.is_some()
    }

    fn is_validated(&self) -> bool {
        self.validated.as_ref() == Some(&self.staging.get_changelist())
    }

    async fn trigger_validation(&mut self) -> Result<ValidationHandle, WorkspaceError> {
        let workflow = self
            .validation
            .as_ref()
            .ok_or(WorkspaceError::ValidationNotConfigured)?
            .workflow
            .clone();
        if let Some(sha) = &self.committed {
            return Err(WorkspaceError::AlreadyCommitted(sha.clone()));
        }

        let changelist = self.staging.get_changelist();
        let head_sha = self
            .write_commit(&changelist, "Validate staged changes")
            .await?;
        self.platform
            .set_branch(&self.repo, &self.validation_branch, &head_sha)
            .await?;
        self.platform
            .dispatch_workflow(&self.repo, &workflow, &self.validation_branch)
            .await?;

        tracing::info!(
            "Dispatched {} on {} at {} ({} staged paths)",
            workflow,
            self.validation_branch,
            head_sha,
            changelist.len()
        );

        Ok(ValidationHandle {
            workflow,
            branch: self.validation_branch.clone(),
            head_sha,
            dispatched_at: Utc::now(),
            changelist,
        })
    }

    async fn await_validation(
        &mut self,
        handle: &ValidationHandle,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, WorkspaceError> {
        let config = self
            .validation
            .clone()
            .ok_or(WorkspaceError::ValidationNotConfigured)?;
        let deadline = Instant::now() + config.timeout;

        loop {
            let runs = self
                .platform
                .list_workflow_runs(&self.repo, &handle.workflow, &handle.branch)
                .await?;
            let run = runs.into_iter().find(|r| r.head_sha == handle.head_sha);

            match run {
                Some(run) if run.succeeded() => {
                    tracing::info!("Validation passed for {}", handle.head_sha);
                    self.validated = Some(handle.changelist.clone());
                    return Ok(ValidationOutcome::Pass);
                }
                Some(run) if run.conclusion.is_some() => {
                    tracing::info!(
                        "Validation failed for {}: {:?}",
                        handle.head_sha,
                        run.conclusion
                    );
                    let diagnostic = self.diagnose(&run).await;
                    return Ok(ValidationOutcome::Fail { diagnostic });
                }
                Some(run) => {
                    tracing::debug!("Validation run {} is {:?}", run.id, run.status);
                }
                None => {
                    tracing::debug!("No validation run for {} yet", handle.head_sha);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Validation for {} timed out", handle.head_sha);
                return Ok(ValidationOutcome::Fail {
                    diagnostic: format!(
                        "Validation did not finish within {}s and was treated as a failure.",
                        config.timeout.as_secs()
                    ),
                });
            }

            let wait = config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn commit(&mut self, message: &str) -> Result<CommitRef, WorkspaceError> {
        if let Some(sha) = &self.committed {
            return Err(WorkspaceError::AlreadyCommitted(sha.clone()));
        }
        let changelist = self.staging.get_changelist();
        if changelist.is_empty() {
            return Err(WorkspaceError::NothingStaged);
        }

        // Refuse to clobber commits pushed to the target since the workspace opened.
        if let Some(current) = self
            .platform
            .branch_head(&self.repo, &self.target_branch)
            .await?
        {
            if current != self.base_commit {
                return Err(WorkspaceError::Platform(PlatformError::Conflict(format!(
                    "{} moved from {} to {} during the attempt",
                    self.target_branch, self.base_commit, current
                ))));
            }
        }

        let sha = self.write_commit(&changelist, message).await?;
        self.platform
            .set_branch(&self.repo, &self.target_branch, &sha)
            .await?;
        tracing::info!(
            "Committed {} paths to {} as {}",
            changelist.len(),
            self.target_branch,
            sha
        );

        self.committed = Some(sha.clone());
        Ok(CommitRef {
            sha,
            branch: self.target_branch.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fs::FileSystem;
    use crate::platform::InMemoryPlatform;

    fn repo() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    async fn open(platform: &Arc<InMemoryPlatform>, validation: Option<ValidationConfig>) -> RemoteWorkspace {
        let head = platform
            .branch_head(&repo(), "main")
            .await
            .unwrap()
            .unwrap();
        RemoteWorkspace::open(
            platform.clone(),
            repo(),
            &head,
            "issuebot/issue-1",
            "issuebot/issue-1-validate",
            validation,
        )
        .await
        .unwrap()
    }

    fn seeded() -> Arc<InMemoryPlatform> {
        let platform = Arc::new(InMemoryPlatform::new("issuebot"));
        platform.add_repo(&repo(), "main", &[("README.md", "hello"), ("src/old.rs", "old")]);
        platform
    }

    // ==================== Commit ====================

    #[tokio::test]
    async fn test_commit_is_single_and_atomic() {
        let platform = seeded();
        let mut ws = open(&platform, None).await;

        ws.stage("src/new.rs", b"new".to_vec()).await.unwrap();
        ws.delete("src/old.rs").await.unwrap();
        let commit = ws.commit("Fix #1").await.unwrap();

        let log = platform.commit_log(&repo(), "issuebot/issue-1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sha, commit.sha);
        assert_eq!(platform.file_at(&repo(), "issuebot/issue-1", "src/new.rs").as_deref(), Some("new"));
        assert_eq!(platform.file_at(&repo(), "issuebot/issue-1", "src/old.rs"), None);
        // main is untouched
        assert_eq!(platform.commit_log(&repo(), "main").len(), 1);

        assert!(matches!(
            ws.commit("again").await,
            Err(WorkspaceError::AlreadyCommitted(_))
        ));
        assert!(matches!(
            ws.stage("x", vec![]).await,
            Err(WorkspaceError::AlreadyCommitted(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_requires_changes() {
        let platform = seeded();
        let mut ws = open(&platform, None).await;
        assert!(matches!(ws.commit("empty").await, Err(WorkspaceError::NothingStaged)));
    }

    #[tokio::test]
    async fn test_commit_refuses_moved_target() {
        let platform = seeded();
        let mut ws = open(&platform, None).await;
        platform.push_file(&repo(), "issuebot/issue-1", "other.txt", "human", "alice");

        ws.stage("a.txt", b"a".to_vec()).await.unwrap();
        let err = ws.commit("Fix").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Platform(PlatformError::Conflict(_))));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_reads_see_staged_state() {
        let platform = seeded();
        let mut ws = open(&platform, None).await;
        ws.stage("README.md", b"changed".to_vec()).await.unwrap();
        assert_eq!(ws.fs().read("README.md").await.unwrap(), b"changed");
    }

    // ==================== Validation ====================

    #[tokio::test]
    async fn test_validation_not_configured() {
        let platform = seeded();
        let mut ws = open(&platform, None).await;
        assert!(!ws.validation_configured());
        assert!(matches!(
            ws.trigger_validation().await,
            Err(WorkspaceError::ValidationNotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_validation_fail_then_pass() {
        let platform = seeded();
        platform.script_validation(&repo(), &["failure"]);
        let mut ws = open(&platform, Some(ValidationConfig::new("ci.yml"))).await;
        let cancel = CancellationToken::new();

        ws.stage("src/lib.rs", b"broken".to_vec()).await.unwrap();
        let handle = ws.trigger_validation().await.unwrap();
        let outcome = ws.await_validation(&handle, &cancel).await.unwrap();
        match outcome {
            ValidationOutcome::Fail { diagnostic } => {
                assert!(diagnostic.contains("failure"));
                assert!(diagnostic.contains("Run tests"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!ws.is_validated());

        ws.stage("src/lib.rs", b"fixed".to_vec()).await.unwrap();
        let handle = ws.trigger_validation().await.unwrap();
        assert!(ws.await_validation(&handle, &cancel).await.unwrap().passed());
        assert!(ws.is_validated());

        // further edits invalidate the result
        ws.stage("src/extra.rs", b"x".to_vec()).await.unwrap();
        assert!(!ws.is_validated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_timeout_is_failure() {
        let platform = seeded();
        let mut config = ValidationConfig::new("ci.yml");
        config.timeout = Duration::from_secs(60);
        config.poll_interval = Duration::from_secs(10);
        let mut ws = open(&platform, Some(config)).await;

        // A handle for a commit no run will ever report.
        let handle = ValidationHandle {
            workflow: "ci.yml".into(),
            branch: "issuebot/issue-1-validate".into(),
            head_sha: "deadbeef".into(),
            dispatched_at: Utc::now(),
            changelist: Changelist::default(),
        };
        let outcome = ws
            .await_validation(&handle, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Fail { diagnostic } if diagnostic.contains("60s")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_wait_observes_cancel() {
        let platform = seeded();
        let mut ws = open(&platform, Some(ValidationConfig::new("ci.yml"))).await;
        let handle = ValidationHandle {
            workflow: "ci.yml".into(),
            branch: "nowhere".into(),
            head_sha: "deadbeef".into(),
            dispatched_at: Utc::now(),
            changelist: Changelist::default(),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        assert!(matches!(
            ws.await_validation(&handle, &cancel).await,
            Err(WorkspaceError::Cancelled)
        ));
    }
}
