//! Builds [`Task`] values from platform state.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::PlatformError;
use crate::platform::{Comment, Issue, LabelAction, PlatformClient, PullRequest, RepoRef};
use crate::task::labels::{BotLabel, HANDBACK_MARKER, branch_for_issue, issue_from_branch, last_applied};
use crate::task::{PullContext, Task, TaskKey};

pub struct TaskBuilder {
    platform: Arc<dyn PlatformClient>,
    bot_login: String,
    branch_prefix: String,
    workflow: Option<String>,
}

impl TaskBuilder {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        bot_login: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            bot_login: bot_login.into(),
            branch_prefix: branch_prefix.into(),
            workflow: None,
        }
    }

    /// Report the latest run of `workflow` on tasks with a pull request.
    pub fn with_validation_workflow(mut self, workflow: Option<String>) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn bot_login(&self) -> &str {
        &self.bot_login
    }

    pub fn branch_prefix(&self) -> &str {
        &self.branch_prefix
    }

    /// Build the task for an issue listing entry.
    pub async fn build(&self, issue: Issue) -> Result<Task, PlatformError> {
        if issue.is_pull_request {
            return self.build_for_pull(&issue.repo, issue.number).await;
        }
        let branch = branch_for_issue(&self.branch_prefix, issue.number);
        let pull = self
            .platform
            .find_pull_by_head(&issue.repo, &branch)
            .await?;
        self.assemble(issue, branch, pull).await
    }

    /// Build the task for an issue or pull request by number.
    pub async fn build_for_number(&self, repo: &RepoRef, number: u64) -> Result<Task, PlatformError> {
        let issue = self.platform.get_issue(repo, number).await?;
        self.build(issue).await
    }

    /// Build the task a pull request belongs to.
    ///
    /// A pull request on one of the bot's issue branches folds into that
    /// issue's task; any other pull request is a task of its own that works
    /// on the pull request's head branch.
    pub async fn build_for_pull(&self, repo: &RepoRef, number: u64) -> Result<Task, PlatformError> {
        let pull = self.platform.get_pull(repo, number).await?;
        match issue_from_branch(&self.branch_prefix, &pull.head_branch) {
            Some(issue_number) => {
                let issue = self.platform.get_issue(repo, issue_number).await?;
                let branch = pull.head_branch.clone();
                self.assemble(issue, branch, Some(pull)).await
            }
            None => {
                let issue = self.platform.get_issue(repo, number).await?;
                let branch = pull.head_branch.clone();
                self.assemble(issue, branch, Some(pull)).await
            }
        }
    }

    async fn assemble(
        &self,
        issue: Issue,
        branch: String,
        pull: Option<PullRequest>,
    ) -> Result<Task, PlatformError> {
        let repo = issue.repo.clone();
        let comments = self.platform.list_comments(&repo, issue.number).await?;
        let events = self.platform.list_label_events(&repo, issue.number).await?;
        let bot_label = BotLabel::resolve(&issue.labels);

        let mut human_activity: Vec<DateTime<Utc>> = Vec::new();
        human_activity.extend(self.human_comment_times(&comments));
        human_activity.extend(
            events
                .iter()
                .filter(|e| e.action == LabelAction::Added && e.actor != self.bot_login)
                .map(|e| e.created_at),
        );

        let mut handback_sources: Vec<&Comment> = comments.iter().collect();
        let pull_context = match pull {
            Some(pull) => {
                let context = self.pull_context(&repo, issue.number, pull).await?;
                human_activity.extend(self.human_comment_times(&context.comments));
                human_activity.extend(
                    context
                        .reviews
                        .iter()
                        .filter(|r| !r.author_is_bot && r.author != self.bot_login)
                        .filter_map(|r| r.submitted_at),
                );
                if let Some(at) = self.human_head_commit(&repo, &context.pull).await? {
                    human_activity.push(at);
                }
                Some(context)
            }
            None => None,
        };
        if let Some(context) = &pull_context {
            handback_sources.extend(context.comments.iter());
        }

        let handed_back_at = handback_sources
            .iter()
            .filter(|c| c.author == self.bot_login && c.body.contains(HANDBACK_MARKER))
            .map(|c| c.created_at)
            .max();

        Ok(Task {
            key: TaskKey::new(repo, issue.number),
            label_applied_at: bot_label.and_then(|l| last_applied(&events, l)),
            last_human_activity_at: human_activity.into_iter().max(),
            handed_back_at,
            issue,
            comments,
            pull: pull_context,
            branch,
            bot_label,
        })
    }

    async fn pull_context(
        &self,
        repo: &RepoRef,
        issue_number: u64,
        pull: PullRequest,
    ) -> Result<PullContext, PlatformError> {
        let files = self.platform.list_pull_files(repo, pull.number).await?;
        let reviews = self.platform.list_reviews(repo, pull.number).await?;
        let comments = if pull.number == issue_number {
            Vec::new()
        } else {
            self.platform.list_comments(repo, pull.number).await?
        };

        let validation = match &self.workflow {
            Some(workflow) => self
                .platform
                .list_workflow_runs(repo, workflow, &pull.head_branch)
                .await?
                .into_iter()
                .find(|r| r.head_sha == pull.head_sha),
            None => None,
        };

        Ok(PullContext {
            pull,
            files,
            reviews,
            comments,
            validation,
        })
    }

    /// Date of the head commit if a human authored it.
    async fn human_head_commit(
        &self,
        repo: &RepoRef,
        pull: &PullRequest,
    ) -> Result<Option<DateTime<Utc>>, PlatformError> {
        if pull.head_sha.is_empty() {
            return Ok(None);
        }
        let commit = self.platform.get_commit(repo, &pull.head_sha).await?;
        Ok(match commit.author_login.as_deref() {
            Some(login) if login == self.bot_login => None,
            _ => Some(commit.date),
        })
    }

    fn human_comment_times<'a>(
        &'a self,
        comments: &'a [Comment],
    ) -> impl Iterator<Item = DateTime<Utc>> + 'a {
        comments
            .iter()
            .filter(|c| !c.author_is_bot && c.author != self.bot_login)
            .map(|c| c.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::InMemoryPlatform;
    use crate::task::needs_attention;

    fn repo() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    fn setup() -> (Arc<InMemoryPlatform>, TaskBuilder) {
        let platform = Arc::new(InMemoryPlatform::new("issuebot"));
        platform.add_repo(&repo(), "main", &[("README.md", "hi")]);
        let builder = TaskBuilder::new(platform.clone(), "issuebot", "issuebot");
        (platform, builder)
    }

    #[tokio::test]
    async fn test_build_plain_issue() {
        let (platform, builder) = setup();
        let n = platform.add_issue(&repo(), "Crash", "details", "alice");
        platform.label_as(&repo(), n, "bot-turn", "alice");

        let task = builder.build_for_number(&repo(), n).await.unwrap();
        assert_eq!(task.key, TaskKey::new(repo(), n));
        assert_eq!(task.branch, "issuebot/issue-1");
        assert_eq!(task.bot_label, Some(BotLabel::Turn));
        assert!(task.pull.is_none());
        assert!(needs_attention(&task));
    }

    #[tokio::test]
    async fn test_working_becomes_stale_after_human_comment() {
        let (platform, builder) = setup();
        let n = platform.add_issue(&repo(), "Crash", "details", "alice");
        platform.add_label(&repo(), n, "bot-working").await.unwrap();

        let task = builder.build_for_number(&repo(), n).await.unwrap();
        assert!(!needs_attention(&task));

        platform.comment_as(&repo(), n, "alice", "any news?");
        let task = builder.build_for_number(&repo(), n).await.unwrap();
        assert!(task.is_stale());
        assert!(needs_attention(&task));
    }

    #[tokio::test]
    async fn test_bot_comments_are_not_human_activity() {
        let (platform, builder) = setup();
        let n = platform.add_issue(&repo(), "Crash", "details", "alice");
        platform.add_label(&repo(), n, "bot-blocked").await.unwrap();
        platform.post_comment(&repo(), n, "I am blocked").await.unwrap();

        let task = builder.build_for_number(&repo(), n).await.unwrap();
        assert!(!needs_attention(&task));
    }

    #[tokio::test]
    async fn test_pull_on_issue_branch_folds_into_issue() {
        let (platform, builder) = setup();
        let n = platform.add_issue(&repo(), "Crash", "details", "alice");
        platform.push_file(&repo(), "issuebot/issue-1", "fix.rs", "x", "issuebot");
        let pr = platform.add_pull(&repo(), "issuebot/issue-1", "Fix crash", "issuebot");
        platform.review_as(&repo(), pr, "bob", "CHANGES_REQUESTED", "rename please");

        let task = builder.build_for_pull(&repo(), pr).await.unwrap();
        assert_eq!(task.key.number, n);
        let pull = task.pull.as_ref().unwrap();
        assert_eq!(pull.pull.number, pr);
        assert_eq!(pull.files.len(), 1);
        assert_eq!(pull.files[0].path, "fix.rs");
        assert!(task.last_human_activity_at.is_some());

        // listing entry for the issue finds the same pull request
        let by_issue = builder.build_for_number(&repo(), n).await.unwrap();
        assert_eq!(by_issue.pull.unwrap().pull.number, pr);
    }

    #[tokio::test]
    async fn test_foreign_pull_is_its_own_task() {
        let (platform, builder) = setup();
        platform.push_file(&repo(), "feature/login", "login.rs", "x", "carol");
        let pr = platform.add_pull(&repo(), "feature/login", "Add login", "carol");

        let task = builder.build_for_number(&repo(), pr).await.unwrap();
        assert_eq!(task.key.number, pr);
        assert_eq!(task.branch, "feature/login");
        // the head commit was authored by a human
        assert!(task.last_human_activity_at.is_some());
    }

    #[tokio::test]
    async fn test_handback_marker_is_detected() {
        let (platform, builder) = setup();
        let n = platform.add_issue(&repo(), "Crash", "details", "alice");
        platform.add_label(&repo(), n, "bot-turn").await.unwrap();
        platform
            .post_comment(&repo(), n, &format!("Opened a PR.\n\n{}", HANDBACK_MARKER))
            .await
            .unwrap();

        let task = builder.build_for_number(&repo(), n).await.unwrap();
        assert!(task.awaiting_review());

        platform.comment_as(&repo(), n, "alice", "please also handle tabs");
        let task = builder.build_for_number(&repo(), n).await.unwrap();
        assert!(!task.awaiting_review());
    }
}
