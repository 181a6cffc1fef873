//! Tasks: units of work derived from tracked issues.

mod builder;
mod generator;
mod labels;

pub use builder::TaskBuilder;
pub use generator::{TaskGenerator, TaskStream};
pub use labels::{
    BotLabel, HANDBACK_MARKER, branch_for_issue, issue_from_branch, last_applied, validation_branch,
};

use std::fmt;

use chrono::{DateTime, Utc};

use crate::platform::{Comment, FileChange, Issue, PullRequest, RepoRef, Review, WorkflowRun};

/// Identity of a task: the issue (or pull request) it tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub repo: RepoRef,
    pub number: u64,
}

impl TaskKey {
    pub fn new(repo: RepoRef, number: u64) -> Self {
        Self { repo, number }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// The pull request associated with a task.
#[derive(Debug, Clone, PartialEq)]
pub struct PullContext {
    pub pull: PullRequest,
    /// Diff summary.
    pub files: Vec<FileChange>,
    pub reviews: Vec<Review>,
    /// Conversation on the pull request itself, when it is not the task's issue.
    pub comments: Vec<Comment>,
    /// Latest validation run for the head commit.
    pub validation: Option<WorkflowRun>,
}

/// Derived classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionState {
    NeedsAttention,
    Idle,
}

/// One unit of work, built fresh on every poll.
#[derive(Debug, Clone)]
pub struct Task {
    pub key: TaskKey,
    pub issue: Issue,
    pub comments: Vec<Comment>,
    pub pull: Option<PullContext>,
    /// Branch the bot's commit lands on.
    pub branch: String,
    pub bot_label: Option<BotLabel>,
    /// When the current attention label was last applied.
    pub label_applied_at: Option<DateTime<Utc>>,
    /// Latest comment, review, head commit or label change by a human.
    pub last_human_activity_at: Option<DateTime<Utc>>,
    /// Latest hand-back comment by the bot.
    pub handed_back_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A human acted after the current label was applied.
    pub fn is_stale(&self) -> bool {
        match (self.label_applied_at, self.last_human_activity_at) {
            (Some(applied), Some(human)) => human > applied,
            _ => false,
        }
    }

    pub fn attention(&self) -> AttentionState {
        match self.bot_label {
            Some(BotLabel::Turn) => AttentionState::NeedsAttention,
            Some(BotLabel::Working) | Some(BotLabel::Blocked) if self.is_stale() => {
                AttentionState::NeedsAttention
            }
            _ => AttentionState::Idle,
        }
    }

    /// The bot handed this task back and no human has responded yet.
    pub fn awaiting_review(&self) -> bool {
        self.bot_label == Some(BotLabel::Turn)
            && self.handed_back_at.is_some_and(|handed| {
                self.last_human_activity_at
                    .is_none_or(|human| human < handed)
            })
    }

    /// Human comments on the issue and pull request posted after `since`.
    pub fn human_comments_since(&self, since: DateTime<Utc>, bot_login: &str) -> Vec<&Comment> {
        let pull_comments = self.pull.iter().flat_map(|p| p.comments.iter());
        let mut out: Vec<&Comment> = self
            .comments
            .iter()
            .chain(pull_comments)
            .filter(|c| !c.author_is_bot && c.author != bot_login && c.created_at > since)
            .collect();
        out.sort_by_key(|c| c.created_at);
        out
    }
}

/// Whether the engine should look at `task` now.
pub fn needs_attention(task: &Task) -> bool {
    task.attention() == AttentionState::NeedsAttention
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{Duration, TimeZone};

    use super::*;

    pub fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    pub fn task(label: Option<BotLabel>) -> Task {
        let repo = RepoRef::new("acme", "widgets");
        Task {
            key: TaskKey::new(repo.clone(), 7),
            issue: Issue {
                repo,
                number: 7,
                title: "Crash on empty input".into(),
                body: "Parsing an empty file panics.".into(),
                author: "alice".into(),
                labels: label.iter().map(|l| l.as_str().to_string()).collect(),
                assignees: vec!["issuebot".into()],
                is_pull_request: false,
                updated_at: at(0),
            },
            comments: Vec::new(),
            pull: None,
            branch: "issuebot/issue-7".into(),
            bot_label: label,
            label_applied_at: label.map(|_| at(0)),
            last_human_activity_at: None,
            handed_back_at: None,
        }
    }
}
