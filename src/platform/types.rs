//! Platform data types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository reference (`owner/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (owner, name) = trimmed
            .split_once('/')
            .ok_or_else(|| format!("invalid repository '{}', expected owner/name", raw))?;
        let owner = owner.trim();
        let name = name.trim();
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(format!("invalid repository '{}', expected owner/name", raw));
        }
        Ok(Self::new(owner, name))
    }
}

/// An issue or pull request as listed by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub repo: RepoRef,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    /// True when this record is the issue half of a pull request.
    pub is_pull_request: bool,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A comment on an issue or pull request conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    /// The platform flagged the author as an automation account.
    pub author_is_bot: bool,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAction {
    Added,
    Removed,
}

/// One entry of an issue's label timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEvent {
    pub label: String,
    pub action: LabelAction,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub head_sha: String,
    pub base_branch: String,
    pub html_url: String,
    pub open: bool,
    pub updated_at: DateTime<Utc>,
}

/// Per-file entry of a pull request's diff.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChange {
    pub path: String,
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Review {
    pub author: String,
    pub author_is_bot: bool,
    pub state: String,
    pub body: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub sha: String,
    pub tree_sha: String,
    pub parents: Vec<String>,
    pub message: String,
    /// Platform login of the author, when it maps to an account.
    pub author_login: Option<String>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    File,
    Dir,
}

/// An entry of a recursive tree listing.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub path: String,
    pub kind: EntryKind,
    pub sha: String,
}

/// A single path change applied on top of a base tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeChange {
    pub path: String,
    /// `None` removes the path from the tree.
    pub blob_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => RunStatus::Completed,
            "in_progress" => RunStatus::InProgress,
            _ => RunStatus::Queued,
        }
    }
}

/// One run of a CI workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: u64,
    pub head_sha: String,
    pub head_branch: String,
    pub status: RunStatus,
    /// `success`, `failure`, `cancelled`, ... once completed.
    pub conclusion: Option<String>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed && self.conclusion.as_deref() == Some("success")
    }
}

/// Outcome of one job inside a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub name: String,
    pub conclusion: Option<String>,
    pub failed_steps: Vec<String>,
}
