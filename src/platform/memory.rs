//! In-memory platform used by tests and local dry runs.
//!
//! Models just enough of a hosted repository to exercise the engine: issues
//! with labels and comments, a content-addressed git object store, branches,
//! pull requests and a validation workflow whose conclusions can be scripted.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::error::PlatformError;
use crate::platform::{
    Comment, CommitInfo, EntryKind, FileChange, Issue, JobSummary, LabelAction, LabelEvent,
    NewPullRequest, PlatformClient, PullRequest, RepoRef, Review, RunStatus, TreeChange,
    TreeEntry, WorkflowRun,
};

/// A hosted-repository fake with inspection helpers.
pub struct InMemoryPlatform {
    bot_login: String,
    state: Mutex<State>,
}

struct State {
    clock: DateTime<Utc>,
    next_id: u64,
    repos: HashMap<RepoRef, RepoState>,
    unauthorized: bool,
    list_failures: u32,
    /// Labels another client re-applies just before our next removal.
    reapply_before_removal: Vec<(RepoRef, u64, String)>,
}

#[derive(Default)]
struct RepoState {
    default_branch: String,
    branches: BTreeMap<String, String>,
    commits: HashMap<String, CommitInfo>,
    /// Flat `path -> blob sha` maps keyed by tree sha.
    trees: HashMap<String, BTreeMap<String, String>>,
    blobs: HashMap<String, Vec<u8>>,
    next_number: u64,
    issues: BTreeMap<u64, IssueState>,
    pulls: BTreeMap<u64, PullRequest>,
    runs: Vec<(String, WorkflowRun)>,
    jobs: HashMap<u64, Vec<JobSummary>>,
    scripted_conclusions: VecDeque<String>,
}

struct IssueState {
    issue: Issue,
    open: bool,
    comments: Vec<Comment>,
    events: Vec<LabelEvent>,
    reviews: Vec<Review>,
}

fn content_sha(kind: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(bytes);
    let hex = format!("{:x}", hasher.finalize());
    hex[..40].to_string()
}

fn tree_sha(files: &BTreeMap<String, String>) -> String {
    let mut listing = String::new();
    for (path, blob) in files {
        listing.push_str(path);
        listing.push('\0');
        listing.push_str(blob);
        listing.push('\n');
    }
    content_sha("tree", listing.as_bytes())
}

fn not_found(what: impl Into<String>) -> PlatformError {
    PlatformError::NotFound(what.into())
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::seconds(1);
        self.clock
    }

    fn repo(&self, repo: &RepoRef) -> Result<&RepoState, PlatformError> {
        self.repos
            .get(repo)
            .ok_or_else(|| not_found(format!("repository {}", repo)))
    }

    fn repo_mut(&mut self, repo: &RepoRef) -> Result<&mut RepoState, PlatformError> {
        self.repos
            .get_mut(repo)
            .ok_or_else(|| not_found(format!("repository {}", repo)))
    }

    fn issue_mut(&mut self, repo: &RepoRef, number: u64) -> Result<&mut IssueState, PlatformError> {
        self.repo_mut(repo)?
            .issues
            .get_mut(&number)
            .ok_or_else(|| not_found(format!("issue {}#{}", repo, number)))
    }
}

impl RepoState {
    fn store_tree(&mut self, files: BTreeMap<String, String>) -> String {
        let sha = tree_sha(&files);
        self.trees.insert(sha.clone(), files);
        sha
    }

    fn store_blob(&mut self, bytes: &[u8]) -> String {
        let sha = content_sha("blob", bytes);
        self.blobs.insert(sha.clone(), bytes.to_vec());
        sha
    }

    fn store_commit(
        &mut self,
        message: &str,
        tree: &str,
        parents: Vec<String>,
        author: Option<String>,
        date: DateTime<Utc>,
    ) -> String {
        let mut key = format!("{}\n{}\n{}\n", tree, parents.join(","), date.to_rfc3339());
        key.push_str(message);
        let sha = content_sha("commit", key.as_bytes());
        self.commits.insert(
            sha.clone(),
            CommitInfo {
                sha: sha.clone(),
                tree_sha: tree.to_string(),
                parents,
                message: message.to_string(),
                author_login: author,
                date,
            },
        );
        sha
    }

    fn files_at_commit(&self, sha: &str) -> Option<&BTreeMap<String, String>> {
        let commit = self.commits.get(sha)?;
        self.trees.get(&commit.tree_sha)
    }

    fn refresh_pull(&self, pull: &PullRequest) -> PullRequest {
        let mut pull = pull.clone();
        if let Some(head) = self.branches.get(&pull.head_branch) {
            pull.head_sha = head.clone();
        }
        pull
    }
}

impl InMemoryPlatform {
    pub fn new(bot_login: impl Into<String>) -> Self {
        Self {
            bot_login: bot_login.into(),
            state: Mutex::new(State {
                clock: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
                next_id: 1,
                repos: HashMap::new(),
                unauthorized: false,
                list_failures: 0,
                reapply_before_removal: Vec::new(),
            }),
        }
    }

    pub fn bot_login(&self) -> &str {
        &self.bot_login
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, State>, PlatformError> {
        let state = self.state();
        if state.unauthorized {
            return Err(PlatformError::Unauthorized("token revoked".into()));
        }
        Ok(state)
    }

    // --- Seeding ---

    /// Create a repository whose default branch holds `files`. Returns the head sha.
    pub fn add_repo(&self, repo: &RepoRef, default_branch: &str, files: &[(&str, &str)]) -> String {
        let mut state = self.state();
        let now = state.tick();
        let mut rs = RepoState {
            default_branch: default_branch.to_string(),
            next_number: 1,
            ..Default::default()
        };
        let mut tree = BTreeMap::new();
        for (path, content) in files {
            let blob = rs.store_blob(content.as_bytes());
            tree.insert(path.to_string(), blob);
        }
        let tree = rs.store_tree(tree);
        let head = rs.store_commit("Initial commit", &tree, Vec::new(), None, now);
        rs.branches.insert(default_branch.to_string(), head.clone());
        state.repos.insert(repo.clone(), rs);
        head
    }

    /// Open an issue assigned to the bot. Returns its number.
    pub fn add_issue(&self, repo: &RepoRef, title: &str, body: &str, author: &str) -> u64 {
        let mut state = self.state();
        let now = state.tick();
        let bot = self.bot_login.clone();
        let Some(rs) = state.repos.get_mut(repo) else {
            return 0;
        };
        let number = rs.next_number;
        rs.next_number += 1;
        rs.issues.insert(
            number,
            IssueState {
                issue: Issue {
                    repo: repo.clone(),
                    number,
                    title: title.to_string(),
                    body: body.to_string(),
                    author: author.to_string(),
                    labels: Vec::new(),
                    assignees: vec![bot],
                    is_pull_request: false,
                    updated_at: now,
                },
                open: true,
                comments: Vec::new(),
                events: Vec::new(),
                reviews: Vec::new(),
            },
        );
        number
    }

    /// Open a pull request from `head_branch` opened by a human, assigned to the bot.
    pub fn add_pull(&self, repo: &RepoRef, head_branch: &str, title: &str, author: &str) -> u64 {
        let number = self.add_issue(repo, title, "", author);
        let mut state = self.state();
        let now = state.clock;
        let Some(rs) = state.repos.get_mut(repo) else {
            return 0;
        };
        let base = rs.default_branch.clone();
        let head_sha = rs.branches.get(head_branch).cloned().unwrap_or_default();
        if let Some(issue) = rs.issues.get_mut(&number) {
            issue.issue.is_pull_request = true;
        }
        rs.pulls.insert(
            number,
            PullRequest {
                number,
                title: title.to_string(),
                body: String::new(),
                head_branch: head_branch.to_string(),
                head_sha,
                base_branch: base,
                html_url: format!("https://example.test/{}/pull/{}", repo, number),
                open: true,
                updated_at: now,
            },
        );
        number
    }

    /// Apply a label on behalf of `actor`.
    pub fn label_as(&self, repo: &RepoRef, number: u64, label: &str, actor: &str) {
        let mut state = self.state();
        let now = state.tick();
        if let Ok(issue) = state.issue_mut(repo, number) {
            if !issue.issue.has_label(label) {
                issue.issue.labels.push(label.to_string());
                issue.events.push(LabelEvent {
                    label: label.to_string(),
                    action: LabelAction::Added,
                    actor: actor.to_string(),
                    created_at: now,
                });
                issue.issue.updated_at = now;
            }
        }
    }

    /// Post a comment as a human.
    pub fn comment_as(&self, repo: &RepoRef, number: u64, author: &str, body: &str) {
        let mut state = self.state();
        let now = state.tick();
        let id = state.next_id;
        state.next_id += 1;
        if let Ok(issue) = state.issue_mut(repo, number) {
            issue.comments.push(Comment {
                id,
                author: author.to_string(),
                author_is_bot: false,
                body: body.to_string(),
                created_at: now,
            });
            issue.issue.updated_at = now;
        }
    }

    pub fn review_as(&self, repo: &RepoRef, number: u64, author: &str, state_name: &str, body: &str) {
        let mut state = self.state();
        let now = state.tick();
        if let Ok(issue) = state.issue_mut(repo, number) {
            issue.reviews.push(Review {
                author: author.to_string(),
                author_is_bot: false,
                state: state_name.to_string(),
                body: body.to_string(),
                submitted_at: Some(now),
            });
        }
    }

    /// Commit a single file change to `branch` as `author`, creating the branch
    /// from the default branch when missing.
    pub fn push_file(&self, repo: &RepoRef, branch: &str, path: &str, content: &str, author: &str) -> String {
        let mut state = self.state();
        let now = state.tick();
        let Some(rs) = state.repos.get_mut(repo) else {
            return String::new();
        };
        let parent = rs
            .branches
            .get(branch)
            .or_else(|| rs.branches.get(&rs.default_branch))
            .cloned()
            .unwrap_or_default();
        let mut files = rs.files_at_commit(&parent).cloned().unwrap_or_default();
        let blob = rs.store_blob(content.as_bytes());
        files.insert(path.to_string(), blob);
        let tree = rs.store_tree(files);
        let sha = rs.store_commit(
            &format!("Update {}", path),
            &tree,
            vec![parent],
            Some(author.to_string()),
            now,
        );
        rs.branches.insert(branch.to_string(), sha.clone());
        sha
    }

    pub fn close_issue(&self, repo: &RepoRef, number: u64) {
        if let Ok(issue) = self.state().issue_mut(repo, number) {
            issue.open = false;
        }
    }

    /// Conclusions handed out, in order, to the next dispatched validation runs.
    /// Once exhausted every run concludes `success`.
    pub fn script_validation(&self, repo: &RepoRef, conclusions: &[&str]) {
        if let Ok(rs) = self.state().repo_mut(repo) {
            rs.scripted_conclusions
                .extend(conclusions.iter().map(|c| c.to_string()));
        }
    }

    /// Make every call fail with an authentication error.
    pub fn revoke_token(&self) {
        self.state().unauthorized = true;
    }

    /// Fail the next `count` `list_assigned` calls with a transient HTTP error.
    pub fn fail_next_listings(&self, count: u32) {
        self.state().list_failures = count;
    }

    /// Just before the next removal of `label` on `number`, another client
    /// removes and re-applies it, as a racing claimer would.
    pub fn reapply_before_next_removal(&self, repo: &RepoRef, number: u64, label: &str) {
        self.state()
            .reapply_before_removal
            .push((repo.clone(), number, label.to_string()));
    }

    // --- Inspection ---

    pub fn labels(&self, repo: &RepoRef, number: u64) -> Vec<String> {
        self.state()
            .issue_mut(repo, number)
            .map(|i| i.issue.labels.clone())
            .unwrap_or_default()
    }

    pub fn comments(&self, repo: &RepoRef, number: u64) -> Vec<Comment> {
        self.state()
            .issue_mut(repo, number)
            .map(|i| i.comments.clone())
            .unwrap_or_default()
    }

    /// First-parent history of `branch`, newest first.
    pub fn commit_log(&self, repo: &RepoRef, branch: &str) -> Vec<CommitInfo> {
        let state = self.state();
        let Ok(rs) = state.repo(repo) else {
            return Vec::new();
        };
        let mut log = Vec::new();
        let mut cursor = rs.branches.get(branch).cloned();
        while let Some(sha) = cursor {
            let Some(commit) = rs.commits.get(&sha) else {
                break;
            };
            cursor = commit.parents.first().cloned();
            log.push(commit.clone());
        }
        log
    }

    /// Content of `path` at the head of `branch`.
    pub fn file_at(&self, repo: &RepoRef, branch: &str, path: &str) -> Option<String> {
        let state = self.state();
        let rs = state.repo(repo).ok()?;
        let head = rs.branches.get(branch)?;
        let blob = rs.files_at_commit(head)?.get(path)?;
        rs.blobs
            .get(blob)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn pulls(&self, repo: &RepoRef) -> Vec<PullRequest> {
        let state = self.state();
        match state.repo(repo) {
            Ok(rs) => rs.pulls.values().map(|p| rs.refresh_pull(p)).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn workflow_runs(&self, repo: &RepoRef) -> Vec<WorkflowRun> {
        let state = self.state();
        match state.repo(repo) {
            Ok(rs) => rs.runs.iter().map(|(_, r)| r.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn list_assigned(&self, assignee: &str) -> Result<Vec<Issue>, PlatformError> {
        let mut state = self.checked()?;
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(PlatformError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        let mut issues: Vec<Issue> = state
            .repos
            .values()
            .flat_map(|rs| rs.issues.values())
            .filter(|i| i.open && i.issue.assignees.iter().any(|a| a == assignee))
            .map(|i| i.issue.clone())
            .collect();
        issues.sort_by(|a, b| (&a.repo, a.number).cmp(&(&b.repo, b.number)));
        Ok(issues)
    }

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> Result<Issue, PlatformError> {
        Ok(self.checked()?.issue_mut(repo, number)?.issue.clone())
    }

    async fn list_comments(&self, repo: &RepoRef, number: u64) -> Result<Vec<Comment>, PlatformError> {
        Ok(self.checked()?.issue_mut(repo, number)?.comments.clone())
    }

    async fn post_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<Comment, PlatformError> {
        let mut state = self.checked()?;
        let now = state.tick();
        let id = state.next_id;
        state.next_id += 1;
        let comment = Comment {
            id,
            author: self.bot_login.clone(),
            author_is_bot: false,
            body: body.to_string(),
            created_at: now,
        };
        let issue = state.issue_mut(repo, number)?;
        issue.comments.push(comment.clone());
        issue.issue.updated_at = now;
        Ok(comment)
    }

    async fn list_label_events(&self, repo: &RepoRef, number: u64) -> Result<Vec<LabelEvent>, PlatformError> {
        Ok(self.checked()?.issue_mut(repo, number)?.events.clone())
    }

    async fn add_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<(), PlatformError> {
        let mut state = self.checked()?;
        let now = state.tick();
        let issue = state.issue_mut(repo, number)?;
        if !issue.issue.has_label(label) {
            issue.issue.labels.push(label.to_string());
            issue.events.push(LabelEvent {
                label: label.to_string(),
                action: LabelAction::Added,
                actor: self.bot_login.clone(),
                created_at: now,
            });
        }
        Ok(())
    }

    async fn remove_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<(), PlatformError> {
        let mut state = self.checked()?;
        let racing = state
            .reapply_before_removal
            .iter()
            .position(|(r, n, l)| r == repo && *n == number && l == label);
        if let Some(pos) = racing {
            state.reapply_before_removal.remove(pos);
            let removed_at = state.tick();
            let added_at = state.tick();
            let actor = self.bot_login.clone();
            let issue = state.issue_mut(repo, number)?;
            if issue.issue.has_label(label) {
                for (action, created_at) in [
                    (LabelAction::Removed, removed_at),
                    (LabelAction::Added, added_at),
                ] {
                    issue.events.push(LabelEvent {
                        label: label.to_string(),
                        action,
                        actor: actor.clone(),
                        created_at,
                    });
                }
            }
        }
        let now = state.tick();
        let issue = state.issue_mut(repo, number)?;
        let before = issue.issue.labels.len();
        issue.issue.labels.retain(|l| l != label);
        if issue.issue.labels.len() == before {
            return Err(not_found(format!("label {} on #{}", label, number)));
        }
        issue.events.push(LabelEvent {
            label: label.to_string(),
            action: LabelAction::Removed,
            actor: self.bot_login.clone(),
            created_at: now,
        });
        Ok(())
    }

    async fn get_pull(&self, repo: &RepoRef, number: u64) -> Result<PullRequest, PlatformError> {
        let state = self.checked()?;
        let rs = state.repo(repo)?;
        rs.pulls
            .get(&number)
            .map(|p| rs.refresh_pull(p))
            .ok_or_else(|| not_found(format!("pull {}#{}", repo, number)))
    }

    async fn find_pull_by_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<PullRequest>, PlatformError> {
        let state = self.checked()?;
        let rs = state.repo(repo)?;
        Ok(rs
            .pulls
            .values()
            .find(|p| p.open && p.head_branch == branch)
            .map(|p| rs.refresh_pull(p)))
    }

    async fn list_pull_files(&self, repo: &RepoRef, number: u64) -> Result<Vec<FileChange>, PlatformError> {
        let state = self.checked()?;
        let rs = state.repo(repo)?;
        let pull = rs
            .pulls
            .get(&number)
            .ok_or_else(|| not_found(format!("pull {}#{}", repo, number)))?;
        let empty = BTreeMap::new();
        let head = rs
            .branches
            .get(&pull.head_branch)
            .and_then(|sha| rs.files_at_commit(sha))
            .unwrap_or(&empty);
        let base = rs
            .branches
            .get(&pull.base_branch)
            .and_then(|sha| rs.files_at_commit(sha))
            .unwrap_or(&empty);

        let line_count = |blob: &str| -> u64 {
            rs.blobs
                .get(blob)
                .map(|b| String::from_utf8_lossy(b).lines().count() as u64)
                .unwrap_or(0)
        };

        let paths: BTreeSet<&String> = head.keys().chain(base.keys()).collect();
        let mut changes = Vec::new();
        for path in paths {
            let change = match (base.get(path), head.get(path)) {
                (None, Some(new)) => ("added", line_count(new), 0),
                (Some(old), None) => ("removed", 0, line_count(old)),
                (Some(old), Some(new)) if old != new => {
                    ("modified", line_count(new), line_count(old))
                }
                _ => continue,
            };
            changes.push(FileChange {
                path: path.clone(),
                status: change.0.to_string(),
                additions: change.1,
                deletions: change.2,
            });
        }
        Ok(changes)
    }

    async fn list_reviews(&self, repo: &RepoRef, number: u64) -> Result<Vec<Review>, PlatformError> {
        Ok(self.checked()?.issue_mut(repo, number)?.reviews.clone())
    }

    async fn create_pull(&self, repo: &RepoRef, pull: &NewPullRequest) -> Result<PullRequest, PlatformError> {
        let mut state = self.checked()?;
        let now = state.tick();
        let bot = self.bot_login.clone();
        let rs = state.repo_mut(repo)?;
        let head_sha = rs
            .branches
            .get(&pull.head)
            .cloned()
            .ok_or_else(|| PlatformError::Conflict(format!("head branch {} missing", pull.head)))?;
        if rs.pulls.values().any(|p| p.open && p.head_branch == pull.head) {
            return Err(PlatformError::Conflict(format!(
                "a pull request already exists for {}",
                pull.head
            )));
        }
        let number = rs.next_number;
        rs.next_number += 1;
        let created = PullRequest {
            number,
            title: pull.title.clone(),
            body: pull.body.clone(),
            head_branch: pull.head.clone(),
            head_sha,
            base_branch: pull.base.clone(),
            html_url: format!("https://example.test/{}/pull/{}", repo, number),
            open: true,
            updated_at: now,
        };
        rs.pulls.insert(number, created.clone());
        rs.issues.insert(
            number,
            IssueState {
                issue: Issue {
                    repo: repo.clone(),
                    number,
                    title: pull.title.clone(),
                    body: pull.body.clone(),
                    author: bot,
                    labels: Vec::new(),
                    assignees: Vec::new(),
                    is_pull_request: true,
                    updated_at: now,
                },
                open: true,
                comments: Vec::new(),
                events: Vec::new(),
                reviews: Vec::new(),
            },
        );
        Ok(created)
    }

    async fn update_pull(&self, repo: &RepoRef, number: u64, title: &str, body: &str) -> Result<PullRequest, PlatformError> {
        let mut state = self.checked()?;
        let now = state.tick();
        let rs = state.repo_mut(repo)?;
        let pull = rs
            .pulls
            .get_mut(&number)
            .ok_or_else(|| not_found(format!("pull {}#{}", repo, number)))?;
        pull.title = title.to_string();
        pull.body = body.to_string();
        pull.updated_at = now;
        let pull = pull.clone();
        Ok(rs.refresh_pull(&pull))
    }

    async fn default_branch(&self, repo: &RepoRef) -> Result<String, PlatformError> {
        Ok(self.checked()?.repo(repo)?.default_branch.clone())
    }

    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>, PlatformError> {
        Ok(self.checked()?.repo(repo)?.branches.get(branch).cloned())
    }

    async fn get_commit(&self, repo: &RepoRef, sha: &str) -> Result<CommitInfo, PlatformError> {
        self.checked()?
            .repo(repo)?
            .commits
            .get(sha)
            .cloned()
            .ok_or_else(|| not_found(format!("commit {}", sha)))
    }

    async fn get_tree(&self, repo: &RepoRef, tree_sha: &str) -> Result<Vec<TreeEntry>, PlatformError> {
        let state = self.checked()?;
        let files = state
            .repo(repo)?
            .trees
            .get(tree_sha)
            .ok_or_else(|| not_found(format!("tree {}", tree_sha)))?;

        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (path, blob) in files {
            let mut prefix = path.as_str();
            while let Some((parent, _)) = prefix.rsplit_once('/') {
                dirs.insert(parent.to_string());
                prefix = parent;
            }
            entries.push(TreeEntry {
                path: path.clone(),
                kind: EntryKind::File,
                sha: blob.clone(),
            });
        }
        for dir in dirs {
            entries.push(TreeEntry {
                sha: content_sha("dir", format!("{}:{}", tree_sha, dir).as_bytes()),
                path: dir,
                kind: EntryKind::Dir,
            });
        }
        Ok(entries)
    }

    async fn get_blob(&self, repo: &RepoRef, sha: &str) -> Result<Vec<u8>, PlatformError> {
        self.checked()?
            .repo(repo)?
            .blobs
            .get(sha)
            .cloned()
            .ok_or_else(|| not_found(format!("blob {}", sha)))
    }

    async fn create_blob(&self, repo: &RepoRef, content: &[u8]) -> Result<String, PlatformError> {
        Ok(self.checked()?.repo_mut(repo)?.store_blob(content))
    }

    async fn create_tree(&self, repo: &RepoRef, base_tree: &str, changes: &[TreeChange]) -> Result<String, PlatformError> {
        let mut state = self.checked()?;
        let rs = state.repo_mut(repo)?;
        let mut files = rs
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| not_found(format!("tree {}", base_tree)))?;
        for change in changes {
            match &change.blob_sha {
                Some(blob) => {
                    if !rs.blobs.contains_key(blob) {
                        return Err(PlatformError::Conflict(format!("unknown blob {}", blob)));
                    }
                    files.insert(change.path.clone(), blob.clone());
                }
                None => {
                    files.remove(&change.path);
                }
            }
        }
        Ok(rs.store_tree(files))
    }

    async fn create_commit(&self, repo: &RepoRef, message: &str, tree_sha: &str, parents: &[String]) -> Result<String, PlatformError> {
        let mut state = self.checked()?;
        let now = state.tick();
        let rs = state.repo_mut(repo)?;
        if !rs.trees.contains_key(tree_sha) {
            return Err(PlatformError::Conflict(format!("unknown tree {}", tree_sha)));
        }
        if let Some(missing) = parents.iter().find(|p| !rs.commits.contains_key(*p)) {
            return Err(PlatformError::Conflict(format!("unknown parent {}", missing)));
        }
        Ok(rs.store_commit(
            message,
            tree_sha,
            parents.to_vec(),
            Some(self.bot_login.clone()),
            now,
        ))
    }

    async fn set_branch(&self, repo: &RepoRef, branch: &str, sha: &str) -> Result<(), PlatformError> {
        let mut state = self.checked()?;
        let rs = state.repo_mut(repo)?;
        if !rs.commits.contains_key(sha) {
            return Err(PlatformError::Conflict(format!("unknown commit {}", sha)));
        }
        rs.branches.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn dispatch_workflow(&self, repo: &RepoRef, workflow: &str, git_ref: &str) -> Result<(), PlatformError> {
        let mut state = self.checked()?;
        let now = state.tick();
        let id = state.next_id;
        state.next_id += 1;
        let rs = state.repo_mut(repo)?;
        let head_sha = rs
            .branches
            .get(git_ref)
            .cloned()
            .ok_or_else(|| PlatformError::Conflict(format!("no ref {}", git_ref)))?;
        let conclusion = rs
            .scripted_conclusions
            .pop_front()
            .unwrap_or_else(|| "success".to_string());
        let jobs = if conclusion == "success" {
            vec![JobSummary {
                name: "test".into(),
                conclusion: Some(conclusion.clone()),
                failed_steps: Vec::new(),
            }]
        } else {
            vec![JobSummary {
                name: "test".into(),
                conclusion: Some(conclusion.clone()),
                failed_steps: vec!["Run tests".into()],
            }]
        };
        rs.jobs.insert(id, jobs);
        rs.runs.push((
            workflow.to_string(),
            WorkflowRun {
                id,
                head_sha,
                head_branch: git_ref.to_string(),
                status: RunStatus::Completed,
                conclusion: Some(conclusion),
                html_url: format!("https://example.test/{}/actions/runs/{}", repo, id),
                created_at: now,
            },
        ));
        Ok(())
    }

    async fn list_workflow_runs(&self, repo: &RepoRef, workflow: &str, branch: &str) -> Result<Vec<WorkflowRun>, PlatformError> {
        let state = self.checked()?;
        let mut runs: Vec<WorkflowRun> = state
            .repo(repo)?
            .runs
            .iter()
            .filter(|(wf, run)| wf == workflow && run.head_branch == branch)
            .map(|(_, run)| run.clone())
            .collect();
        runs.reverse();
        Ok(runs)
    }

    async fn list_run_jobs(&self, repo: &RepoRef, run_id: u64) -> Result<Vec<JobSummary>, PlatformError> {
        self.checked()?
            .repo(repo)?
            .jobs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| not_found(format!("run {}", run_id)))
    }
}
