//! GitHub REST API implementation of [`PlatformClient`].

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::GitHubConfig;
use crate::error::PlatformError;
use crate::platform::{
    Comment, CommitInfo, EntryKind, FileChange, Issue, JobSummary, LabelAction, LabelEvent,
    NewPullRequest, PlatformClient, PullRequest, RepoRef, Review, RunStatus, TreeChange,
    TreeEntry, WorkflowRun,
};

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

/// GitHub REST client authenticated as the bot account.
pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: SecretString,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(concat!("issuebot/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn repo_path(repo: &RepoRef, rest: &str) -> String {
        format!(
            "/repos/{}/{}/{}",
            urlencoding::encode(&repo.owner),
            urlencoding::encode(&repo.name),
            rest.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header(
                "Authorization",
                format!("Bearer {}", self.token.expose_secret()),
            )
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send_raw(&self, builder: RequestBuilder) -> Result<reqwest::Response, PlatformError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!("GitHub returned HTTP {}: {}", status, body);

        Err(match status.as_u16() {
            401 => PlatformError::Unauthorized(body),
            403 if !body.to_lowercase().contains("rate limit") => {
                PlatformError::Unauthorized(body)
            }
            404 => PlatformError::NotFound(body),
            409 | 422 => PlatformError::Conflict(body),
            code => PlatformError::Http { status: code, body },
        })
    }

    async fn send<R: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<R, PlatformError> {
        let response = self.send_raw(builder).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            PlatformError::InvalidResponse(format!("JSON parse error: {}. Raw: {}", e, text))
        })
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), PlatformError> {
        self.send_raw(builder).await.map(|_| ())
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, PlatformError> {
        self.send(self.request(Method::GET, path)).await
    }

    /// Fetch every page of a list endpoint (bounded by `MAX_PAGES`).
    async fn get_all<R: DeserializeOwned>(&self, path: &str) -> Result<Vec<R>, PlatformError> {
        let sep = if path.contains('?') { '&' } else { '?' };
        let mut all = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch: Vec<R> = self
                .get(&format!("{}{}per_page={}&page={}", path, sep, PAGE_SIZE, page))
                .await?;
            let done = batch.len() < PAGE_SIZE;
            all.extend(batch);
            if done {
                break;
            }
        }
        Ok(all)
    }
}

fn encode_branch(branch: &str) -> String {
    branch
        .split('/')
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl PlatformClient for GitHubClient {
    async fn list_assigned(&self, assignee: &str) -> Result<Vec<Issue>, PlatformError> {
        let query = urlencoding::encode(&format!("is:open assignee:{}", assignee)).into_owned();
        let mut issues = Vec::new();
        for page in 1..=MAX_PAGES {
            let result: GhSearch = self
                .get(&format!(
                    "/search/issues?q={}&sort=created&order=asc&per_page={}&page={}",
                    query, PAGE_SIZE, page
                ))
                .await?;
            let done = result.items.len() < PAGE_SIZE;
            for item in result.items {
                issues.push(item.into_issue()?);
            }
            if done {
                break;
            }
        }
        Ok(issues)
    }

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> Result<Issue, PlatformError> {
        let issue: GhIssue = self
            .get(&Self::repo_path(repo, &format!("issues/{}", number)))
            .await?;
        issue.into_issue()
    }

    async fn list_comments(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<Comment>, PlatformError> {
        let comments: Vec<GhComment> = self
            .get_all(&Self::repo_path(repo, &format!("issues/{}/comments", number)))
            .await?;
        Ok(comments.into_iter().map(Into::into).collect())
    }

    async fn post_comment(
        &self,
        repo: &RepoRef,
        number: u64,
        body: &str,
    ) -> Result<Comment, PlatformError> {
        let comment: GhComment = self
            .send(
                self.request(
                    Method::POST,
                    &Self::repo_path(repo, &format!("issues/{}/comments", number)),
                )
                .json(&serde_json::json!({ "body": body })),
            )
            .await?;
        Ok(comment.into())
    }

    async fn list_label_events(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<LabelEvent>, PlatformError> {
        let events: Vec<GhEvent> = self
            .get_all(&Self::repo_path(repo, &format!("issues/{}/events", number)))
            .await?;
        Ok(events
            .into_iter()
            .filter_map(|e| {
                let action = match e.event.as_str() {
                    "labeled" => LabelAction::Added,
                    "unlabeled" => LabelAction::Removed,
                    _ => return None,
                };
                Some(LabelEvent {
                    label: e.label?.name,
                    action,
                    actor: e.actor.map(|a| a.login).unwrap_or_default(),
                    created_at: e.created_at,
                })
            })
            .collect())
    }

    async fn add_label(
        &self,
        repo: &RepoRef,
        number: u64,
        label: &str,
    ) -> Result<(), PlatformError> {
        self.send_empty(
            self.request(
                Method::POST,
                &Self::repo_path(repo, &format!("issues/{}/labels", number)),
            )
            .json(&serde_json::json!({ "labels": [label] })),
        )
        .await
    }

    async fn remove_label(
        &self,
        repo: &RepoRef,
        number: u64,
        label: &str,
    ) -> Result<(), PlatformError> {
        self.send_empty(self.request(
            Method::DELETE,
            &Self::repo_path(
                repo,
                &format!("issues/{}/labels/{}", number, urlencoding::encode(label)),
            ),
        ))
        .await
    }

    async fn get_pull(&self, repo: &RepoRef, number: u64) -> Result<PullRequest, PlatformError> {
        let pull: GhPull = self
            .get(&Self::repo_path(repo, &format!("pulls/{}", number)))
            .await?;
        Ok(pull.into())
    }

    async fn find_pull_by_head(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<PullRequest>, PlatformError> {
        let head = urlencoding::encode(&format!("{}:{}", repo.owner, branch)).into_owned();
        let pulls: Vec<GhPull> = self
            .get(&Self::repo_path(
                repo,
                &format!("pulls?state=open&head={}", head),
            ))
            .await?;
        Ok(pulls.into_iter().next().map(Into::into))
    }

    async fn list_pull_files(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<FileChange>, PlatformError> {
        let files: Vec<GhFile> = self
            .get_all(&Self::repo_path(repo, &format!("pulls/{}/files", number)))
            .await?;
        Ok(files
            .into_iter()
            .map(|f| FileChange {
                path: f.filename,
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect())
    }

    async fn list_reviews(&self, repo: &RepoRef, number: u64) -> Result<Vec<Review>, PlatformError> {
        let reviews: Vec<GhReview> = self
            .get_all(&Self::repo_path(repo, &format!("pulls/{}/reviews", number)))
            .await?;
        Ok(reviews
            .into_iter()
            .map(|r| {
                let user = r.user.unwrap_or_default();
                Review {
                    author_is_bot: user.is_bot(),
                    author: user.login,
                    state: r.state,
                    body: r.body.unwrap_or_default(),
                    submitted_at: r.submitted_at,
                }
            })
            .collect())
    }

    async fn create_pull(
        &self,
        repo: &RepoRef,
        pull: &NewPullRequest,
    ) -> Result<PullRequest, PlatformError> {
        let created: GhPull = self
            .send(
                self.request(Method::POST, &Self::repo_path(repo, "pulls"))
                    .json(&serde_json::json!({
                        "title": pull.title,
                        "body": pull.body,
                        "head": pull.head,
                        "base": pull.base,
                    })),
            )
            .await?;
        Ok(created.into())
    }

    async fn update_pull(
        &self,
        repo: &RepoRef,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, PlatformError> {
        let updated: GhPull = self
            .send(
                self.request(
                    Method::PATCH,
                    &Self::repo_path(repo, &format!("pulls/{}", number)),
                )
                .json(&serde_json::json!({ "title": title, "body": body })),
            )
            .await?;
        Ok(updated.into())
    }

    async fn default_branch(&self, repo: &RepoRef) -> Result<String, PlatformError> {
        let info: GhRepo = self.get(&Self::repo_path(repo, "")).await?;
        Ok(info.default_branch)
    }

    async fn branch_head(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<String>, PlatformError> {
        let path = Self::repo_path(repo, &format!("git/ref/heads/{}", encode_branch(branch)));
        match self.get::<GhGitRef>(&path).await {
            Ok(r) => Ok(Some(r.object.sha)),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_commit(&self, repo: &RepoRef, sha: &str) -> Result<CommitInfo, PlatformError> {
        let commit: GhCommit = self
            .get(&Self::repo_path(repo, &format!("commits/{}", sha)))
            .await?;
        Ok(CommitInfo {
            sha: commit.sha,
            tree_sha: commit.commit.tree.sha,
            parents: commit.parents.into_iter().map(|p| p.sha).collect(),
            message: commit.commit.message,
            author_login: commit.author.map(|a| a.login),
            date: commit.commit.author.date,
        })
    }

    async fn get_tree(
        &self,
        repo: &RepoRef,
        tree_sha: &str,
    ) -> Result<Vec<TreeEntry>, PlatformError> {
        let tree: GhTree = self
            .get(&Self::repo_path(
                repo,
                &format!("git/trees/{}?recursive=1", tree_sha),
            ))
            .await?;
        if tree.truncated {
            tracing::warn!(
                "Tree {} of {} was truncated by the API; listing is incomplete",
                tree_sha,
                repo
            );
        }
        Ok(tree
            .tree
            .into_iter()
            .filter_map(|e| {
                let kind = match e.entry_type.as_str() {
                    "blob" => EntryKind::File,
                    "tree" => EntryKind::Dir,
                    // Submodules are not editable through the overlay.
                    _ => return None,
                };
                Some(TreeEntry {
                    path: e.path,
                    kind,
                    sha: e.sha?,
                })
            })
            .collect())
    }

    async fn get_blob(&self, repo: &RepoRef, sha: &str) -> Result<Vec<u8>, PlatformError> {
        let blob: GhBlob = self
            .get(&Self::repo_path(repo, &format!("git/blobs/{}", sha)))
            .await?;
        if blob.encoding != "base64" {
            return Ok(blob.content.into_bytes());
        }
        let cleaned: String = blob.content.split_whitespace().collect();
        BASE64
            .decode(cleaned)
            .map_err(|e| PlatformError::InvalidResponse(format!("bad blob encoding: {}", e)))
    }

    async fn create_blob(&self, repo: &RepoRef, content: &[u8]) -> Result<String, PlatformError> {
        let created: GhSha = self
            .send(
                self.request(Method::POST, &Self::repo_path(repo, "git/blobs"))
                    .json(&serde_json::json!({
                        "content": BASE64.encode(content),
                        "encoding": "base64",
                    })),
            )
            .await?;
        Ok(created.sha)
    }

    async fn create_tree(
        &self,
        repo: &RepoRef,
        base_tree: &str,
        changes: &[TreeChange],
    ) -> Result<String, PlatformError> {
        let entries: Vec<GhNewTreeEntry<'_>> = changes
            .iter()
            .map(|c| GhNewTreeEntry {
                path: &c.path,
                mode: "100644",
                entry_type: "blob",
                sha: c.blob_sha.as_deref(),
            })
            .collect();
        let created: GhSha = self
            .send(
                self.request(Method::POST, &Self::repo_path(repo, "git/trees"))
                    .json(&serde_json::json!({ "base_tree": base_tree, "tree": entries })),
            )
            .await?;
        Ok(created.sha)
    }

    async fn create_commit(
        &self,
        repo: &RepoRef,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, PlatformError> {
        let created: GhSha = self
            .send(
                self.request(Method::POST, &Self::repo_path(repo, "git/commits"))
                    .json(&serde_json::json!({
                        "message": message,
                        "tree": tree_sha,
                        "parents": parents,
                    })),
            )
            .await?;
        Ok(created.sha)
    }

    async fn set_branch(
        &self,
        repo: &RepoRef,
        branch: &str,
        sha: &str,
    ) -> Result<(), PlatformError> {
        if self.branch_head(repo, branch).await?.is_some() {
            self.send_empty(
                self.request(
                    Method::PATCH,
                    &Self::repo_path(repo, &format!("git/refs/heads/{}", encode_branch(branch))),
                )
                .json(&serde_json::json!({ "sha": sha, "force": true })),
            )
            .await
        } else {
            self.send_empty(
                self.request(Method::POST, &Self::repo_path(repo, "git/refs"))
                    .json(&serde_json::json!({
                        "ref": format!("refs/heads/{}", branch),
                        "sha": sha,
                    })),
            )
            .await
        }
    }

    async fn dispatch_workflow(
        &self,
        repo: &RepoRef,
        workflow: &str,
        git_ref: &str,
    ) -> Result<(), PlatformError> {
        self.send_empty(
            self.request(
                Method::POST,
                &Self::repo_path(
                    repo,
                    &format!(
                        "actions/workflows/{}/dispatches",
                        urlencoding::encode(workflow)
                    ),
                ),
            )
            .json(&serde_json::json!({ "ref": git_ref })),
        )
        .await
    }

    async fn list_workflow_runs(
        &self,
        repo: &RepoRef,
        workflow: &str,
        branch: &str,
    ) -> Result<Vec<WorkflowRun>, PlatformError> {
        let runs: GhRuns = self
            .get(&Self::repo_path(
                repo,
                &format!(
                    "actions/workflows/{}/runs?branch={}&per_page=20",
                    urlencoding::encode(workflow),
                    urlencoding::encode(branch)
                ),
            ))
            .await?;
        Ok(runs
            .workflow_runs
            .into_iter()
            .map(|r| WorkflowRun {
                id: r.id,
                head_sha: r.head_sha,
                head_branch: r.head_branch.unwrap_or_default(),
                status: RunStatus::parse(r.status.as_deref().unwrap_or("queued")),
                conclusion: r.conclusion,
                html_url: r.html_url,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn list_run_jobs(
        &self,
        repo: &RepoRef,
        run_id: u64,
    ) -> Result<Vec<JobSummary>, PlatformError> {
        let jobs: GhJobs = self
            .get(&Self::repo_path(repo, &format!("actions/runs/{}/jobs", run_id)))
            .await?;
        Ok(jobs
            .jobs
            .into_iter()
            .map(|j| JobSummary {
                name: j.name,
                conclusion: j.conclusion,
                failed_steps: j
                    .steps
                    .into_iter()
                    .filter(|s| s.conclusion.as_deref() == Some("failure"))
                    .map(|s| s.name)
                    .collect(),
            })
            .collect())
    }
}

// GitHub REST wire types

#[derive(Debug, Default, Deserialize)]
struct GhUser {
    login: String,
    #[serde(rename = "type", default)]
    user_type: String,
}

impl GhUser {
    fn is_bot(&self) -> bool {
        self.user_type == "Bot"
    }
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhSearch {
    items: Vec<GhIssue>,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    body: Option<String>,
    user: GhUser,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    assignees: Vec<GhUser>,
    pull_request: Option<serde_json::Value>,
    updated_at: DateTime<Utc>,
    repository_url: String,
}

impl GhIssue {
    fn into_issue(self) -> Result<Issue, PlatformError> {
        let repo = repo_from_url(&self.repository_url)?;
        Ok(Issue {
            repo,
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            author: self.user.login,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            assignees: self.assignees.into_iter().map(|a| a.login).collect(),
            is_pull_request: self.pull_request.is_some(),
            updated_at: self.updated_at,
        })
    }
}

/// `https://api.github.com/repos/{owner}/{name}` → `RepoRef`.
fn repo_from_url(url: &str) -> Result<RepoRef, PlatformError> {
    let mut parts = url.trim_end_matches('/').rsplit('/');
    match (parts.next(), parts.next()) {
        (Some(name), Some(owner)) if !name.is_empty() && !owner.is_empty() => {
            Ok(RepoRef::new(owner, name))
        }
        _ => Err(PlatformError::InvalidResponse(format!(
            "unexpected repository_url: {}",
            url
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
    user: GhUser,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<GhComment> for Comment {
    fn from(c: GhComment) -> Self {
        Comment {
            id: c.id,
            author_is_bot: c.user.is_bot(),
            author: c.user.login,
            body: c.body.unwrap_or_default(),
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhEvent {
    event: String,
    actor: Option<GhUser>,
    label: Option<GhLabel>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhPullRef {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    title: String,
    body: Option<String>,
    head: GhPullRef,
    base: GhPullRef,
    html_url: String,
    state: String,
    updated_at: DateTime<Utc>,
}

impl From<GhPull> for PullRequest {
    fn from(p: GhPull) -> Self {
        PullRequest {
            number: p.number,
            title: p.title,
            body: p.body.unwrap_or_default(),
            head_branch: p.head.ref_name,
            head_sha: p.head.sha,
            base_branch: p.base.ref_name,
            html_url: p.html_url,
            open: p.state == "open",
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhFile {
    filename: String,
    status: String,
    additions: u64,
    deletions: u64,
}

#[derive(Debug, Deserialize)]
struct GhReview {
    user: Option<GhUser>,
    state: String,
    body: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GhSha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhGitRef {
    object: GhSha,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    sha: String,
    commit: GhCommitDetail,
    author: Option<GhUser>,
    #[serde(default)]
    parents: Vec<GhSha>,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    message: String,
    tree: GhSha,
    author: GhCommitAuthor,
}

#[derive(Debug, Deserialize)]
struct GhCommitAuthor {
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhTree {
    tree: Vec<GhTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct GhTreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
    sha: Option<String>,
}

#[derive(Debug, Serialize)]
struct GhNewTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    entry_type: &'static str,
    /// Serialized as `null` for deletions.
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GhBlob {
    content: String,
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct GhRuns {
    workflow_runs: Vec<GhRun>,
}

#[derive(Debug, Deserialize)]
struct GhRun {
    id: u64,
    head_sha: String,
    head_branch: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    html_url: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhJobs {
    jobs: Vec<GhJob>,
}

#[derive(Debug, Deserialize)]
struct GhJob {
    name: String,
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<GhStep>,
}

#[derive(Debug, Deserialize)]
struct GhStep {
    name: String,
    conclusion: Option<String>,
}
