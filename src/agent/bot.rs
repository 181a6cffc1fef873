//! The agent engine.
//!
//! [`Bot::run`] drains a task stream one task at a time; [`Bot::do_task`]
//! processes a single task: claim, converse, then hand back, block or close
//! out.
//!
//! Tasks reach the engine as snapshots that may be minutes old. The task is
//! rebuilt from the platform before any decision is made on its labels.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AgentConfig;
use crate::error::{BotError, PlatformError};
use crate::history::{ConversationHistory, HistoryStore};
use crate::llm::{ChatMessage, ContentBlock, LlmProvider};
use crate::platform::{NewPullRequest, PlatformClient, PullRequest};
use crate::task::{
    BotLabel, Task, TaskBuilder, TaskStream, issue_from_branch, needs_attention, validation_branch,
};
use crate::tools::{Limitation, ToolRegistry};
use crate::workspace::{RemoteWorkspace, Workspace};

use super::claim::{acquire, release, transition};
use super::conversation::{Conversation, Outcome};
use super::prompt;

/// External services the engine talks to.
pub struct BotDeps {
    pub platform: Arc<dyn PlatformClient>,
    pub llm: Arc<dyn LlmProvider>,
    /// Transcript store; `None` starts every attempt from scratch.
    pub history: Option<Arc<dyn HistoryStore>>,
}

/// How a task attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The bot handed the task back and nobody has responded yet.
    Skipped,
    /// Another actor moved the label first.
    ClaimLost,
    /// Changes (if any) were pushed and the task is back with the humans.
    HandedBack { pull: u64, commit: Option<String> },
    /// Nothing needed changing; the bot labels were removed.
    ClosedOut,
    Blocked(Limitation),
}

pub struct Bot {
    config: AgentConfig,
    bot_login: String,
    platform: Arc<dyn PlatformClient>,
    llm: Arc<dyn LlmProvider>,
    history: Option<Arc<dyn HistoryStore>>,
    tools: ToolRegistry,
    builder: TaskBuilder,
}

impl Bot {
    pub fn new(config: AgentConfig, bot_login: impl Into<String>, deps: BotDeps) -> Self {
        let tools = ToolRegistry::builtin(config.validation.is_some());
        let bot_login = bot_login.into();
        let builder = TaskBuilder::new(deps.platform.clone(), bot_login.clone(), config.branch_prefix.clone())
            .with_validation_workflow(config.validation.as_ref().map(|v| v.workflow.clone()));
        Self {
            config,
            bot_login,
            platform: deps.platform,
            llm: deps.llm,
            history: deps.history,
            tools,
            builder,
        }
    }

    /// Process tasks until the stream ends or a fatal error occurs.
    ///
    /// Returns [`BotError::Cancelled`] when `cancel` fired.
    pub async fn run(&self, mut tasks: TaskStream, cancel: CancellationToken) -> Result<(), BotError> {
        tracing::info!("Bot {} started", self.bot_login);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tasks.next() => next,
            };

            match next {
                None => break,
                Some(Err(e)) if e.is_fatal() => return Err(e),
                Some(Err(e)) => tracing::warn!("Task source error: {}", e),
                Some(Ok(task)) => {
                    let key = task.key.clone();
                    match self.do_task(task, &cancel).await {
                        Ok(outcome) => tracing::info!("Task {} finished: {:?}", key, outcome),
                        Err(e) if e.is_fatal() => {
                            tracing::error!("Task {} failed fatally: {}", key, e);
                            return Err(e);
                        }
                        Err(e) => tracing::error!("Task {} failed: {}", key, e),
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!("Bot cancelled");
            return Err(BotError::Cancelled);
        }
        Ok(())
    }

    /// Process exactly one task.
    pub async fn do_task(&self, task: Task, cancel: &CancellationToken) -> Result<TaskOutcome, BotError> {
        let span = tracing::info_span!("task", key = %task.key);
        self.process(task, cancel).instrument(span).await
    }

    async fn process(&self, snapshot: Task, cancel: &CancellationToken) -> Result<TaskOutcome, BotError> {
        let task = self
            .builder
            .build_for_number(&snapshot.key.repo, snapshot.key.number)
            .await?;
        if task.awaiting_review() {
            tracing::debug!("Handed back and awaiting review, skipping");
            return Ok(TaskOutcome::Skipped);
        }
        if snapshot.bot_label.is_some() && task.bot_label.is_none() {
            tracing::info!("Bot labels were removed, skipping");
            return Ok(TaskOutcome::ClaimLost);
        }
        if task.bot_label.is_some() && !needs_attention(&task) {
            tracing::info!("Now labelled {:?} and not waiting on the bot, skipping", task.bot_label);
            return Ok(TaskOutcome::ClaimLost);
        }
        if !self.claim(&task).await? {
            tracing::info!("Claim lost, skipping");
            return Ok(TaskOutcome::ClaimLost);
        }
        tracing::info!("Claimed {}", task.key);

        let mut saved = false;
        match self.attempt(&task, cancel, &mut saved).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abandon(&task, saved).await;
                Err(e)
            }
        }
    }

    async fn claim(&self, task: &Task) -> Result<bool, PlatformError> {
        let key = &task.key;
        match task.bot_label {
            Some(label) => {
                acquire(
                    self.platform.as_ref(),
                    &key.repo,
                    key.number,
                    label,
                    task.label_applied_at,
                )
                .await
            }
            None => {
                self.platform
                    .add_label(&key.repo, key.number, BotLabel::Working.as_str())
                    .await?;
                Ok(true)
            }
        }
    }

    /// One claimed attempt. Sets `saved` once the transcript is persisted
    /// far enough for a later attempt to resume.
    async fn attempt(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        saved: &mut bool,
    ) -> Result<TaskOutcome, BotError> {
        let mut history = self.prepare_history(task).await?;
        let mut workspace = self.open_workspace(task).await?;

        let conversation = Conversation {
            llm: self.llm.as_ref(),
            tools: &self.tools,
            store: self.history.as_deref(),
            platform: self.platform.as_ref(),
            task,
            cancel,
            max_turns: self.config.max_turns,
        };

        let outcome = match conversation.replay(&history, &mut workspace).await {
            Ok(_) => conversation.run(&mut history, &mut workspace).await,
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                *saved = self.persist(&history).await;
                return Err(e);
            }
        };
        *saved = self.history.is_some();

        match outcome {
            Outcome::Done { summary } => self.finish(task, &mut history, &mut workspace, &summary).await,
            Outcome::Blocked(limitation) => self.block(task, limitation).await,
        }
    }

    /// Load the saved transcript or start a new one, folding in human
    /// feedback that arrived since it was saved.
    async fn prepare_history(&self, task: &Task) -> Result<ConversationHistory, BotError> {
        let key = task.key.to_string();
        let stored = match &self.history {
            Some(store) => store.load(&key).await?,
            None => None,
        };

        let Some(mut history) = stored else {
            let mut history = ConversationHistory::new(
                key,
                prompt::system_prompt(task, self.config.validation.is_some()),
            );
            history.push_message(ChatMessage::user(prompt::initial_message(task, &self.bot_login)));
            if let Some((at, _, _)) = self.human_feedback(task, None).last() {
                history.mark_seen(*at);
            }
            return Ok(history);
        };

        tracing::info!("Resuming saved conversation with {} turns", history.turns.len());
        let items = self.human_feedback(task, history.seen_until);
        let feedback = match items.last() {
            Some((at, _, _)) => {
                let pairs: Vec<(&str, &str)> = items.iter().map(|(_, a, b)| (*a, *b)).collect();
                let text = prompt::feedback_message(&pairs);
                history.mark_seen(*at);
                Some(text)
            }
            None => None,
        };

        if history.pending().is_some() {
            if let (Some(text), Some(turn)) = (feedback, history.turns.last_mut()) {
                turn.message.content.push(ContentBlock::Text { text });
            }
        } else if history.is_finished() && history.committed_turns >= history.turns.len() {
            let text = feedback.unwrap_or_else(|| prompt::CONTINUE_MESSAGE.to_string());
            history.push_message(ChatMessage::user(text));
        }
        Ok(history)
    }

    /// Human comments and reviews newer than `since`, oldest first.
    fn human_feedback<'t>(
        &self,
        task: &'t Task,
        since: Option<DateTime<Utc>>,
    ) -> Vec<(DateTime<Utc>, &'t str, &'t str)> {
        let since = since.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut items: Vec<(DateTime<Utc>, &str, &str)> = task
            .human_comments_since(since, &self.bot_login)
            .into_iter()
            .map(|c| (c.created_at, c.author.as_str(), c.body.as_str()))
            .collect();
        if let Some(context) = &task.pull {
            items.extend(
                context
                    .reviews
                    .iter()
                    .filter(|r| !r.author_is_bot && r.author != self.bot_login)
                    .filter(|r| !r.body.trim().is_empty())
                    .filter_map(|r| {
                        r.submitted_at
                            .filter(|at| *at > since)
                            .map(|at| (at, r.author.as_str(), r.body.as_str()))
                    }),
            );
        }
        items.sort_by_key(|(at, _, _)| *at);
        items
    }

    /// Base the workspace on the pull request head, else the task branch,
    /// else the default branch.
    async fn open_workspace(&self, task: &Task) -> Result<RemoteWorkspace, BotError> {
        let repo = &task.key.repo;
        let base = match &task.pull {
            Some(context) => context.pull.head_sha.clone(),
            None => match self.platform.branch_head(repo, &task.branch).await? {
                Some(sha) => sha,
                None => {
                    let default = self.platform.default_branch(repo).await?;
                    self.platform
                        .branch_head(repo, &default)
                        .await?
                        .ok_or_else(|| PlatformError::NotFound(format!("branch {} of {}", default, repo)))?
                }
            },
        };
        tracing::debug!("Opening workspace on {} at {}", task.branch, base);

        let workspace = RemoteWorkspace::open(
            self.platform.clone(),
            repo.clone(),
            &base,
            task.branch.clone(),
            validation_branch(&task.branch),
            self.config.validation.clone(),
        )
        .await?;
        Ok(workspace)
    }

    async fn finish(
        &self,
        task: &Task,
        history: &mut ConversationHistory,
        workspace: &mut RemoteWorkspace,
        summary: &str,
    ) -> Result<TaskOutcome, BotError> {
        let key = &task.key;
        let summary = if summary.trim().is_empty() {
            format!("Changes for #{}.", task.issue.number)
        } else {
            summary.trim().to_string()
        };

        if workspace.changelist().is_empty() {
            history.mark_committed();
            self.persist(history).await;

            return match &task.pull {
                Some(context) => {
                    tracing::info!("No changes needed, handing back");
                    self.hand_back(task, &context.pull, &summary).await?;
                    Ok(TaskOutcome::HandedBack {
                        pull: context.pull.number,
                        commit: None,
                    })
                }
                None => {
                    tracing::info!("No changes needed, closing out");
                    release(self.platform.as_ref(), &key.repo, key.number).await?;
                    self.platform
                        .post_comment(&key.repo, key.number, &prompt::no_change_comment(&summary))
                        .await?;
                    Ok(TaskOutcome::ClosedOut)
                }
            };
        }

        let commit = workspace
            .commit(&prompt::commit_message(task, &summary))
            .await?;
        history.mark_committed();
        self.persist(history).await;

        let pull = self.upsert_pull(task, &summary).await?;
        self.hand_back(task, &pull, &summary).await?;
        Ok(TaskOutcome::HandedBack {
            pull: pull.number,
            commit: Some(commit.sha),
        })
    }

    /// Create the pull request for the task branch, or refresh the one the
    /// bot opened earlier. Pull requests opened by humans are left as is.
    async fn upsert_pull(&self, task: &Task, summary: &str) -> Result<PullRequest, BotError> {
        let repo = &task.key.repo;
        let existing = match &task.pull {
            Some(context) => Some(context.pull.clone()),
            None => self.platform.find_pull_by_head(repo, &task.branch).await?,
        };

        let title = prompt::pull_title(task);
        let body = prompt::pull_body(task, summary);
        let pull = match existing {
            Some(pull) => {
                let ours = issue_from_branch(&self.config.branch_prefix, &pull.head_branch)
                    == Some(task.issue.number);
                if ours {
                    self.platform
                        .update_pull(repo, pull.number, &title, &body)
                        .await?
                } else {
                    pull
                }
            }
            None => {
                let base = self.platform.default_branch(repo).await?;
                let created = self
                    .platform
                    .create_pull(
                        repo,
                        &NewPullRequest {
                            title,
                            body,
                            head: task.branch.clone(),
                            base,
                        },
                    )
                    .await?;
                tracing::info!("Opened pull request #{}", created.number);
                created
            }
        };
        Ok(pull)
    }

    async fn hand_back(&self, task: &Task, pull: &PullRequest, summary: &str) -> Result<(), BotError> {
        let key = &task.key;
        let moved = transition(
            self.platform.as_ref(),
            &key.repo,
            key.number,
            BotLabel::Working,
            BotLabel::Turn,
        )
        .await?;
        if !moved {
            tracing::warn!("{} lost {} before hand-back", key, BotLabel::Working);
        }
        self.platform
            .post_comment(
                &key.repo,
                key.number,
                &prompt::handback_comment(&pull.html_url, summary),
            )
            .await?;
        Ok(())
    }

    async fn block(&self, task: &Task, limitation: Limitation) -> Result<TaskOutcome, BotError> {
        let key = &task.key;
        tracing::info!(
            "Blocked: {} (missing {})",
            limitation.reason,
            limitation.missing_capability
        );
        let moved = transition(
            self.platform.as_ref(),
            &key.repo,
            key.number,
            BotLabel::Working,
            BotLabel::Blocked,
        )
        .await?;
        if !moved {
            tracing::warn!("{} lost {} before blocking, leaving it alone", key, BotLabel::Working);
            return Ok(TaskOutcome::ClaimLost);
        }
        self.platform
            .post_comment(&key.repo, key.number, &prompt::blocked_comment(&limitation))
            .await?;
        Ok(TaskOutcome::Blocked(limitation))
    }

    /// Label handling after a failed attempt: keep the claim when a later
    /// attempt can resume, otherwise put the task back in the queue.
    async fn abandon(&self, task: &Task, saved: bool) {
        let key = &task.key;
        if saved {
            tracing::warn!("Attempt failed, progress saved; leaving {}", BotLabel::Working);
            return;
        }
        tracing::warn!("Attempt failed without saved progress; reverting to {}", BotLabel::Turn);
        if let Err(e) = transition(
            self.platform.as_ref(),
            &key.repo,
            key.number,
            BotLabel::Working,
            BotLabel::Turn,
        )
        .await
        {
            tracing::error!("Could not revert label on {}: {}", key, e);
        }
    }

    /// Save `history`, logging instead of failing. Returns whether it was saved.
    async fn persist(&self, history: &ConversationHistory) -> bool {
        let Some(store) = &self.history else {
            return false;
        };
        match store.save(&history.key, history).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Could not save conversation {}: {}", history.key, e);
                false
            }
        }
    }
}
