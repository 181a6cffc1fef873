//! Polls the platform and emits tasks that need attention.

use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::GeneratorConfig;
use crate::error::{BotError, PlatformError};
use crate::platform::{Issue, PlatformClient, RepoRef};
use crate::task::builder::TaskBuilder;
use crate::task::labels::issue_from_branch;
use crate::task::{Task, needs_attention};

/// Ordered, cancellable sequence of tasks. Ends on cancellation or after
/// yielding a fatal error.
pub type TaskStream = Pin<Box<dyn Stream<Item = Result<Task, BotError>> + Send>>;

pub struct TaskGenerator {
    platform: Arc<dyn PlatformClient>,
    builder: TaskBuilder,
    config: GeneratorConfig,
}

impl TaskGenerator {
    pub fn new(platform: Arc<dyn PlatformClient>, builder: TaskBuilder, config: GeneratorConfig) -> Self {
        Self {
            platform,
            builder,
            config,
        }
    }

    /// Start polling in the background.
    ///
    /// The first cycle runs immediately. Tasks are handed over through a
    /// channel of capacity one, so a cycle finishes only once the consumer
    /// has taken all of its tasks and cycles never overlap.
    pub fn generate(self, cancel: CancellationToken) -> TaskStream {
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                let cycle = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.poll_once() => result,
                };

                match cycle {
                    Ok(tasks) => {
                        tracing::debug!("Poll cycle found {} tasks needing attention", tasks.len());
                        for task in tasks {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = tx.send(Ok(task)) => {
                                    if sent.is_err() {
                                        tracing::debug!("Task consumer went away, stopping generator");
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!("Fatal platform error, stopping generator: {}", e);
                        let _ = tx.send(Err(BotError::Platform(e))).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("Skipping poll cycle: {}", e);
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
            tracing::info!("Task generator cancelled");
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Run one poll cycle: list, build, filter and order.
    pub async fn poll_once(&self) -> Result<Vec<Task>, PlatformError> {
        let assigned = self.platform.list_assigned(self.builder.bot_login()).await?;
        let candidates: Vec<Issue> = assigned
            .into_iter()
            .filter(|i| self.repo_allowed(&i.repo))
            .collect();

        let listed: HashSet<(RepoRef, u64)> = candidates
            .iter()
            .filter(|i| !i.is_pull_request)
            .map(|i| (i.repo.clone(), i.number))
            .collect();

        let mut tasks: BTreeMap<(u64, RepoRef), Task> = BTreeMap::new();
        for issue in candidates {
            let task = if issue.is_pull_request {
                let pull = self.platform.get_pull(&issue.repo, issue.number).await?;
                let folded = issue_from_branch(self.builder.branch_prefix(), &pull.head_branch);
                if let Some(n) = folded {
                    if listed.contains(&(issue.repo.clone(), n)) {
                        continue;
                    }
                }
                self.builder.build_for_pull(&issue.repo, issue.number).await?
            } else {
                self.builder.build(issue).await?
            };

            if needs_attention(&task) {
                tasks.insert((task.key.number, task.key.repo.clone()), task);
            }
        }

        Ok(tasks.into_values().collect())
    }

    fn repo_allowed(&self, repo: &RepoRef) -> bool {
        self.config.repos.is_empty() || self.config.repos.contains(repo)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::platform::InMemoryPlatform;

    fn repo() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    fn generator(platform: Arc<InMemoryPlatform>, interval: Duration) -> TaskGenerator {
        let builder = TaskBuilder::new(platform.clone(), "issuebot", "issuebot");
        TaskGenerator::new(
            platform,
            builder,
            GeneratorConfig {
                poll_interval: interval,
                repos: Vec::new(),
            },
        )
    }

    fn seeded() -> Arc<InMemoryPlatform> {
        let platform = Arc::new(InMemoryPlatform::new("issuebot"));
        platform.add_repo(&repo(), "main", &[("README.md", "hi")]);
        platform
    }

    #[tokio::test]
    async fn test_poll_filters_and_orders() {
        let platform = seeded();
        let a = platform.add_issue(&repo(), "first", "", "alice");
        let b = platform.add_issue(&repo(), "second", "", "alice");
        let c = platform.add_issue(&repo(), "third", "", "alice");
        platform.label_as(&repo(), c, "bot-turn", "alice");
        platform.label_as(&repo(), a, "bot-turn", "alice");
        platform.label_as(&repo(), b, "bot-working", "issuebot");

        let tasks = generator(platform, Duration::from_secs(60))
            .poll_once()
            .await
            .unwrap();
        let numbers: Vec<u64> = tasks.iter().map(|t| t.key.number).collect();
        assert_eq!(numbers, vec![a, c]);
    }

    #[tokio::test]
    async fn test_poll_respects_repo_allow_list() {
        let platform = seeded();
        let other = RepoRef::new("acme", "other");
        platform.add_repo(&other, "main", &[]);
        let n = platform.add_issue(&other, "elsewhere", "", "alice");
        platform.label_as(&other, n, "bot-turn", "alice");

        let mut generator = generator(platform, Duration::from_secs(60));
        generator.config.repos = vec![repo()];
        assert!(generator.poll_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bot_pull_is_not_a_second_task() {
        let platform = seeded();
        let n = platform.add_issue(&repo(), "Crash", "", "alice");
        platform.label_as(&repo(), n, "bot-turn", "alice");
        platform.push_file(&repo(), "issuebot/issue-1", "fix.rs", "x", "issuebot");
        platform.add_pull(&repo(), "issuebot/issue-1", "Fix", "issuebot");

        let tasks = generator(platform, Duration::from_secs(60))
            .poll_once()
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].key.number, n);
        assert!(tasks[0].pull.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_skip_cycle() {
        let platform = seeded();
        let n = platform.add_issue(&repo(), "Crash", "", "alice");
        platform.label_as(&repo(), n, "bot-turn", "alice");
        platform.fail_next_listings(2);

        let cancel = CancellationToken::new();
        let mut stream = generator(platform, Duration::from_secs(30)).generate(cancel.clone());

        // two failed cycles are skipped, the third yields the task
        let task = stream.next().await.unwrap().unwrap();
        assert_eq!(task.key.number, n);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let platform = seeded();
        platform.revoke_token();

        let mut stream = generator(platform, Duration::from_secs(30)).generate(CancellationToken::new());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_stream_during_sleep() {
        let platform = seeded();
        let cancel = CancellationToken::new();
        let mut stream = generator(platform, Duration::from_secs(3600)).generate(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert!(stream.next().await.is_none());
    }
}
