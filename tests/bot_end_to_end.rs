//! Whole-engine scenarios against the in-memory platform, a scripted model
//! and an in-memory transcript store.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use issuebot::agent::{Bot, BotDeps, TaskOutcome};
use issuebot::config::{AgentConfig, GeneratorConfig, ValidationConfig};
use issuebot::error::BotError;
use issuebot::history::{HistoryStore, MemoryHistoryStore};
use issuebot::llm::{LlmProvider, ScriptedProvider};
use issuebot::platform::{InMemoryPlatform, RepoRef};
use issuebot::task::{HANDBACK_MARKER, TaskBuilder, TaskGenerator};

const BOT: &str = "issuebot";
const BRANCH: &str = "issuebot/issue-1";

fn repo() -> RepoRef {
    RepoRef::new("acme", "widgets")
}

fn platform() -> Arc<InMemoryPlatform> {
    let platform = Arc::new(InMemoryPlatform::new(BOT));
    platform.add_repo(
        &repo(),
        "main",
        &[("src/lib.rs", "pub fn parse(s: &str) -> usize { s.len() / 0 }\n")],
    );
    platform
}

fn bot(
    platform: &Arc<InMemoryPlatform>,
    llm: &Arc<ScriptedProvider>,
    config: AgentConfig,
) -> (Bot, Arc<MemoryHistoryStore>) {
    let store = Arc::new(MemoryHistoryStore::new());
    let bot = Bot::new(
        config,
        BOT,
        BotDeps {
            platform: platform.clone(),
            llm: llm.clone() as Arc<dyn LlmProvider>,
            history: Some(store.clone() as Arc<dyn HistoryStore>),
        },
    );
    (bot, store)
}

fn builder(platform: &Arc<InMemoryPlatform>) -> TaskBuilder {
    TaskBuilder::new(platform.clone(), BOT, "issuebot")
}

fn open_issue(platform: &InMemoryPlatform) -> u64 {
    let n = platform.add_issue(&repo(), "Division by zero in parse", "parse panics on any input", "alice");
    platform.label_as(&repo(), n, "bot-turn", "alice");
    n
}

// ==================== Hand-back ====================

#[tokio::test]
async fn test_single_write_lands_one_commit() {
    let platform = platform();
    let n = open_issue(&platform);
    let llm = Arc::new(ScriptedProvider::new());
    llm.push_tool_call("t1", "read_file", json!({"path": "src/lib.rs"}))
        .push_tool_call(
            "t2",
            "write_file",
            json!({"path": "src/lib.rs", "content": "pub fn parse(s: &str) -> usize { s.len() }\n"}),
        )
        .push_text("Removed the division by zero in parse.");
    let (bot, store) = bot(&platform, &llm, AgentConfig::default());

    let task = builder(&platform).build_for_number(&repo(), n).await.unwrap();
    let outcome = bot.do_task(task, &CancellationToken::new()).await.unwrap();

    let TaskOutcome::HandedBack { pull, commit } = outcome else {
        panic!("expected hand-back, got {:?}", outcome);
    };
    assert!(commit.is_some());
    assert_eq!(platform.labels(&repo(), n), vec!["bot-turn"]);

    // initial commit plus exactly one from the attempt
    let log = platform.commit_log(&repo(), BRANCH);
    assert_eq!(log.len(), 2);
    assert_eq!(
        platform.file_at(&repo(), BRANCH, "src/lib.rs").unwrap(),
        "pub fn parse(s: &str) -> usize { s.len() }\n"
    );
    assert_eq!(
        platform.file_at(&repo(), "main", "src/lib.rs").unwrap(),
        "pub fn parse(s: &str) -> usize { s.len() / 0 }\n"
    );

    let pulls = platform.pulls(&repo());
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].number, pull);
    assert_eq!(pulls[0].head_branch, BRANCH);
    assert_eq!(pulls[0].base_branch, "main");

    let comments = platform.comments(&repo(), n);
    let last = comments.last().unwrap();
    assert!(last.body.starts_with("Removed the division by zero in parse."));
    assert!(last.body.contains(HANDBACK_MARKER));

    let saved = store.load(&format!("{}#{}", repo(), n)).await.unwrap().unwrap();
    assert!(saved.uncommitted().is_empty());
}

// ==================== Blocked ====================

#[tokio::test]
async fn test_limitation_blocks_without_commit() {
    let platform = platform();
    let n = open_issue(&platform);
    let llm = Arc::new(ScriptedProvider::new());
    llm.push_tool_call(
        "t1",
        "report_limitation",
        json!({
            "reason": "The fix depends on the production schema",
            "missing_capability": "no database access"
        }),
    );
    let (bot, _) = bot(&platform, &llm, AgentConfig::default());

    let task = builder(&platform).build_for_number(&repo(), n).await.unwrap();
    let outcome = bot.do_task(task, &CancellationToken::new()).await.unwrap();

    match outcome {
        TaskOutcome::Blocked(limitation) => {
            assert_eq!(limitation.missing_capability, "no database access")
        }
        other => panic!("expected blocked, got {:?}", other),
    }
    assert_eq!(platform.labels(&repo(), n), vec!["bot-blocked"]);
    assert!(platform.commit_log(&repo(), BRANCH).is_empty());
    assert!(platform.pulls(&repo()).is_empty());

    let comments = platform.comments(&repo(), n);
    assert!(comments.last().unwrap().body.contains("no database access"));
}

// ==================== Validation ====================

#[tokio::test]
async fn test_validation_retry_produces_one_commit() {
    let platform = platform();
    platform.script_validation(&repo(), &["failure"]);
    let n = open_issue(&platform);
    let llm = Arc::new(ScriptedProvider::new());
    llm.push_tool_call(
        "t1",
        "write_file",
        json!({"path": "src/lib.rs", "content": "pub fn parse(s: &str) -> usize { s.len() / 1 }\n"}),
    )
    .push_tool_call("t2", "trigger_validation", json!({}))
    .push_tool_call(
        "t3",
        "edit_file",
        json!({"path": "src/lib.rs", "old_string": "s.len() / 1", "new_string": "s.len()"}),
    )
    .push_tool_call("t4", "trigger_validation", json!({}));
    let config = AgentConfig {
        validation: Some(ValidationConfig::new("ci.yml")),
        ..AgentConfig::default()
    };
    let (bot, _) = bot(&platform, &llm, config);

    let task = builder(&platform).build_for_number(&repo(), n).await.unwrap();
    let outcome = bot.do_task(task, &CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, TaskOutcome::HandedBack { commit: Some(_), .. }));
    assert_eq!(platform.workflow_runs(&repo()).len(), 2);
    assert_eq!(platform.commit_log(&repo(), BRANCH).len(), 2);
    assert_eq!(
        platform.file_at(&repo(), BRANCH, "src/lib.rs").unwrap(),
        "pub fn parse(s: &str) -> usize { s.len() }\n"
    );
    assert_eq!(platform.labels(&repo(), n), vec!["bot-turn"]);
    // the conversation ended on the passing run
    assert_eq!(llm.remaining(), 0);
    assert_eq!(llm.requests().len(), 4);
}

#[tokio::test]
async fn test_finishing_unvalidated_changes_prompts_for_validation() {
    let platform = platform();
    let n = open_issue(&platform);
    let llm = Arc::new(ScriptedProvider::new());
    llm.push_tool_call(
        "t1",
        "write_file",
        json!({"path": "src/lib.rs", "content": "pub fn parse(s: &str) -> usize { s.len() }\n"}),
    )
    .push_text("Done.")
    .push_tool_call("t2", "trigger_validation", json!({}));
    let config = AgentConfig {
        validation: Some(ValidationConfig::new("ci.yml")),
        ..AgentConfig::default()
    };
    let (bot, _) = bot(&platform, &llm, config);

    let task = builder(&platform).build_for_number(&repo(), n).await.unwrap();
    let outcome = bot.do_task(task, &CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, TaskOutcome::HandedBack { commit: Some(_), .. }));
    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    let reminder = requests[2].messages.last().unwrap().text();
    assert!(reminder.contains("trigger_validation"));
}

// ==================== Claiming ====================

#[tokio::test]
async fn test_concurrent_engines_have_one_winner() {
    let platform = platform();
    let n = open_issue(&platform);

    // engine A claims and then waits on a model that never answers
    let llm_a = Arc::new(ScriptedProvider::new().hanging());
    let llm_b = Arc::new(ScriptedProvider::new());
    llm_b.push_text("Nothing to do.");
    let (bot_a, _) = bot(&platform, &llm_a, AgentConfig::default());
    let (bot_b, _) = bot(&platform, &llm_b, AgentConfig::default());

    // both engines see the item in bot-turn before either claims it
    let task_a = builder(&platform).build_for_number(&repo(), n).await.unwrap();
    let task_b = builder(&platform).build_for_number(&repo(), n).await.unwrap();

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(bot_a.do_task(task_a, &cancel), async {
        let outcome = bot_b.do_task(task_b, &cancel).await;
        cancel.cancel();
        outcome
    });

    assert_eq!(b.unwrap(), TaskOutcome::ClaimLost);
    assert!(matches!(a, Err(BotError::Cancelled)));
    assert!(llm_b.requests().is_empty());
    assert_eq!(llm_b.remaining(), 1);
    // A saved its transcript before the model call, so the claim is kept
    assert_eq!(platform.labels(&repo(), n), vec!["bot-working"]);
    assert!(platform.commit_log(&repo(), BRANCH).is_empty());
}

// ==================== Polling ====================

#[tokio::test]
async fn test_generator_feeds_bot_until_cancelled() {
    let platform = platform();
    let n = open_issue(&platform);
    let llm = Arc::new(ScriptedProvider::new());
    llm.push_tool_call(
        "t1",
        "write_file",
        json!({"path": "src/lib.rs", "content": "pub fn parse(s: &str) -> usize { s.len() }\n"}),
    )
    .push_text("Fixed parse.");
    let (bot, _) = bot(&platform, &llm, AgentConfig::default());

    let cancel = CancellationToken::new();
    let generator = TaskGenerator::new(
        platform.clone(),
        builder(&platform),
        GeneratorConfig {
            poll_interval: Duration::from_millis(20),
            repos: Vec::new(),
        },
    );
    let tasks = generator.generate(cancel.clone());

    let watcher = async {
        let handed_back = async {
            loop {
                let done = platform
                    .comments(&repo(), n)
                    .iter()
                    .any(|c| c.body.contains(HANDBACK_MARKER));
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let finished = tokio::time::timeout(Duration::from_secs(10), handed_back).await;
        // later polls see the hand-back and leave the item alone
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        finished
    };

    let (result, finished) = tokio::join!(bot.run(tasks, cancel.clone()), watcher);
    assert!(finished.is_ok(), "task was never handed back");
    assert!(matches!(result, Err(BotError::Cancelled)));
    assert_eq!(llm.requests().len(), 2);
    assert_eq!(platform.commit_log(&repo(), BRANCH).len(), 2);
    assert_eq!(platform.labels(&repo(), n), vec!["bot-turn"]);
}

#[tokio::test]
async fn test_revoked_token_stops_the_engine() {
    let platform = platform();
    open_issue(&platform);
    platform.revoke_token();
    let llm = Arc::new(ScriptedProvider::new());
    let (bot, _) = bot(&platform, &llm, AgentConfig::default());

    let cancel = CancellationToken::new();
    let generator = TaskGenerator::new(platform.clone(), builder(&platform), GeneratorConfig::default());
    let result = bot.run(generator.generate(cancel.clone()), cancel).await;

    let err = result.unwrap_err();
    assert!(err.is_fatal());
    assert!(llm.requests().is_empty());
}
