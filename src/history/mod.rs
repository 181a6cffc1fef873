//! Conversation history persistence.
//!
//! A transcript is stored per task key so that a crashed attempt resumes from
//! its last saved turn. The store is optional; without one every attempt
//! starts from scratch.

mod store;

pub use store::{FileHistoryStore, MemoryHistoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::llm::ChatMessage;

/// Current on-disk format version.
pub const HISTORY_VERSION: u32 = 1;

/// One outbound message and the model's answer to it, if one arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ChatMessage>,
}

/// The transcript of one task's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub version: u32,
    pub key: String,
    pub system_prompt: String,
    pub turns: Vec<Turn>,
    /// Turns whose staged changes were already committed. Resuming replays
    /// file edits from later turns only.
    #[serde(default)]
    pub committed_turns: usize,
    /// Newest human comment or review already shown to the model, in
    /// platform time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationHistory {
    pub fn new(key: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            version: HISTORY_VERSION,
            key: key.into(),
            system_prompt: system_prompt.into(),
            turns: Vec::new(),
            committed_turns: 0,
            seen_until: None,
            updated_at: Utc::now(),
        }
    }

    /// Start a new turn. Its response is recorded later.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.turns.push(Turn {
            message,
            response: None,
        });
        self.updated_at = Utc::now();
    }

    /// Attach `response` to the trailing turn. Returns false if there is no
    /// turn awaiting a response.
    pub fn record_response(&mut self, response: ChatMessage) -> bool {
        match self.turns.last_mut() {
            Some(turn) if turn.response.is_none() => {
                turn.response = Some(response);
                self.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// The trailing turn, if it has no response yet.
    pub fn pending(&self) -> Option<&Turn> {
        self.turns.last().filter(|t| t.response.is_none())
    }

    pub fn last_response(&self) -> Option<&ChatMessage> {
        self.turns.last().and_then(|t| t.response.as_ref())
    }

    /// The conversation ended with a model answer that requested no tools.
    pub fn is_finished(&self) -> bool {
        self.last_response()
            .is_some_and(|r| r.tool_calls().is_empty())
    }

    /// Messages in the order the model should see them.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.turns.len() * 2);
        for turn in &self.turns {
            out.push(turn.message.clone());
            if let Some(response) = &turn.response {
                out.push(response.clone());
            }
        }
        out
    }

    /// Mark everything so far as committed.
    pub fn mark_committed(&mut self) {
        self.committed_turns = self.turns.len();
        self.updated_at = Utc::now();
    }

    /// Advance the feedback watermark to `at` if it is newer.
    pub fn mark_seen(&mut self, at: DateTime<Utc>) {
        if self.seen_until.is_none_or(|seen| seen < at) {
            self.seen_until = Some(at);
        }
    }

    /// Turns not yet covered by a commit.
    pub fn uncommitted(&self) -> &[Turn] {
        &self.turns[self.committed_turns.min(self.turns.len())..]
    }

    /// Number of turns that received a model response.
    pub fn completed_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.response.is_some()).count()
    }
}

/// Durable transcript storage keyed by task.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<ConversationHistory>, HistoryError>;

    async fn save(&self, key: &str, history: &ConversationHistory) -> Result<(), HistoryError>;
}
