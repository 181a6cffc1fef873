//! Label vocabulary and branch naming shared with humans and CI.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::platform::{LabelAction, LabelEvent};

/// Hidden marker carried by every hand-back comment.
pub const HANDBACK_MARKER: &str = "<!-- issuebot:handback -->";

/// The attention labels. At most one is authoritative at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotLabel {
    /// Waiting for the bot.
    Turn,
    /// Claimed by the bot.
    Working,
    /// The bot needs a human.
    Blocked,
}

impl BotLabel {
    pub const ALL: [BotLabel; 3] = [BotLabel::Turn, BotLabel::Working, BotLabel::Blocked];

    pub fn as_str(self) -> &'static str {
        match self {
            BotLabel::Turn => "bot-turn",
            BotLabel::Working => "bot-working",
            BotLabel::Blocked => "bot-blocked",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        BotLabel::ALL.into_iter().find(|l| l.as_str() == label)
    }

    /// The authoritative label among `labels`.
    ///
    /// Precedence when several are present: working, blocked, turn.
    pub fn resolve<'a>(labels: impl IntoIterator<Item = &'a String>) -> Option<Self> {
        let present: Vec<BotLabel> = labels
            .into_iter()
            .filter_map(|l| BotLabel::parse(l))
            .collect();
        if present.len() > 1 {
            tracing::warn!(
                "Multiple attention labels present: {:?}",
                present.iter().map(|l| l.as_str()).collect::<Vec<_>>()
            );
        }
        [BotLabel::Working, BotLabel::Blocked, BotLabel::Turn]
            .into_iter()
            .find(|l| present.contains(l))
    }
}

impl fmt::Display for BotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When `label` was last applied according to the issue's label timeline.
pub fn last_applied(events: &[LabelEvent], label: BotLabel) -> Option<DateTime<Utc>> {
    events
        .iter()
        .filter(|e| e.action == LabelAction::Added && e.label == label.as_str())
        .map(|e| e.created_at)
        .max()
}

/// Branch holding the bot's work for issue `number`.
pub fn branch_for_issue(prefix: &str, number: u64) -> String {
    format!("{}/issue-{}", prefix, number)
}

/// Scratch branch validation runs are pushed to.
pub fn validation_branch(branch: &str) -> String {
    format!("{}-validate", branch)
}

/// Inverse of [`branch_for_issue`].
pub fn issue_from_branch(prefix: &str, branch: &str) -> Option<u64> {
    let rest = branch.strip_prefix(prefix)?.strip_prefix("/issue-")?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}
