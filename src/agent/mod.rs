//! Core agent logic.
//!
//! The agent:
//! - Claims tasks through label transitions on the tracked issue
//! - Runs the tool-use conversation with the model
//! - Commits the staged changes and hands the task back for review
//! - Reports limitations to a human

mod bot;
pub mod claim;
pub mod conversation;
pub mod prompt;

pub use bot::{Bot, BotDeps, TaskOutcome};
pub use conversation::{Conversation, Outcome};
