//! An autonomous coding agent that works GitHub issues assigned to its
//! account.
//!
//! A [`task::TaskGenerator`] polls the platform for issues carrying the
//! `bot-turn` label (or stale `bot-working`/`bot-blocked` ones), and the
//! [`agent::Bot`] claims each one, converses with the model through a fixed
//! tool set over a staging filesystem, and lands the result as a single
//! commit on a pull request.

pub mod agent;
pub mod config;
pub mod error;
pub mod fs;
pub mod history;
pub mod llm;
pub mod platform;
pub mod task;
pub mod tools;
pub mod workspace;
