//! Error types for the bot.
//!
//! Each layer has its own error enum; [`BotError`] is what `Bot::run` and
//! `Bot::do_task` surface, and [`BotError::is_fatal`] decides whether the
//! engine keeps going after a failed attempt.

use std::time::Duration;

/// Configuration errors. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the model service.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("{provider} authentication failed")]
    AuthFailed { provider: String },

    #[error("{provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Errors from the code-hosting platform.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Platform authentication failed: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// Authentication failures stop the whole process; everything else only
    /// abandons the current cycle or attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlatformError::Unauthorized(_))
    }
}

/// Errors from the staging filesystem and its read-only bases.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Errors from the validation workspace.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("No validation workflow is configured")]
    ValidationNotConfigured,

    #[error("There are no staged changes")]
    NothingStaged,

    #[error("Changes for this attempt were already committed as {0}")]
    AlreadyCommitted(String),

    #[error("Cancelled")]
    Cancelled,
}

impl WorkspaceError {
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkspaceError::Cancelled => true,
            WorkspaceError::Platform(e) => e.is_fatal(),
            WorkspaceError::Fs(FsError::Platform(e)) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Errors from conversation history persistence.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported history format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Top-level error for task processing.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Tool {name} failed fatally: {reason}")]
    Tool { name: String, reason: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Cancelled")]
    Cancelled,
}

impl BotError {
    /// Fatal errors propagate out of `Bot::run` and stop the process:
    /// authentication failures, cancellation and bad configuration.
    pub fn is_fatal(&self) -> bool {
        match self {
            BotError::Config(_) | BotError::Cancelled => true,
            BotError::Llm(LlmError::AuthFailed { .. }) => true,
            BotError::Platform(e) => e.is_fatal(),
            BotError::Workspace(e) => e.is_fatal(),
            BotError::Tool { .. } => true,
            _ => false,
        }
    }
}
