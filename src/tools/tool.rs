//! Tool trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, PlatformError, WorkspaceError};
use crate::llm::ToolDefinition;
use crate::platform::PlatformClient;
use crate::task::Task;
use crate::workspace::Workspace;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Cancelled")]
    Cancelled,
}

impl ToolError {
    /// Fatal tool errors abort the conversation; every other error is
    /// reported back to the model as an error result.
    pub fn is_fatal(&self) -> bool {
        match self {
            ToolError::Cancelled => true,
            ToolError::Workspace(e) => e.is_fatal(),
            ToolError::Platform(e) => e.is_fatal(),
            ToolError::Fs(FsError::Platform(e)) => e.is_fatal(),
            _ => false,
        }
    }
}

/// A limitation reported by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    pub reason: String,
    pub missing_capability: String,
}

/// Control-flow effect of a tool call on the conversation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSignal {
    /// End the loop in the blocked state.
    Blocked(Limitation),
    /// The staged changes passed validation; end the loop as done.
    ValidationPassed,
}

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// The result data.
    pub result: serde_json::Value,
    /// Time taken.
    pub duration: Duration,
    pub signal: Option<ToolSignal>,
}

impl ToolOutput {
    /// Create a successful output with a JSON result.
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self {
            result,
            duration,
            signal: None,
        }
    }

    /// Create a text output.
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: ToolSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// The result as tool-result text for the model.
    pub fn to_content(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// What a tool may touch while it runs.
pub struct ToolContext<'a> {
    pub workspace: &'a mut dyn Workspace,
    pub platform: &'a dyn PlatformClient,
    pub task: &'a Task,
    pub cancel: &'a CancellationToken,
}

/// Trait for tools that the agent can use.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError>;

    /// Whether this tool changes the staged files.
    ///
    /// Successful calls of such tools are replayed into a fresh workspace when
    /// a saved conversation is resumed.
    fn mutates_workspace(&self) -> bool {
        false
    }

    /// Get the tool definition for model function calling.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// Fetch a required string parameter.
pub(crate) fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_content() {
        let text = ToolOutput::text("hello", Duration::from_millis(1));
        assert_eq!(text.to_content(), "hello");

        let json = ToolOutput::success(serde_json::json!({"path": "a"}), Duration::ZERO);
        assert_eq!(json.to_content(), r#"{"path":"a"}"#);
    }

    #[test]
    fn test_fatal_tool_errors() {
        assert!(ToolError::Cancelled.is_fatal());
        assert!(ToolError::Platform(PlatformError::Unauthorized("x".into())).is_fatal());
        assert!(!ToolError::Fs(FsError::FileNotFound("a".into())).is_fatal());
        assert!(!ToolError::InvalidParameters("bad".into()).is_fatal());
        assert!(!ToolError::Workspace(WorkspaceError::ValidationNotConfigured).is_fatal());
    }
}
