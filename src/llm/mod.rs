//! Model service integration.
//!
//! The engine talks to the model through [`LlmProvider`]. Production uses the
//! Anthropic Messages API over a [`RateLimitedTransport`]; tests use
//! [`ScriptedProvider`].

mod anthropic;
mod provider;
mod scripted;
mod transport;

pub use anthropic::AnthropicProvider;
pub use provider::{
    ChatMessage, ContentBlock, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};
pub use scripted::ScriptedProvider;
pub use transport::{RateLimitedTransport, parse_retry_after};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the model provider described by `config`.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!(
        "Using Anthropic Messages API at {} with model {}",
        config.base_url,
        config.model
    );
    Ok(Arc::new(AnthropicProvider::new(config.clone())?))
}
