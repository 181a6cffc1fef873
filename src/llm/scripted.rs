//! Scripted provider for tests and offline dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, ContentBlock, FinishReason, LlmProvider, Role, ToolCompletionRequest,
    ToolCompletionResponse,
};

/// Replays queued assistant messages in order and records every request.
///
/// When the queue is empty the provider either answers with a plain "done"
/// message or, in hanging mode, never answers at all.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatMessage, LlmError>>>,
    requests: Mutex<Vec<ToolCompletionRequest>>,
    hang_when_empty: bool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hang_when_empty: false,
        }
    }

    /// Never respond once the script runs out.
    pub fn hanging(mut self) -> Self {
        self.hang_when_empty = true;
        self
    }

    pub fn push(&self, message: ChatMessage) -> &Self {
        self.lock_responses().push_back(Ok(message));
        self
    }

    pub fn push_error(&self, error: LlmError) -> &Self {
        self.lock_responses().push_back(Err(error));
        self
    }

    /// Queue an assistant turn that calls one tool.
    pub fn push_tool_call(&self, id: &str, name: &str, input: serde_json::Value) -> &Self {
        self.push(ChatMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
        })
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push(ChatMessage::assistant(text))
    }

    pub fn requests(&self) -> Vec<ToolCompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock_responses().len()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ChatMessage, LlmError>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req);

        let next = self.lock_responses().pop_front();
        let message = match next {
            Some(result) => result?,
            None if self.hang_when_empty => std::future::pending().await,
            None => ChatMessage::assistant("done"),
        };

        let finish_reason = if message.tool_calls().is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        };
        Ok(ToolCompletionResponse {
            message,
            finish_reason,
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}
