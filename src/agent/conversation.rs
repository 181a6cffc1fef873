//! The tool-use conversation with the model.
//!
//! One [`Conversation::run`] drives a task attempt from the current end of its
//! transcript to a terminal outcome:
//!
//! ```text
//! AWAITING_MODEL -> EXECUTING_TOOLS -> AWAITING_MODEL -> ... -> Done | Blocked
//! ```
//!
//! The transcript is saved before every model call and after every response,
//! so a crashed attempt resumes where it stopped. Errors leave the transcript
//! as it was last saved and are returned to the caller.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::{BotError, WorkspaceError};
use crate::history::{ConversationHistory, HistoryStore};
use crate::llm::{ChatMessage, ContentBlock, LlmProvider, ToolCall, ToolCompletionRequest};
use crate::platform::PlatformClient;
use crate::task::Task;
use crate::tools::{Limitation, ToolContext, ToolError, ToolRegistry, ToolSignal};
use crate::workspace::Workspace;

use super::prompt::VALIDATE_REMINDER;

/// Terminal result of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The model finished. `summary` is its closing text.
    Done { summary: String },
    /// The model (or the turn budget) stopped the task for a human.
    Blocked(Limitation),
}

enum LoopState {
    AwaitingModel,
    /// Handle the model's latest response.
    ExecutingTools(ChatMessage),
}

/// Everything a conversation borrows for one attempt.
pub struct Conversation<'a> {
    pub llm: &'a dyn LlmProvider,
    pub tools: &'a ToolRegistry,
    pub store: Option<&'a dyn HistoryStore>,
    pub platform: &'a dyn PlatformClient,
    pub task: &'a Task,
    pub cancel: &'a CancellationToken,
    /// Model calls allowed in this attempt.
    pub max_turns: usize,
}

impl Conversation<'_> {
    /// Run the loop until the model finishes or blocks.
    ///
    /// `history` must end with either a turn awaiting a response or a
    /// response whose tool calls have not been answered yet; a history that
    /// ends with a finished response completes immediately.
    pub async fn run(
        &self,
        history: &mut ConversationHistory,
        workspace: &mut dyn Workspace,
    ) -> Result<Outcome, BotError> {
        let mut state = match history.turns.last() {
            None => {
                return Err(BotError::InvalidTask(format!(
                    "conversation for {} has no messages",
                    history.key
                )));
            }
            Some(turn) => match &turn.response {
                None => LoopState::AwaitingModel,
                Some(response) => LoopState::ExecutingTools(response.clone()),
            },
        };
        let mut model_calls = 0;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    if model_calls >= self.max_turns {
                        tracing::warn!("Turn budget of {} model calls exhausted", self.max_turns);
                        return Ok(Outcome::Blocked(Limitation {
                            reason: format!(
                                "The conversation used all {} model calls allowed for one attempt \
                                 without finishing.",
                                self.max_turns
                            ),
                            missing_capability: "turn budget".to_string(),
                        }));
                    }

                    self.save(history).await?;
                    let response = self.call_model(history).await?;
                    model_calls += 1;

                    history.record_response(response.clone());
                    self.save(history).await?;
                    LoopState::ExecutingTools(response)
                }
                LoopState::ExecutingTools(response) => {
                    let calls = response.tool_calls();
                    if calls.is_empty() {
                        if self.needs_validation(workspace) {
                            tracing::info!("Model finished with unvalidated changes, asking it to validate");
                            history.push_message(ChatMessage::user(VALIDATE_REMINDER));
                            LoopState::AwaitingModel
                        } else {
                            return Ok(Outcome::Done {
                                summary: response.text(),
                            });
                        }
                    } else {
                        let (results, signal) = self.execute_calls(&calls, workspace).await?;
                        history.push_message(ChatMessage::tool_results(results));

                        match signal {
                            Some(ToolSignal::Blocked(limitation)) => {
                                self.save(history).await?;
                                return Ok(Outcome::Blocked(limitation));
                            }
                            Some(ToolSignal::ValidationPassed) => {
                                self.save(history).await?;
                                return Ok(Outcome::Done {
                                    summary: response.text(),
                                });
                            }
                            None => LoopState::AwaitingModel,
                        }
                    }
                }
            };
        }
    }

    /// Re-apply the file edits recorded in the uncommitted part of `history`
    /// to a fresh workspace.
    ///
    /// Only calls of mutating tools whose recorded result was a success are
    /// replayed. Returns the number of calls replayed.
    pub async fn replay(
        &self,
        history: &ConversationHistory,
        workspace: &mut dyn Workspace,
    ) -> Result<usize, BotError> {
        let turns = history.uncommitted();
        let outcomes: HashMap<&str, bool> = turns
            .iter()
            .flat_map(|t| t.message.tool_result_ids())
            .collect();

        let mut replayed = 0;
        for response in turns.iter().filter_map(|t| t.response.as_ref()) {
            for call in response.tool_calls() {
                if outcomes.get(call.id.as_str()) != Some(&false) {
                    continue;
                }
                let Some(tool) = self.tools.get(&call.name) else {
                    continue;
                };
                if !tool.mutates_workspace() {
                    continue;
                }

                let mut ctx = self.context(workspace);
                match tool.execute(call.arguments.clone(), &mut ctx).await {
                    Ok(_) => replayed += 1,
                    Err(e) if e.is_fatal() => return Err(fatal(&call.name, e)),
                    Err(e) => {
                        tracing::warn!("Replaying {} ({}) failed: {}", call.name, call.id, e);
                    }
                }
            }
        }

        if replayed > 0 {
            tracing::info!("Replayed {} file edits from saved conversation", replayed);
        }
        Ok(replayed)
    }

    async fn call_model(&self, history: &ConversationHistory) -> Result<ChatMessage, BotError> {
        let request = ToolCompletionRequest::new(
            history.system_prompt.clone(),
            history.messages(),
            self.tools.definitions(),
        );

        tracing::debug!(
            "Calling {} with {} messages",
            self.llm.model_name(),
            request.messages.len()
        );

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(BotError::Cancelled),
            response = self.llm.complete_with_tools(request) => response?,
        };

        tracing::debug!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            finish_reason = ?response.finish_reason,
            "Model responded with {} tool calls",
            response.message.tool_calls().len()
        );
        Ok(response.message)
    }

    /// Run `calls` in order. After a blocking call the rest are answered
    /// without being executed.
    async fn execute_calls(
        &self,
        calls: &[ToolCall],
        workspace: &mut dyn Workspace,
    ) -> Result<(Vec<ContentBlock>, Option<ToolSignal>), BotError> {
        let mut results = Vec::with_capacity(calls.len());
        let mut signal: Option<ToolSignal> = None;

        for call in calls {
            if signal.is_some() {
                results.push(error_result(&call.id, "Not executed: the conversation ended."));
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(BotError::Cancelled);
            }

            let Some(tool) = self.tools.get(&call.name) else {
                tracing::warn!("Model called unknown tool {}", call.name);
                results.push(error_result(&call.id, &format!("Unknown tool: {}", call.name)));
                continue;
            };

            tracing::debug!("Executing {} ({})", call.name, call.id);
            let mut ctx = self.context(workspace);
            match tool.execute(call.arguments.clone(), &mut ctx).await {
                Ok(output) => {
                    tracing::debug!("{} finished in {:?}", call.name, output.duration);
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: output.to_content(),
                        is_error: false,
                    });
                    signal = output.signal;
                }
                Err(e) if e.is_fatal() => return Err(fatal(&call.name, e)),
                Err(e) => {
                    tracing::debug!("{} failed: {}", call.name, e);
                    results.push(error_result(&call.id, &e.to_string()));
                }
            }
        }

        Ok((results, signal))
    }

    fn needs_validation(&self, workspace: &dyn Workspace) -> bool {
        workspace.validation_configured()
            && !workspace.changelist().is_empty()
            && !workspace.is_validated()
    }

    fn context<'w>(&'w self, workspace: &'w mut dyn Workspace) -> ToolContext<'w> {
        ToolContext {
            workspace,
            platform: self.platform,
            task: self.task,
            cancel: self.cancel,
        }
    }

    async fn save(&self, history: &ConversationHistory) -> Result<(), BotError> {
        if let Some(store) = self.store {
            store.save(&history.key, history).await?;
        }
        Ok(())
    }
}

fn error_result(id: &str, message: &str) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: id.to_string(),
        content: message.to_string(),
        is_error: true,
    }
}

fn fatal(name: &str, error: ToolError) -> BotError {
    match error {
        ToolError::Cancelled => BotError::Cancelled,
        ToolError::Workspace(e) => BotError::Workspace(e),
        ToolError::Platform(e) => BotError::Platform(e),
        ToolError::Fs(e) => BotError::Workspace(WorkspaceError::Fs(e)),
        other => BotError::Tool {
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}
