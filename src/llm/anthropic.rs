//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, ContentBlock, FinishReason, LlmProvider, Role, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};
use crate::llm::transport::{RateLimitedTransport, parse_retry_after};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    transport: RateLimitedTransport,
    config: LlmConfig,
}

impl AnthropicProvider {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            transport: RateLimitedTransport::new(client, config.rate_limit_retries),
            config,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_request(&self, body: &MessagesRequest<'_>) -> Result<MessagesResponse, LlmError> {
        let url = self.api_url();
        tracing::debug!("Sending request to Anthropic: {}", url);

        let request = self
            .transport
            .client()
            .post(&url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let response = self.transport.execute(request).await.map_err(|e| {
            tracing::error!("Anthropic request failed: {}", e);
            LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
        let response_text = response.text().await.unwrap_or_default();

        tracing::debug!("Anthropic response status: {}", status);

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                429 => LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                },
                _ => LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("HTTP {}: {}", status, response_text),
                },
            });
        }

        serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("JSON parse error: {}. Raw: {}", e, response_text),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: req.max_tokens.unwrap_or(self.config.max_tokens),
            system: &req.system,
            messages: &req.messages,
            tools: &req.tools,
            temperature: req.temperature,
        };

        let response = self.send_request(&request).await?;

        let content: Vec<ContentBlock> = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
                ResponseBlock::ToolUse { id, name, input } => {
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                ResponseBlock::Other => None,
            })
            .collect();

        let finish_reason = match response.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("tool_use") => FinishReason::ToolUse,
            Some("max_tokens") => FinishReason::Length,
            _ => FinishReason::Unknown,
        };

        Ok(ToolCompletionResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
            },
            finish_reason,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }
}

// Anthropic Messages API types

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[ToolDefinition]>::is_empty")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Json;
    use secrecy::SecretString;

    use super::*;

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            api_key: SecretString::from("sk-test".to_string()),
            base_url,
            model: "claude-test".into(),
            max_tokens: 1024,
            rate_limit_retries: 0,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![ChatMessage::user("Fix the bug")];
        let tools = vec![ToolDefinition {
            name: "read_file".into(),
            description: "Read".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let req = MessagesRequest {
            model: "claude-test",
            max_tokens: 100,
            system: "You are a bot",
            messages: &messages,
            tools: &tools,
            temperature: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["system"], "You are a bot");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["tools"][0]["input_schema"]["type"], "object");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_response_skips_unknown_blocks() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "x"},
                {"type": "text", "text": "Reading"},
                {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "a"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let parsed: MessagesResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.content.len(), 3);
        assert!(matches!(parsed.content[0], ResponseBlock::Other));
        assert_eq!(parsed.usage.input_tokens, 10);
    }

    #[tokio::test]
    async fn test_complete_with_tools_round_trip() {
        let seen = Arc::new(std::sync::Mutex::new(None::<(HeaderMap, serde_json::Value)>));
        let captured = seen.clone();
        let app = Router::new().route(
            "/v1/messages",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some((headers, body));
                    Json(serde_json::json!({
                        "content": [
                            {"type": "tool_use", "id": "toolu_9", "name": "write_file",
                             "input": {"path": "a.txt", "content": "hi"}}
                        ],
                        "stop_reason": "tool_use",
                        "usage": {"input_tokens": 3, "output_tokens": 4}
                    }))
                }
            }),
        );
        let base = serve(app).await;
        let provider = AnthropicProvider::new(config(base)).unwrap();

        let resp = provider
            .complete_with_tools(ToolCompletionRequest::new(
                "system",
                vec![ChatMessage::user("go")],
                Vec::new(),
            ))
            .await
            .unwrap();

        assert_eq!(resp.finish_reason, FinishReason::ToolUse);
        let calls = resp.message.tool_calls();
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(calls[0].arguments["path"], "a.txt");

        let (headers, body) = seen.lock().unwrap().take().unwrap();
        assert_eq!(headers["x-api-key"], "sk-test");
        assert_eq!(headers["anthropic-version"], API_VERSION);
        assert_eq!(body["model"], "claude-test");
        assert_eq!(body["max_tokens"], 1024);
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_failed() {
        let app = Router::new().route(
            "/v1/messages",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid x-api-key") }),
        );
        let base = serve(app).await;
        let provider = AnthropicProvider::new(config(base)).unwrap();

        let err = provider
            .complete_with_tools(ToolCompletionRequest::new("s", vec![ChatMessage::user("go")], Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }
}
