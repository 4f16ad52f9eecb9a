//! Anthropic Messages API client

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::client::LlmClient;
use super::error::LlmError;
use super::types::{CompletionRequest, CompletionResponse, StopReason, TokenUsage, ToolCall};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic API client
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl AnthropicClient {
    /// Build from config; the API key env var is optional (OAuth path)
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_key: std::env::var(&config.api_key_env).ok(),
            base_url: config.base_url.clone(),
            timeout,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        super::Role::User => "user",
                        super::Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": request.system_prompt,
            "messages": messages,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        body
    }

    fn parse_response(&self, body: Value) -> Result<CompletionResponse, LlmError> {
        let stop_reason = body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(StopReason::from_api)
            .unwrap_or_default();

        let usage = TokenUsage {
            input_tokens: body
                .pointer("/usage/input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: body
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        let mut content = None;
        let mut tool_calls = Vec::new();

        let blocks = body
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LlmError::InvalidResponse("missing content array".to_string()))?;

        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    content.get_or_insert_with(String::new).push_str(text);
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                other => {
                    // Unknown block types are logged and dropped
                    debug!(?other, "Ignoring unknown content block type");
                }
            }
        }

        Ok(CompletionResponse {
            content,
            tool_calls,
            stop_reason,
            usage,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&request);

        debug!(model = %request.model, tools = request.tools.len(), "Sending completion request");

        let mut http = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            http = http.header("x-api-key", key);
        }

        let response = http.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout)
            } else {
                LlmError::Network(e)
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(?retry_after, "Rate limited by API");
            return Err(LlmError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await.map_err(LlmError::Network)?;
        self.parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn client() -> AnthropicClient {
        AnthropicClient::from_config(&LlmConfig::default()).unwrap()
    }

    #[test]
    fn test_build_body_basic() {
        let request = CompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            system_prompt: "You are a planner".to_string(),
            messages: vec![Message::user("plan this")],
            tools: vec![],
            max_tokens: 1024,
        };

        let body = client().build_body(&request);
        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["system"], "You are a planner");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_body_with_tools() {
        let request = CompletionRequest {
            model: "m".to_string(),
            system_prompt: String::new(),
            messages: vec![],
            tools: vec![super::super::ToolDefinition::new(
                "submit_plan",
                "Submit the plan",
                json!({"type": "object"}),
            )],
            max_tokens: 10,
        };

        let body = client().build_body(&request);
        assert_eq!(body["tools"][0]["name"], "submit_plan");
    }

    #[test]
    fn test_parse_response_text_and_tools() {
        let body = json!({
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 100, "output_tokens": 50 },
            "content": [
                { "type": "text", "text": "Here is the plan." },
                { "type": "tool_use", "id": "t1", "name": "submit_plan", "input": {"steps": []} },
                { "type": "thinking", "thinking": "ignored" }
            ]
        });

        let parsed = client().parse_response(body).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("Here is the plan."));
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "submit_plan");
        assert_eq!(parsed.stop_reason, StopReason::ToolUse);
        assert_eq!(parsed.usage.input_tokens, 100);
    }

    #[test]
    fn test_parse_response_missing_content_fails() {
        let body = json!({ "stop_reason": "end_turn" });
        assert!(matches!(
            client().parse_response(body),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
