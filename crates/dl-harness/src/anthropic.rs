use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use dl_core::config::AgentConfig;

use crate::provider::{
    CallOptions, LlmProvider, Message, ProviderError, Response, Role, StopReason, Tool, ToolCall,
    Usage,
};

const API_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Agent provider for the Anthropic Messages API, with tool use.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    timeout: Duration,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    ///
    /// `api_key` is the Anthropic API key (x-api-key header).
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            model: model.into(),
            max_tokens: 8192,
            temperature: None,
            timeout: Duration::from_secs(300),
        }
    }

    /// Build a provider from config, reading the key from the environment
    /// variable the config names.
    pub fn from_config(config: &AgentConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!(
                    "environment variable {} is not set",
                    config.api_key_env
                ))
            })?;
        let mut provider = Self::new(api_key, config.model.clone()).with_base_url(&config.base_url);
        provider.max_tokens = config.max_tokens;
        provider.temperature = config.temperature;
        provider.timeout = config.request_timeout();
        Ok(provider)
    }

    /// Override the base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the JSON request body for the Messages API.
    ///
    /// System messages are lifted into the top-level `system` field.
    /// Consecutive tool results are folded into one user message, since the
    /// API expects every result for an assistant turn in the next message.
    pub fn build_request_body(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &CallOptions,
    ) -> Value {
        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut api_messages: Vec<Value> = Vec::new();
        for msg in messages.iter().filter(|m| m.role != Role::System) {
            match msg.role {
                Role::User => api_messages.push(json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for call in &msg.tool_calls {
                        let input: Value =
                            serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    api_messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                        "is_error": msg.is_error,
                    });
                    let merged = api_messages.last_mut().and_then(|last| {
                        let is_results = last["role"] == "user"
                            && last["content"]
                                .as_array()
                                .and_then(|c| c.first())
                                .is_some_and(|b| b["type"] == "tool_result");
                        if is_results {
                            last["content"].as_array_mut()
                        } else {
                            None
                        }
                    });
                    match merged {
                        Some(content) => content.push(block),
                        None => api_messages.push(json!({"role": "user", "content": [block]})),
                    }
                }
                Role::System => {}
            }
        }

        let mut body = json!({
            "model": options.model.clone().unwrap_or_else(|| self.model.clone()),
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
            "messages": api_messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = options.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }
        body
    }

    /// Map a non-success HTTP status onto an error class.
    pub fn classify_status(status: u16, retry_after_secs: Option<u64>, body: String) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited {
                retry_after_ms: retry_after_secs.map(|s| s * 1000),
            },
            400 | 401 | 403 | 404 | 413 | 422 => {
                ProviderError::InvalidRequest(format!("HTTP {status}: {body}"))
            }
            408 | 504 => ProviderError::Timeout,
            _ => ProviderError::Provider(format!("HTTP {status}: {body}")),
        }
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_connect() || err.is_request() {
        ProviderError::Network(err.to_string())
    } else if err.is_decode() {
        ProviderError::Provider(format!("malformed response: {err}"))
    } else {
        ProviderError::Network(err.to_string())
    }
}

/// Deserialize helpers for the Messages API response.
#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicResponse {
    fn into_response(self) -> Response {
        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        for block in self.content {
            match block.kind.as_str() {
                "text" => text.extend(block.text),
                "tool_use" => tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                    arguments: block.input.unwrap_or_else(|| json!({})).to_string(),
                }),
                _ => {}
            }
        }
        Response {
            content: if text.is_empty() {
                None
            } else {
                Some(text.join(""))
            },
            tool_calls,
            model: self.model,
            usage: Some(Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
                invocations: 1,
            }),
            stop_reason: StopReason::parse(self.stop_reason.as_deref().unwrap_or("end_turn")),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &CallOptions,
    ) -> Result<Response, ProviderError> {
        let body = self.build_request_body(messages, tools, options);
        let url = format!("{}/v1/messages", self.base_url);
        debug!(url = %url, messages = messages.len(), tools = tools.len(), "anthropic request");

        let resp = self
            .client
            .post(&url)
            .timeout(options.timeout.unwrap_or(self.timeout))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, retry_after, text));
        }

        let api_resp: AnthropicResponse = resp.json().await.map_err(classify_transport)?;
        Ok(api_resp.into_response())
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("test-key", "claude-sonnet-4-20250514")
    }

    #[test]
    fn system_messages_are_lifted() {
        let messages = vec![Message::system("Be terse."), Message::user("Hi")];
        let body = provider().build_request_body(&messages, &[], &CallOptions::default());
        assert_eq!(body["system"], "Be terse.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tool_round_trip_is_encoded_as_blocks() {
        let call = ToolCall {
            id: "toolu_1".into(),
            name: "read_file".into(),
            arguments: r#"{"path":"a.rs"}"#.into(),
        };
        let call2 = ToolCall {
            id: "toolu_2".into(),
            name: "list_dir".into(),
            arguments: "{}".into(),
        };
        let messages = vec![
            Message::user("Look around"),
            Message::from_response(&Response::tool_calls(vec![call, call2])),
            Message::tool_result("toolu_1", "fn main() {}"),
            Message::tool_error("toolu_2", "permission denied"),
        ];
        let tools = vec![Tool {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = provider().build_request_body(&messages, &tools, &CallOptions::default());

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["content"][0]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][0]["input"]["path"], "a.rs");
        let results = msgs[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["is_error"], true);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn options_override_defaults() {
        let opts = CallOptions {
            model: Some("other-model".into()),
            max_tokens: Some(128),
            temperature: Some(0.2),
            timeout: None,
        };
        let body = provider().build_request_body(&[Message::user("x")], &[], &opts);
        assert_eq!(body["model"], "other-model");
        assert_eq!(body["max_tokens"], 128);
        assert!(body["temperature"].as_f64().is_some());
    }

    #[test]
    fn statuses_map_to_error_classes() {
        assert_eq!(
            AnthropicProvider::classify_status(429, Some(3), String::new()),
            ProviderError::RateLimited {
                retry_after_ms: Some(3000)
            }
        );
        assert!(matches!(
            AnthropicProvider::classify_status(401, None, "bad key".into()),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            AnthropicProvider::classify_status(529, None, "overloaded".into()),
            ProviderError::Provider(_)
        ));
        assert_eq!(
            AnthropicProvider::classify_status(504, None, String::new()),
            ProviderError::Timeout
        );
    }

    #[test]
    fn response_blocks_become_text_and_calls() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Reading the file."},
                {"type": "tool_use", "id": "toolu_9", "name": "read_file", "input": {"path": "x"}}
            ],
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 40, "output_tokens": 12}
        });
        let parsed: AnthropicResponse = serde_json::from_value(raw).unwrap();
        let response = parsed.into_response();
        assert_eq!(response.content.as_deref(), Some("Reading the file."));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_calls[0].name, "read_file");
        assert_eq!(response.usage.unwrap().invocations, 1);
    }

    #[test]
    fn missing_key_is_an_invalid_request() {
        let config = AgentConfig {
            api_key_env: "DEVLOOP_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            AnthropicProvider::from_config(&config),
            Err(ProviderError::InvalidRequest(_))
        ));
    }
}
