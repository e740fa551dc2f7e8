//! Agent provider abstraction.
//!
//! Defines the [`LlmProvider`] trait the dispatch loop talks to, together
//! with the conversation types it exchanges:
//!
//! - **Chat with tools** via [`LlmProvider::chat`], which takes the whole
//!   conversation, the tool definitions and per-call [`CallOptions`]
//! - **Classified failures** through [`ProviderError`], so callers can tell a
//!   rate limit from a malformed request without inspecting strings
//! - **Usage** per response, summed across turns by the dispatch loop
//!
//! The Anthropic adapter lives in [`crate::anthropic`]. [`ScriptedProvider`]
//! replays canned responses for tests and dry runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use dl_harness::provider::{CallOptions, LlmProvider, Message, ProviderError};
//!
//! async fn example(provider: impl LlmProvider) -> Result<(), ProviderError> {
//!     let messages = vec![Message::user("Add a README section on configuration.")];
//!     let response = provider.chat(&messages, &[], &CallOptions::default()).await?;
//!     for call in &response.tool_calls {
//!         println!("tool {} args {}", call.name, call.arguments);
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::AddAssign;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when calling an agent provider.
///
/// Every adapter maps its transport and API failures onto these five
/// classes. None of them is retried by the engine; a failed dispatch fails
/// the task.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The provider accepted the request but failed to serve it (5xx,
    /// overloaded, malformed response body).
    #[error("provider error: {0}")]
    Provider(String),

    /// No response within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The provider throttled the request.
    #[error("rate limited")]
    RateLimited {
        /// Milliseconds the provider asked us to wait, when it said.
        retry_after_ms: Option<u64>,
    },

    /// Connection-level failure: DNS, refused, reset.
    #[error("network error: {0}")]
    Network(String),

    /// The request itself is wrong: bad credentials, unknown model,
    /// invalid parameters, missing configuration.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Stable short name of the error class, used in task metadata.
    pub fn class(&self) -> &'static str {
        match self {
            ProviderError::Provider(_) => "provider",
            ProviderError::Timeout => "timeout",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Network(_) => "network",
            ProviderError::InvalidRequest(_) => "invalid_request",
        }
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The role of a participant in an agent conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    /// The result of executing a tool call, sent back to the model.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        })
    }
}

/// A single message in a conversation.
///
/// Assistant messages carry the tool calls the model requested; tool
/// messages answer exactly one of those calls by `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on tool messages that report a failed execution.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Record an assistant turn, keeping any tool calls it requested.
    pub fn from_response(response: &Response) -> Self {
        Self {
            tool_calls: response.tool_calls.clone(),
            ..Self::assistant(response.content.clone().unwrap_or_default())
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn tool_error(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::tool_result(call_id, error)
        }
    }
}

// ---------------------------------------------------------------------------
// Tool types
// ---------------------------------------------------------------------------

/// A tool definition offered to the model.
///
/// `parameters` is a JSON Schema object describing the arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back in the tool result.
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments matching the tool's `parameters` schema.
    pub arguments: String,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    /// Output hit the token ceiling; the turn is truncated.
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// Response from one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Option<Usage>,
    pub stop_reason: StopReason,
}

impl Response {
    /// A plain final answer.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            model: String::new(),
            usage: None,
            stop_reason: StopReason::EndTurn,
        }
    }

    /// A turn that requests tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
            model: String::new(),
            usage: None,
            stop_reason: StopReason::ToolUse,
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(Usage {
            input_tokens,
            output_tokens,
            invocations: 1,
        });
        self
    }

    pub fn with_stop_reason(mut self, stop: StopReason) -> Self {
        self.stop_reason = stop;
        self
    }
}

/// Token usage. Summed across every turn of a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Number of provider calls this usage covers.
    #[serde(default)]
    pub invocations: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.invocations += rhs.invocations;
    }
}

/// Per-call overrides. Unset fields fall back to the adapter's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// A chat-completion backend with tool use.
///
/// Implementations map their failures onto [`ProviderError`]. They must not
/// retry internally: a failed call is reported, and the task fails.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &CallOptions,
    ) -> Result<Response, ProviderError>;

    /// Human-readable provider name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// ScriptedProvider – replays canned responses.
// ---------------------------------------------------------------------------

/// Replays a fixed script of responses in order, recording every request.
///
/// Once the script is exhausted it answers with a plain `end_turn`
/// response, so one provider can serve an unbounded number of tasks.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Response, ProviderError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Response, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append more responses to the end of the script.
    pub fn push(&self, response: Result<Response, ProviderError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    /// Conversations seen so far, one per call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[Message],
        _tools: &[Tool],
        _options: &CallOptions,
    ) -> Result<Response, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(Response::text("done").with_usage(0, 0)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
