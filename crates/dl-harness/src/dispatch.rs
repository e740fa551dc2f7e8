use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::provider::{
    CallOptions, LlmProvider, Message, ProviderError, StopReason, ToolCall, Usage,
};
use crate::tools::{ToolContext, ToolRegistry};

pub const DEFAULT_MAX_TURNS: u32 = 50;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The cancel signal fired or its deadline passed.
    #[error("dispatch timed out or was cancelled")]
    TimedOut,
    #[error("turn limit of {max_turns} reached")]
    TurnLimit { max_turns: u32 },
}

/// A dispatch that ended without a final answer. Usage still covers every
/// call that was made.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub error: DispatchError,
    pub usage: Usage,
    pub conversation: Vec<Message>,
    pub turns: u32,
}

// ---------------------------------------------------------------------------
// Turn state machine
// ---------------------------------------------------------------------------

/// Where one dispatch stands between provider calls.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    /// Next step is a provider call.
    Sending,
    /// The model asked for these tool calls.
    AwaitingTools(Vec<ToolCall>),
    Completed { truncated: bool },
    Errored(DispatchError),
    TimedOut,
}

/// A conversation that reached a final answer.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub conversation: Vec<Message>,
    pub usage: Usage,
    pub turns: u32,
    pub tool_calls: u64,
    /// The last turn stopped on the output token ceiling.
    pub truncated: bool,
}

impl DispatchReport {
    /// Text of the final assistant message.
    pub fn final_text(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == crate::provider::Role::Assistant)
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
    }
}

// ---------------------------------------------------------------------------
// DispatchLoop
// ---------------------------------------------------------------------------

/// Drives one agent conversation: send, run requested tools, send again,
/// until the model ends its turn or something terminal happens.
#[derive(Clone)]
pub struct DispatchLoop {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    options: CallOptions,
    max_turns: u32,
}

impl DispatchLoop {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: ToolRegistry) -> Self {
        Self {
            provider,
            tools,
            options: CallOptions::default(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn run(
        &self,
        mut conversation: Vec<Message>,
        ctx: &ToolContext,
    ) -> Result<DispatchReport, DispatchFailure> {
        let definitions = self.tools.definitions();
        let mut usage = Usage::default();
        let mut turns: u32 = 0;
        let mut tool_calls: u64 = 0;
        let mut state = TurnState::Sending;

        loop {
            state = match state {
                TurnState::Sending => {
                    if ctx.cancel.is_cancelled() {
                        TurnState::TimedOut
                    } else if turns >= self.max_turns {
                        TurnState::Errored(DispatchError::TurnLimit {
                            max_turns: self.max_turns,
                        })
                    } else {
                        turns += 1;
                        let reply = tokio::select! {
                            r = self.provider.chat(&conversation, &definitions, &self.options) => Some(r),
                            _ = ctx.cancel.cancelled() => None,
                        };
                        // The call was made whatever it returned.
                        usage.invocations += 1;
                        match reply {
                            None => TurnState::TimedOut,
                            Some(Err(e)) => {
                                warn!(turn = turns, error = %e, "provider call failed");
                                TurnState::Errored(DispatchError::Provider(e))
                            }
                            Some(Ok(response)) => {
                                if let Some(u) = response.usage {
                                    usage.input_tokens += u.input_tokens;
                                    usage.output_tokens += u.output_tokens;
                                }
                                debug!(
                                    turn = turns,
                                    tool_calls = response.tool_calls.len(),
                                    stop = ?response.stop_reason,
                                    "provider turn"
                                );
                                conversation.push(Message::from_response(&response));
                                if !response.tool_calls.is_empty() {
                                    TurnState::AwaitingTools(response.tool_calls)
                                } else {
                                    TurnState::Completed {
                                        truncated: response.stop_reason == StopReason::MaxTokens,
                                    }
                                }
                            }
                        }
                    }
                }
                TurnState::AwaitingTools(calls) => {
                    let mut next = TurnState::Sending;
                    for call in &calls {
                        if ctx.cancel.is_cancelled() {
                            next = TurnState::TimedOut;
                            break;
                        }
                        tool_calls += 1;
                        match self.tools.execute(call, ctx).await {
                            Ok(output) => conversation.push(Message::tool_result(&call.id, output)),
                            Err(e) => {
                                debug!(tool = %call.name, error = %e, "tool call failed");
                                conversation.push(Message::tool_error(&call.id, e.to_string()));
                            }
                        }
                    }
                    next
                }
                TurnState::Completed { truncated } => {
                    if truncated {
                        warn!(turns, "final turn truncated at max tokens");
                    }
                    info!(
                        turns,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "dispatch completed"
                    );
                    return Ok(DispatchReport {
                        conversation,
                        usage,
                        turns,
                        tool_calls,
                        truncated,
                    });
                }
                TurnState::Errored(error) => {
                    return Err(DispatchFailure {
                        error,
                        usage,
                        conversation,
                        turns,
                    });
                }
                TurnState::TimedOut => {
                    warn!(turns, "dispatch cancelled");
                    return Err(DispatchFailure {
                        error: DispatchError::TimedOut,
                        usage,
                        conversation,
                        turns,
                    });
                }
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
