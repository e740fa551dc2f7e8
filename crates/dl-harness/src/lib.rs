//! Harness: the agent execution layer of devloop.
//!
//! Sits between the per-task lifecycle and the external model provider:
//! - Provider abstraction for chat calls with tool use ([`provider`]) and
//!   the Anthropic Messages API adapter ([`anthropic`])
//! - Tool contract and registry ([`tools`]) plus the workspace-confined
//!   built-in tools the agent edits code with ([`builtin_tools`])
//! - The multi-turn dispatch loop that drives one conversation to a
//!   terminal state and accounts for its usage ([`dispatch`])

pub mod anthropic;
pub mod builtin_tools;
pub mod dispatch;
pub mod provider;
pub mod tools;
