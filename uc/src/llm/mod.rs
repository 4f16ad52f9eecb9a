//! LLM client and agent boundary
//!
//! Two external collaborators live behind traits here: the planner/review
//! LLM ([`LlmClient`], with an Anthropic implementation) and the coding
//! agent that actually edits files ([`AgentRuntime`], a black box driven
//! over a channel of events).

pub mod agent;
mod anthropic;
pub mod client;
mod error;
mod types;

pub use agent::{AgentBrief, AgentError, AgentEvent, AgentOutcome, AgentRuntime, CommandAgent};
pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use error::LlmError;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, TokenUsage, ToolCall, ToolDefinition};
