//! External coding agent boundary
//!
//! The agent that actually edits files is a black box. A worker hands it a
//! brief, receives a stream of heterogeneous events over a channel, and
//! gets a final outcome. Unknown event variants are ignored so agent
//! upgrades never break the worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::ErrorCategory;

use super::types::TokenUsage;

/// Everything the agent needs for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBrief {
    /// Owning task
    #[serde(rename = "task-id")]
    pub task_id: String,

    /// Rendered briefing prompt
    pub prompt: String,

    /// Directory the agent works in (worktree or repo root)
    #[serde(rename = "working-dir")]
    pub working_dir: PathBuf,

    /// Concrete model ID to use
    pub model: String,

    /// Soft timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

/// Events streamed by the agent while it works
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Final success
    ResultSuccess {
        #[serde(default)]
        files_modified: Vec<String>,
        #[serde(default)]
        summary: String,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },

    /// Final failure
    ResultError {
        message: String,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },

    /// Intermediate text output
    Partial { text: String },

    /// A tool invocation the agent made
    ToolCall {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// Anything this version does not understand
    #[serde(other)]
    Unknown,
}

/// Final result of an agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub success: bool,
    pub files_modified: Vec<String>,
    pub message: String,
    pub usage: TokenUsage,
}

/// Errors from driving the agent process
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent crashed with exit code {code:?}")]
    Crashed { code: Option<i32> },

    #[error("Agent protocol error: {0}")]
    Protocol(String),
}

impl AgentError {
    /// Map into the system-wide failure taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Crashed { .. } => ErrorCategory::Crash,
            Self::Spawn(_) | Self::Protocol(_) => ErrorCategory::ToolError,
        }
    }
}

/// The black-box coding agent
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run the agent once; events stream to `events`, the final outcome is
    /// returned
    async fn run(&self, brief: AgentBrief, events: mpsc::Sender<AgentEvent>) -> Result<AgentOutcome, AgentError>;
}

/// Agent driven as a child process
///
/// The brief goes to the process as JSON on stdin; the process emits
/// JSON-lines events on stdout. Lines that fail to parse are logged and
/// skipped.
pub struct CommandAgent {
    command: String,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl AgentRuntime for CommandAgent {
    async fn run(&self, brief: AgentBrief, events: mpsc::Sender<AgentEvent>) -> Result<AgentOutcome, AgentError> {
        let timeout = Duration::from_millis(brief.timeout_ms);

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&brief.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let brief_json = serde_json::to_string(&brief).map_err(|e| AgentError::Protocol(e.to_string()))?;
            stdin.write_all(brief_json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // Close stdin so the agent knows the brief is complete
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Protocol("agent stdout unavailable".to_string()))?;

        let drive = async {
            let mut reader = BufReader::new(stdout).lines();
            let mut outcome: Option<AgentOutcome> = None;

            while let Some(line) = reader.next_line().await? {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let event: AgentEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Skipping unparseable agent event line");
                        continue;
                    }
                };

                match &event {
                    AgentEvent::ResultSuccess {
                        files_modified,
                        summary,
                        input_tokens,
                        output_tokens,
                    } => {
                        outcome = Some(AgentOutcome {
                            success: true,
                            files_modified: files_modified.clone(),
                            message: summary.clone(),
                            usage: TokenUsage::new(*input_tokens, *output_tokens),
                        });
                    }
                    AgentEvent::ResultError {
                        message,
                        input_tokens,
                        output_tokens,
                    } => {
                        outcome = Some(AgentOutcome {
                            success: false,
                            files_modified: Vec::new(),
                            message: message.clone(),
                            usage: TokenUsage::new(*input_tokens, *output_tokens),
                        });
                    }
                    AgentEvent::Unknown => {
                        debug!("Ignoring unknown agent event variant");
                    }
                    _ => {}
                }

                // Consumers see every event, even the ignored ones
                let _ = events.send(event).await;
            }

            let status = child.wait().await?;
            match outcome {
                Some(outcome) => Ok(outcome),
                None if !status.success() => Err(AgentError::Crashed { code: status.code() }),
                None => Err(AgentError::Protocol("agent produced no result event".to_string())),
            }
        };

        match tokio::time::timeout(timeout, drive).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted agent for worker tests
    pub struct MockAgent {
        outcomes: Mutex<Vec<Result<AgentOutcome, AgentError>>>,
    }

    impl MockAgent {
        pub fn new(outcomes: Vec<Result<AgentOutcome, AgentError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }

        pub fn succeeding(files: Vec<&str>) -> Self {
            Self::new(vec![Ok(AgentOutcome {
                success: true,
                files_modified: files.into_iter().map(String::from).collect(),
                message: "done".to_string(),
                usage: TokenUsage::new(1000, 100),
            })])
        }
    }

    #[async_trait]
    impl AgentRuntime for MockAgent {
        async fn run(&self, _brief: AgentBrief, events: mpsc::Sender<AgentEvent>) -> Result<AgentOutcome, AgentError> {
            let next = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.is_empty() {
                    // Repeat the shape of an exhausted agent
                    Err(AgentError::Protocol("no scripted outcome".to_string()))
                } else {
                    outcomes.remove(0)
                }
            };

            if let Ok(outcome) = &next {
                let event = if outcome.success {
                    AgentEvent::ResultSuccess {
                        files_modified: outcome.files_modified.clone(),
                        summary: outcome.message.clone(),
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                    }
                } else {
                    AgentEvent::ResultError {
                        message: outcome.message.clone(),
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                    }
                };
                let _ = events.send(event).await;
            }

            next
        }
    }
}
