//! Failure taxonomy
//!
//! Every failure in the system maps to one of these kinds. The verifier
//! produces the verification subset; the worker and merge queue add the
//! rest.

use serde::{Deserialize, Serialize};

/// Canonical failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Typecheck,
    Test,
    Lint,
    Build,
    NoChanges,
    Planning,
    MaxAttempts,
    RateLimit,
    Timeout,
    ToolError,
    ValidationError,
    Crash,
    NetworkTransient,
    #[default]
    Unknown,
}

impl ErrorCategory {
    /// Transient errors are retried with backoff rather than escalated
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::NetworkTransient)
    }

    /// Verification failures feed back into the next attempt as enriched
    /// feedback instead of surfacing to the user
    pub fn is_verification(&self) -> bool {
        matches!(self, Self::Typecheck | Self::Test | Self::Lint | Self::Build)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typecheck => "typecheck",
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Build => "build",
            Self::NoChanges => "no_changes",
            Self::Planning => "planning",
            Self::MaxAttempts => "max_attempts",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ToolError => "tool_error",
            Self::ValidationError => "validation_error",
            Self::Crash => "crash",
            Self::NetworkTransient => "network_transient",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
