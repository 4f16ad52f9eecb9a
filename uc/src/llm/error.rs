//! LLM error types

use std::time::Duration;
use thiserror::Error;

use crate::domain::ErrorCategory;

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => *status == 429,
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => *status >= 500 || *status == 429,
            LlmError::Network(_) => true,
            LlmError::Timeout(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::Json(_) => false,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map into the system-wide failure taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            LlmError::RateLimited { .. } => ErrorCategory::RateLimit,
            LlmError::ApiError { status: 429, .. } => ErrorCategory::RateLimit,
            LlmError::ApiError { status, .. } if *status >= 500 => ErrorCategory::NetworkTransient,
            LlmError::ApiError { .. } => ErrorCategory::ToolError,
            LlmError::Network(_) => ErrorCategory::NetworkTransient,
            LlmError::Timeout(_) => ErrorCategory::Timeout,
            LlmError::InvalidResponse(_) => ErrorCategory::ValidationError,
            LlmError::Json(_) => ErrorCategory::ValidationError,
        }
    }
}
