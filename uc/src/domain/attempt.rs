//! AttemptRecord - one execute/verify pass within a task
//!
//! Attempts are append-only; the attempt number equals its position in the
//! task's attempt list plus one, which the state actor enforces on append.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use understore::{IndexValue, Record, now_ms};

use super::category::ErrorCategory;
use super::id::generate_id;
use super::tier::ModelTier;

/// One execution attempt within a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Unique identifier
    pub id: String,

    /// Owning task
    pub task_id: String,

    /// 1-indexed attempt number within the task
    pub number: u32,

    /// Model tier used
    pub tier: ModelTier,

    /// Start timestamp (Unix milliseconds)
    pub started_at: i64,

    /// End timestamp, once finished
    pub ended_at: Option<i64>,

    /// Whether the attempt succeeded
    pub success: bool,

    /// Failure category, if it failed
    pub error_category: Option<ErrorCategory>,

    /// Failure message, if it failed
    pub error_message: Option<String>,

    /// Files the attempt modified
    pub files_modified: Vec<String>,

    /// Input tokens consumed
    pub input_tokens: u64,

    /// Output tokens consumed
    pub output_tokens: u64,

    /// Estimated cost in USD
    pub cost_usd: f64,

    /// Last update timestamp
    pub updated_at: i64,
}

impl AttemptRecord {
    /// Start a new attempt record
    pub fn start(task_id: impl Into<String>, number: u32, tier: ModelTier) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: generate_id("attempt", &format!("{}-{}", task_id, number)),
            task_id,
            number,
            tier,
            started_at: now,
            ended_at: None,
            success: false,
            error_category: None,
            error_message: None,
            files_modified: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            updated_at: now,
        }
    }

    /// Finish successfully
    pub fn succeed(&mut self, files_modified: Vec<String>) {
        self.success = true;
        self.files_modified = files_modified;
        self.ended_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// Finish with a failure
    pub fn fail(&mut self, category: ErrorCategory, message: impl Into<String>) {
        self.success = false;
        self.error_category = Some(category);
        self.error_message = Some(message.into());
        self.ended_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// Add token usage and its cost estimate
    pub fn add_usage(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.cost_usd += cost_usd;
        self.updated_at = now_ms();
    }

    /// Duration in milliseconds, if finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

impl Record for AttemptRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "attempts"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("tier".to_string(), IndexValue::String(self.tier.to_string()));
        fields.insert(
            "success".to_string(),
            IndexValue::String(if self.success { "true" } else { "false" }.to_string()),
        );
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_start() {
        let attempt = AttemptRecord::start("task-1", 1, ModelTier::Mid);
        assert_eq!(attempt.task_id, "task-1");
        assert_eq!(attempt.number, 1);
        assert!(!attempt.success);
        assert!(attempt.ended_at.is_none());
    }

    #[test]
    fn test_attempt_succeed() {
        let mut attempt = AttemptRecord::start("task-1", 1, ModelTier::Mid);
        attempt.succeed(vec!["src/lib.rs".to_string()]);
        assert!(attempt.success);
        assert!(attempt.ended_at.is_some());
        assert!(attempt.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_attempt_fail() {
        let mut attempt = AttemptRecord::start("task-1", 2, ModelTier::Top);
        attempt.fail(ErrorCategory::Test, "assertion failed");
        assert!(!attempt.success);
        assert_eq!(attempt.error_category, Some(ErrorCategory::Test));
        assert_eq!(attempt.error_message.as_deref(), Some("assertion failed"));
    }

    #[test]
    fn test_attempt_usage_accumulates() {
        let mut attempt = AttemptRecord::start("task-1", 1, ModelTier::Mid);
        attempt.add_usage(1000, 200, 0.006);
        attempt.add_usage(500, 100, 0.003);
        assert_eq!(attempt.input_tokens, 1500);
        assert_eq!(attempt.output_tokens, 300);
        assert!((attempt.cost_usd - 0.009).abs() < 1e-9);
    }

    #[test]
    fn test_indexed_fields() {
        let attempt = AttemptRecord::start("task-1", 1, ModelTier::Low);
        let fields = attempt.indexed_fields();
        assert_eq!(fields.get("task_id"), Some(&IndexValue::String("task-1".to_string())));
        assert_eq!(fields.get("tier"), Some(&IndexValue::String("haiku".to_string())));
        assert_eq!(fields.get("success"), Some(&IndexValue::String("false".to_string())));
    }
}
