//! MergeQueueItem - a completed branch awaiting integration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use understore::{IndexValue, Record, now_ms};

use crate::config::MergeStrategy;
use crate::domain::generate_id;

/// Merge item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeItemStatus {
    #[default]
    Pending,
    Rebasing,
    Testing,
    Merging,
    Complete,
    Failed,
    TestFailed,
}

impl MergeItemStatus {
    /// One of the exclusive processing states
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::Rebasing | Self::Testing | Self::Merging)
    }

    /// Eligible for a retry pass
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::TestFailed)
    }
}

impl std::fmt::Display for MergeItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Rebasing => "rebasing",
            Self::Testing => "testing",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::TestFailed => "test_failed",
        };
        write!(f, "{}", s)
    }
}

/// A completed branch queued for serial integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueItem {
    pub id: String,
    pub branch: String,
    pub task_id: String,
    pub agent_id: String,
    pub queued_at: i64,
    pub status: MergeItemStatus,
    pub retry_count: u32,
    /// Earliest time the next retry may run
    pub next_retry_after: Option<i64>,
    /// First error seen
    pub original_error: Option<String>,
    /// Most recent error
    pub current_error: Option<String>,
    pub strategy_used: MergeStrategy,
    pub conflict_files: Vec<String>,
    /// Used for conflict prediction across queued items
    pub modified_files: Vec<String>,
    pub updated_at: i64,
}

impl MergeQueueItem {
    pub fn new(
        branch: impl Into<String>,
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        modified_files: Vec<String>,
    ) -> Self {
        let branch = branch.into();
        let now = now_ms();
        Self {
            id: generate_id("merge", &branch),
            branch,
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            queued_at: now,
            status: MergeItemStatus::Pending,
            retry_count: 0,
            next_retry_after: None,
            original_error: None,
            current_error: None,
            strategy_used: MergeStrategy::Default,
            conflict_files: Vec::new(),
            modified_files,
            updated_at: now,
        }
    }

    /// Transition status; complete is terminal
    pub fn try_set_status(&mut self, status: MergeItemStatus) -> bool {
        if self.status == MergeItemStatus::Complete && status != MergeItemStatus::Complete {
            return false;
        }
        self.status = status;
        self.updated_at = now_ms();
        true
    }

    /// Record a failure message, preserving the first one
    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        if self.original_error.is_none() {
            self.original_error = Some(error.clone());
        }
        self.current_error = Some(error);
        self.updated_at = now_ms();
    }
}

impl Record for MergeQueueItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "merge_items"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("branch".to_string(), IndexValue::String(self.branch.clone()));
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields
    }
}
