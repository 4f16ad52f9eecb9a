//! Task - the unit of work on the board
//!
//! A task carries a free-form objective (optionally prefixed with a tag
//! like `[plan]` or `[meta:triage]`), its relations to other tasks, and
//! the history needed to hand context between attempts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use understore::{IndexValue, Record, now_ms};

use super::category::ErrorCategory;
use super::id::generate_id;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up
    #[default]
    Pending,
    /// A worker owns it
    InProgress,
    /// Waiting on something; requires a reason
    Blocked,
    /// Done; terminal, never transitions back
    Complete,
    /// Exhausted retries; terminal
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Objective prefix tags that change how a task is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTag {
    /// Produce a plan only, no execution
    Plan,
    /// Research task, read-only
    Research,
    /// Meta-task that recommends board mutations
    MetaTriage,
}

impl TaskTag {
    /// Parse a tag from an objective prefix
    pub fn parse(objective: &str) -> Option<TaskTag> {
        let trimmed = objective.trim_start();
        if trimmed.starts_with("[plan]") {
            Some(Self::Plan)
        } else if trimmed.starts_with("[research]") {
            Some(Self::Research)
        } else if trimmed.starts_with("[meta:triage]") {
            Some(Self::MetaTriage)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Research => "research",
            Self::MetaTriage => "meta_triage",
        }
    }
}

/// Context handed from one attempt to the next
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffContext {
    /// Files the previous attempt read
    pub files_read: Vec<String>,
    /// Decisions noted along the way
    pub decisions: Vec<String>,
    /// Error from the prior attempt, if any
    pub last_error: Option<String>,
    /// How many attempts have run
    pub attempt_count: u32,
}

/// Summary of the most recent attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastAttempt {
    /// Model name used
    pub model: String,
    /// Error category, if it failed
    pub error_category: Option<ErrorCategory>,
    /// Error message, if it failed
    pub error_message: Option<String>,
    /// Files the attempt modified
    pub modified_files: Vec<String>,
    /// Attempt number
    pub attempt_count: u32,
}

/// A task on the board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: String,

    /// Free-form objective, may carry a prefix tag
    pub objective: String,

    /// Current status
    pub status: TaskStatus,

    /// Higher runs first
    pub priority: i32,

    /// Required when status is Blocked
    pub blocked_reason: Option<String>,

    /// Parent task (for decomposition)
    pub parent: Option<String>,

    /// Subtask IDs; non-empty means this task is decomposed
    pub subtasks: Vec<String>,

    /// Tasks that must complete before this one starts
    pub depends_on: Vec<String>,

    /// Tasks that must not run concurrently with this one
    pub conflicts: Vec<String>,

    /// Loosely related tasks
    pub related_to: Vec<String>,

    /// Files the planner expects this task to touch
    pub estimated_files: Vec<String>,

    /// Package hints computed from the objective
    pub package_hints: Vec<String>,

    /// Risk score from assessment
    pub risk_score: f64,

    /// Issues raised during triage
    pub triage_issues: Vec<String>,

    /// Context handed between attempts
    pub handoff: Option<HandoffContext>,

    /// Most recent attempt summary
    pub last_attempt: Option<LastAttempt>,

    /// Consecutive agent runs that changed nothing
    pub no_op_edits: u32,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// First pickup timestamp
    pub started_at: Option<i64>,

    /// Completion timestamp
    pub completed_at: Option<i64>,

    /// Last update timestamp
    pub updated_at: i64,
}

impl Task {
    /// Create a new pending task with a generated ID
    pub fn new(objective: impl Into<String>) -> Self {
        let objective = objective.into();
        let now = now_ms();
        Self {
            id: generate_id("task", &objective),
            objective,
            status: TaskStatus::Pending,
            priority: 0,
            blocked_reason: None,
            parent: None,
            subtasks: Vec::new(),
            depends_on: Vec::new(),
            conflicts: Vec::new(),
            related_to: Vec::new(),
            estimated_files: Vec::new(),
            package_hints: Vec::new(),
            risk_score: 0.0,
            triage_issues: Vec::new(),
            handoff: None,
            last_attempt: None,
            no_op_edits: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Create with a specific ID (for testing or recovery)
    pub fn with_id(id: impl Into<String>, objective: impl Into<String>) -> Self {
        let mut task = Self::new(objective);
        task.id = id.into();
        task
    }

    /// Builder: set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set parent
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// The objective's prefix tag, if any
    pub fn tag(&self) -> Option<TaskTag> {
        TaskTag::parse(&self.objective)
    }

    /// Whether this task has been decomposed into subtasks
    pub fn is_decomposed(&self) -> bool {
        !self.subtasks.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Ready = pending, all dependencies complete
    pub fn is_ready(&self, completed: &[&str]) -> bool {
        self.status == TaskStatus::Pending && self.depends_on.iter().all(|dep| completed.contains(&dep.as_str()))
    }

    /// Transition status, honouring the terminal-complete invariant
    ///
    /// Returns false (and leaves the task untouched) when the transition is
    /// not allowed: a complete task never changes status, and blocking
    /// without a reason is rejected via [`Task::block`].
    pub fn try_set_status(&mut self, status: TaskStatus) -> bool {
        if self.status == TaskStatus::Complete && status != TaskStatus::Complete {
            return false;
        }
        if status == TaskStatus::Blocked && self.blocked_reason.is_none() {
            return false;
        }
        self.status = status;
        if status != TaskStatus::Blocked {
            self.blocked_reason = None;
        }
        self.updated_at = now_ms();
        true
    }

    /// Mark picked up by a worker
    pub fn mark_started(&mut self) -> bool {
        if !self.try_set_status(TaskStatus::InProgress) {
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(now_ms());
        }
        true
    }

    /// Mark complete (terminal)
    pub fn mark_complete(&mut self) -> bool {
        if !self.try_set_status(TaskStatus::Complete) {
            return false;
        }
        self.completed_at = Some(now_ms());
        true
    }

    /// Mark failed (terminal)
    pub fn mark_failed(&mut self) -> bool {
        self.try_set_status(TaskStatus::Failed)
    }

    /// Block with a reason (required)
    pub fn block(&mut self, reason: impl Into<String>) -> bool {
        if self.status == TaskStatus::Complete {
            return false;
        }
        self.blocked_reason = Some(reason.into());
        self.try_set_status(TaskStatus::Blocked)
    }

    /// Unblock back to pending
    pub fn unblock(&mut self) -> bool {
        if self.status != TaskStatus::Blocked {
            return false;
        }
        self.try_set_status(TaskStatus::Pending)
    }

    /// Record the latest attempt summary and refresh the handoff context
    pub fn record_attempt(&mut self, attempt: LastAttempt) {
        let handoff = self.handoff.get_or_insert_with(HandoffContext::default);
        handoff.attempt_count = attempt.attempt_count;
        handoff.last_error = attempt.error_message.clone();
        self.last_attempt = Some(attempt);
        self.updated_at = now_ms();
    }

    /// Bump the no-op edit counter, returning the new count
    pub fn record_no_op_edit(&mut self) -> u32 {
        self.no_op_edits += 1;
        self.updated_at = now_ms();
        self.no_op_edits
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
        self.updated_at = now_ms();
    }

    pub fn set_estimated_files(&mut self, files: Vec<String>) {
        self.estimated_files = files;
        self.updated_at = now_ms();
    }

    pub fn add_subtask(&mut self, id: impl Into<String>) {
        self.subtasks.push(id.into());
        self.updated_at = now_ms();
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("priority".to_string(), IndexValue::Int(self.priority as i64));
        if let Some(parent) = &self.parent {
            fields.insert("parent".to_string(), IndexValue::String(parent.clone()));
        }
        if let Some(tag) = self.tag() {
            fields.insert("tag".to_string(), IndexValue::String(tag.as_str().to_string()));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new("Fix the login bug");
        assert!(task.id.contains("-task-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 0);
        assert!(!task.is_decomposed());
        assert!(task.tag().is_none());
    }

    #[test]
    fn test_task_tags() {
        assert_eq!(Task::new("[plan] design the API").tag(), Some(TaskTag::Plan));
        assert_eq!(Task::new("[research] how does X work").tag(), Some(TaskTag::Research));
        assert_eq!(Task::new("[meta:triage] clean the board").tag(), Some(TaskTag::MetaTriage));
        assert_eq!(Task::new("normal task").tag(), None);
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut task = Task::new("do something");
        assert!(task.mark_started());
        assert!(task.mark_complete());

        // No transition out of complete
        assert!(!task.try_set_status(TaskStatus::Pending));
        assert!(!task.mark_failed());
        assert!(!task.block("nope"));
        assert_eq!(task.status, TaskStatus::Complete);
    }

    #[test]
    fn test_block_requires_reason() {
        let mut task = Task::new("do something");

        // Direct transition without a reason is rejected
        assert!(!task.try_set_status(TaskStatus::Blocked));

        assert!(task.block("waiting on review"));
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.blocked_reason.as_deref(), Some("waiting on review"));

        assert!(task.unblock());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.blocked_reason.is_none());
    }

    #[test]
    fn test_unblock_requires_blocked() {
        let mut task = Task::new("do something");
        assert!(!task.unblock());
    }

    #[test]
    fn test_timestamps_monotonic() {
        let mut task = Task::new("do something");
        task.mark_started();
        task.mark_complete();

        let started = task.started_at.unwrap();
        let completed = task.completed_at.unwrap();
        assert!(task.created_at <= started);
        assert!(started <= completed);
    }

    #[test]
    fn test_is_ready() {
        let mut task = Task::new("do something");
        task.depends_on = vec!["dep-1".to_string(), "dep-2".to_string()];

        assert!(!task.is_ready(&["dep-1"]));
        assert!(task.is_ready(&["dep-1", "dep-2"]));

        task.mark_started();
        assert!(!task.is_ready(&["dep-1", "dep-2"]));
    }

    #[test]
    fn test_record_attempt_updates_handoff() {
        let mut task = Task::new("do something");
        task.record_attempt(LastAttempt {
            model: "sonnet".to_string(),
            error_category: Some(ErrorCategory::Test),
            error_message: Some("2 tests failed".to_string()),
            modified_files: vec!["src/lib.rs".to_string()],
            attempt_count: 1,
        });

        let handoff = task.handoff.as_ref().unwrap();
        assert_eq!(handoff.attempt_count, 1);
        assert_eq!(handoff.last_error.as_deref(), Some("2 tests failed"));
        assert_eq!(task.last_attempt.as_ref().unwrap().model, "sonnet");
    }

    #[test]
    fn test_no_op_counter() {
        let mut task = Task::new("do something");
        assert_eq!(task.record_no_op_edit(), 1);
        assert_eq!(task.record_no_op_edit(), 2);
        assert_eq!(task.no_op_edits, 2);
    }

    #[test]
    fn test_decomposed() {
        let mut task = Task::new("big thing");
        assert!(!task.is_decomposed());
        task.add_subtask("child-1");
        assert!(task.is_decomposed());
    }

    #[test]
    fn test_indexed_fields() {
        let task = Task::new("[plan] design it").with_parent("parent-1").with_priority(5);
        let fields = task.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::String("pending".to_string())));
        assert_eq!(fields.get("priority"), Some(&IndexValue::Int(5)));
        assert_eq!(fields.get("parent"), Some(&IndexValue::String("parent-1".to_string())));
        assert_eq!(fields.get("tag"), Some(&IndexValue::String("plan".to_string())));
    }

    #[test]
    fn test_task_serde_roundtrip() {
        let mut task = Task::new("roundtrip me").with_priority(3);
        task.block("blocked on input");

        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.status, TaskStatus::Blocked);
        assert_eq!(parsed.blocked_reason, task.blocked_reason);
    }
}
