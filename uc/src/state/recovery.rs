//! Batch recovery
//!
//! Each orchestrator session persists its batch state; an interrupted
//! batch (process died mid-run) is detected on startup and its pending
//! tasks resume before new work starts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use understore::{IndexValue, Record, now_ms};

use crate::domain::{TaskStatus, generate_id};

use super::manager::StateManager;
use super::messages::StateResult;

/// Batch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Running,
    Complete,
}

/// One orchestrator session's recovery state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub status: BatchStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub pending_task_ids: Vec<String>,
    pub completed_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub updated_at: i64,
}

impl Batch {
    pub fn new(pending_task_ids: Vec<String>) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("batch", "session"),
            status: BatchStatus::Running,
            started_at: now,
            ended_at: None,
            pending_task_ids,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            updated_at: now,
        }
    }

    /// Move a task from pending into the completed or failed set
    pub fn record_outcome(&mut self, task_id: &str, success: bool) {
        self.pending_task_ids.retain(|id| id != task_id);
        if success {
            self.completed_task_ids.push(task_id.to_string());
        } else {
            self.failed_task_ids.push(task_id.to_string());
        }
        self.updated_at = now_ms();
    }

    pub fn finish(&mut self) {
        self.status = BatchStatus::Complete;
        self.ended_at = Some(now_ms());
        self.updated_at = now_ms();
    }
}

impl Record for Batch {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "batches"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let status = match self.status {
            BatchStatus::Running => "running",
            BatchStatus::Complete => "complete",
        };
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(status.to_string()));
        fields
    }
}

/// Recovery statistics
#[derive(Debug, Default, PartialEq)]
pub struct RecoveryStats {
    /// Tasks reset from in_progress back to pending
    pub tasks_reset: usize,
    /// Pending task IDs carried over from an interrupted batch
    pub batch_tasks_resumed: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tasks reset: {}, batch tasks resumed: {}",
            self.tasks_reset, self.batch_tasks_resumed
        )
    }
}

/// Find a batch left running by a previous session
pub async fn find_interrupted_batch(state: &StateManager) -> StateResult<Option<Batch>> {
    let batches = state.list_batches().await?;
    Ok(batches
        .into_iter()
        .filter(|b| b.status == BatchStatus::Running)
        .next_back())
}

/// Full recovery: reset crashed in-progress tasks, surface the
/// interrupted batch's pending work
pub async fn recover(state: &StateManager) -> StateResult<(RecoveryStats, Option<Batch>)> {
    let mut stats = RecoveryStats::default();

    // In-progress tasks with no live worker are crash leftovers; put them
    // back on the board (the checkpoint lets the worker resume mid-task)
    let in_progress = state.list_tasks(Some("in_progress"), None).await?;
    for mut task in in_progress {
        warn!(task_id = %task.id, "Resetting crashed in-progress task to pending");
        if task.try_set_status(TaskStatus::Pending) {
            state.update_task(task).await?;
            stats.tasks_reset += 1;
        }
    }

    let interrupted = find_interrupted_batch(state).await?;
    if let Some(batch) = &interrupted {
        stats.batch_tasks_resumed = batch.pending_task_ids.len();
        info!(batch_id = %batch.id, resumed = stats.batch_tasks_resumed, "Resuming interrupted batch");
    }

    if stats.tasks_reset > 0 || stats.batch_tasks_resumed > 0 {
        info!("Recovery complete: {}", stats);
    }

    Ok((stats, interrupted))
}
