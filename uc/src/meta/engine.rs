//! MetaTaskEngine - validates and applies board mutations
//!
//! Meta-tasks propose mutations to the task board. Every recommendation
//! is validated against the current board before being applied; invalid
//! ones are logged and dropped, never partially applied.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{Task, TaskStatus};
use crate::state::{StateManager, StateResult};

/// Board mutations a meta-task may recommend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaAction {
    Add,
    Remove,
    Complete,
    Prioritize,
    Update,
    Merge,
    Block,
    Unblock,
    Decompose,
    FixStatus,
}

/// Payload for an `add` recommendation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTaskSpec {
    pub objective: String,
    pub priority: Option<i32>,
}

/// One recommended board mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaRecommendation {
    pub action: MetaAction,
    pub task_id: Option<String>,
    pub new_task: Option<NewTaskSpec>,
    pub priority: Option<i32>,
    /// Replacement objective for `update`
    pub update: Option<String>,
    pub reason: Option<String>,
    pub related_task_ids: Vec<String>,
    /// Target status for `fix_status`
    pub status: Option<TaskStatus>,
    /// Subtask objectives for `decompose`
    pub subtasks: Vec<String>,
}

impl Default for MetaRecommendation {
    fn default() -> Self {
        Self {
            action: MetaAction::Update,
            task_id: None,
            new_task: None,
            priority: None,
            update: None,
            reason: None,
            related_task_ids: Vec::new(),
            status: None,
            subtasks: Vec::new(),
        }
    }
}

impl MetaRecommendation {
    pub fn new(action: MetaAction) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }
}

/// What happened to a batch of recommendations
#[derive(Debug, Default)]
pub struct AppliedReport {
    pub applied: usize,
    pub rejected: Vec<(MetaRecommendation, String)>,
}

/// Validates and applies meta-task recommendations
pub struct MetaTaskEngine {
    state: StateManager,
}

impl MetaTaskEngine {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Validate and apply a batch of recommendations
    ///
    /// Each recommendation is re-validated against the live board right
    /// before it applies, so applying the same recommendation twice
    /// rejects the second.
    pub async fn process(&self, meta_task_id: &str, recommendations: Vec<MetaRecommendation>) -> StateResult<AppliedReport> {
        let mut report = AppliedReport::default();

        for rec in recommendations {
            let board = self.state.list_tasks(None, None).await?;
            match validate(&rec, &board, meta_task_id) {
                Ok(()) => {
                    self.apply(&rec, &board).await?;
                    report.applied += 1;
                }
                Err(reason) => {
                    warn!(action = ?rec.action, %reason, "Dropped invalid recommendation");
                    report.rejected.push((rec, reason));
                }
            }
        }

        info!(
            applied = report.applied,
            rejected = report.rejected.len(),
            "Meta-task recommendations processed"
        );
        Ok(report)
    }

    async fn apply(&self, rec: &MetaRecommendation, board: &[Task]) -> StateResult<()> {
        let find = |id: &str| board.iter().find(|t| t.id == id).cloned();

        match rec.action {
            MetaAction::Add => {
                let spec = rec.new_task.clone().unwrap_or_default();
                let mut task = Task::new(&spec.objective);
                if let Some(priority) = spec.priority {
                    task.set_priority(priority);
                }
                self.state.create_task(task).await?;
            }
            MetaAction::Remove => {
                if let Some(id) = &rec.task_id {
                    self.state.delete_task(id).await?;
                }
            }
            MetaAction::Complete => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    task.mark_complete();
                    self.state.update_task(task).await?;
                }
            }
            MetaAction::Prioritize => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    task.set_priority(rec.priority.unwrap_or(task.priority + 1));
                    self.state.update_task(task).await?;
                }
            }
            MetaAction::Update => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    if let Some(update) = &rec.update {
                        task.objective = update.clone();
                        self.state.update_task(task).await?;
                    }
                }
            }
            MetaAction::Merge => {
                // First related task absorbs the rest
                let mut ids = rec.related_task_ids.iter();
                let Some(primary_id) = ids.next() else {
                    return Ok(());
                };
                let Some(mut primary) = find(primary_id.as_str()) else {
                    return Ok(());
                };

                for id in ids {
                    if let Some(mut other) = find(id.as_str()) {
                        primary.related_to.push(other.id.clone());
                        other.triage_issues.push(format!("merged into {}", primary.id));
                        other.mark_complete();
                        self.state.update_task(other).await?;
                    }
                }
                self.state.update_task(primary).await?;
            }
            MetaAction::Block => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    let reason = rec.reason.clone().unwrap_or_else(|| "blocked by meta-task".to_string());
                    task.block(reason);
                    self.state.update_task(task).await?;
                }
            }
            MetaAction::Unblock => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    task.unblock();
                    self.state.update_task(task).await?;
                }
            }
            MetaAction::Decompose => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    for objective in &rec.subtasks {
                        let child = Task::new(objective).with_parent(&task.id).with_priority(task.priority);
                        let id = self.state.create_task(child).await?;
                        task.add_subtask(&id);
                    }
                    task.block("decomposed into subtasks");
                    self.state.update_task(task).await?;
                }
            }
            MetaAction::FixStatus => {
                if let Some(mut task) = rec.task_id.as_deref().and_then(find) {
                    if let Some(status) = rec.status {
                        let ok = match status {
                            TaskStatus::Blocked => {
                                task.block(rec.reason.clone().unwrap_or_else(|| "status fixed to blocked".to_string()))
                            }
                            TaskStatus::Complete => task.mark_complete(),
                            TaskStatus::Failed => task.mark_failed(),
                            other => task.try_set_status(other),
                        };
                        if ok {
                            self.state.update_task(task).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Validate a recommendation against the current board
pub fn validate(rec: &MetaRecommendation, board: &[Task], meta_task_id: &str) -> Result<(), String> {
    let find = |id: &str| board.iter().find(|t| t.id == id);

    // Self-protection: a meta-task cannot target itself
    if rec.task_id.as_deref() == Some(meta_task_id) || rec.related_task_ids.iter().any(|id| id == meta_task_id) {
        return Err("recommendation targets the meta-task itself".to_string());
    }

    let requires_task = matches!(
        rec.action,
        MetaAction::Remove
            | MetaAction::Complete
            | MetaAction::FixStatus
            | MetaAction::Prioritize
            | MetaAction::Update
            | MetaAction::Block
            | MetaAction::Unblock
            | MetaAction::Decompose
    );
    let target = if requires_task {
        let Some(id) = rec.task_id.as_deref() else {
            return Err("missing task id".to_string());
        };
        let Some(task) = find(id) else {
            return Err(format!("unknown task id: {}", id));
        };
        Some(task)
    } else {
        None
    };

    match rec.action {
        MetaAction::Complete | MetaAction::FixStatus => {
            if let Some(task) = target
                && task.status == TaskStatus::Complete
            {
                return Err("task already complete".to_string());
            }
        }
        MetaAction::Unblock => {
            if let Some(task) = target
                && task.status != TaskStatus::Blocked
            {
                return Err(format!("task is {}, not blocked", task.status));
            }
        }
        MetaAction::Block => {
            if let Some(task) = target {
                if task.status == TaskStatus::Blocked {
                    return Err("task already blocked".to_string());
                }
                if task.status == TaskStatus::Complete {
                    return Err("task already complete".to_string());
                }
            }
        }
        MetaAction::Add => {
            let objective = rec
                .new_task
                .as_ref()
                .map(|t| t.objective.trim())
                .unwrap_or("");
            if objective.is_empty() {
                return Err("add requires a non-empty objective".to_string());
            }
            let lower = objective.to_lowercase();
            if board.iter().any(|t| t.objective.trim().to_lowercase() == lower) {
                return Err("duplicate objective".to_string());
            }
        }
        MetaAction::Merge => {
            if rec.related_task_ids.is_empty() {
                return Err("merge requires related task ids".to_string());
            }
            for id in &rec.related_task_ids {
                if find(id.as_str()).is_none() {
                    return Err(format!("unknown related task id: {}", id));
                }
            }
        }
        MetaAction::Decompose => {
            if rec.subtasks.is_empty() {
                return Err("decompose requires subtask objectives".to_string());
            }
        }
        _ => {}
    }

    Ok(())
}
