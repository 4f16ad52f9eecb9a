//! Worker checkpoints
//!
//! A checkpoint is persisted at every phase boundary so a crashed worker
//! resumes mid-task instead of starting over. Phases only advance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use understore::{IndexValue, Record, now_ms};

use crate::domain::ModelTier;

/// Worker phases, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    #[default]
    Starting,
    Planning,
    Executing,
    Verifying,
    Reviewing,
    Complete,
    Failed,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Reviewing => "reviewing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Persisted per-task snapshot for mid-task resumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The owning task's ID is the record ID
    pub id: String,
    pub phase: WorkerPhase,
    pub tier: ModelTier,
    pub attempts: u32,
    /// Feedback from the last verification, if any
    pub last_verification: Option<String>,
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(task_id: impl Into<String>, tier: ModelTier) -> Self {
        Self {
            id: task_id.into(),
            phase: WorkerPhase::Starting,
            tier,
            attempts: 0,
            last_verification: None,
            updated_at: now_ms(),
        }
    }

    /// Advance to a later phase; backwards transitions are ignored except
    /// the verify -> execute retry edge
    pub fn advance(&mut self, phase: WorkerPhase) {
        let retry_edge = self.phase >= WorkerPhase::Verifying && phase == WorkerPhase::Executing;
        if phase > self.phase || retry_edge {
            self.phase = phase;
            self.updated_at = now_ms();
        }
    }

    pub fn record_attempt(&mut self, tier: ModelTier, attempts: u32) {
        self.tier = tier;
        self.attempts = attempts;
        self.updated_at = now_ms();
    }
}

impl Record for Checkpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "checkpoints"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("phase".to_string(), IndexValue::String(self.phase.to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_ordered() {
        assert!(WorkerPhase::Starting < WorkerPhase::Planning);
        assert!(WorkerPhase::Planning < WorkerPhase::Executing);
        assert!(WorkerPhase::Executing < WorkerPhase::Verifying);
        assert!(WorkerPhase::Verifying < WorkerPhase::Reviewing);
        assert!(WorkerPhase::Reviewing < WorkerPhase::Complete);
    }

    #[test]
    fn test_advance_only_forward() {
        let mut checkpoint = Checkpoint::new("t1", ModelTier::Mid);
        checkpoint.advance(WorkerPhase::Executing);
        assert_eq!(checkpoint.phase, WorkerPhase::Executing);

        checkpoint.advance(WorkerPhase::Starting);
        assert_eq!(checkpoint.phase, WorkerPhase::Executing);
    }

    #[test]
    fn test_retry_edge_allowed() {
        let mut checkpoint = Checkpoint::new("t1", ModelTier::Mid);
        checkpoint.advance(WorkerPhase::Verifying);
        checkpoint.advance(WorkerPhase::Executing);
        assert_eq!(checkpoint.phase, WorkerPhase::Executing);
    }

    #[test]
    fn test_record_attempt() {
        let mut checkpoint = Checkpoint::new("t1", ModelTier::Mid);
        checkpoint.record_attempt(ModelTier::Top, 3);
        assert_eq!(checkpoint.tier, ModelTier::Top);
        assert_eq!(checkpoint.attempts, 3);
    }
}
