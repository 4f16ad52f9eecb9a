//! Command and error types for the state actor

use thiserror::Error;
use tokio::sync::oneshot;
use understore::Filter;

use crate::domain::{AttemptRecord, ModelTier, Task};
use crate::learn::{CoModification, DecisionPoint, ErrorPattern, KeywordCorrelation, Learning, PermanentFailure};
use crate::merge::MergeQueueItem;
use crate::worker::Checkpoint;

use super::recovery::Batch;

/// Errors from state operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("State channel closed")]
    ChannelClosed,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

pub type StateResult<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResult<T>>;

/// Commands processed by the state actor
pub enum StateCommand {
    // === Tasks ===
    CreateTask { task: Task, reply: Reply<String> },
    GetTask { id: String, reply: Reply<Option<Task>> },
    UpdateTask { task: Task, reply: Reply<()> },
    ListTasks {
        status: Option<String>,
        parent: Option<String>,
        reply: Reply<Vec<Task>>,
    },
    DeleteTask { id: String, reply: Reply<()> },

    // === Attempts (append-only; the actor assigns numbers) ===
    AppendAttempt {
        task_id: String,
        tier: ModelTier,
        reply: Reply<AttemptRecord>,
    },
    UpdateAttempt { attempt: AttemptRecord, reply: Reply<()> },
    ListAttempts {
        task_id: Option<String>,
        reply: Reply<Vec<AttemptRecord>>,
    },

    // === Learnings ===
    UpsertLearning { learning: Learning, reply: Reply<()> },
    ListLearnings {
        category: Option<String>,
        reply: Reply<Vec<Learning>>,
    },

    // === Error patterns / permanent failures ===
    UpsertErrorPattern { pattern: ErrorPattern, reply: Reply<()> },
    GetErrorPattern {
        signature: String,
        reply: Reply<Option<ErrorPattern>>,
    },
    ListErrorPatterns { reply: Reply<Vec<ErrorPattern>> },
    CreatePermanentFailure { failure: PermanentFailure, reply: Reply<()> },
    ListPermanentFailures { reply: Reply<Vec<PermanentFailure>> },

    // === Decisions ===
    UpsertDecision { decision: DecisionPoint, reply: Reply<()> },
    GetDecision {
        id: String,
        reply: Reply<Option<DecisionPoint>>,
    },
    ListDecisions {
        filters: Vec<Filter>,
        reply: Reply<Vec<DecisionPoint>>,
    },
    DeleteDecision { id: String, reply: Reply<()> },

    // === File patterns ===
    UpsertKeywordCorrelation { record: KeywordCorrelation, reply: Reply<()> },
    GetKeywordCorrelation {
        keyword: String,
        reply: Reply<Option<KeywordCorrelation>>,
    },
    UpsertCoModification { record: CoModification, reply: Reply<()> },
    GetCoModification {
        file: String,
        reply: Reply<Option<CoModification>>,
    },

    // === Worker checkpoints ===
    UpsertCheckpoint { checkpoint: Checkpoint, reply: Reply<()> },
    GetCheckpoint {
        task_id: String,
        reply: Reply<Option<Checkpoint>>,
    },
    DeleteCheckpoint { task_id: String, reply: Reply<()> },

    // === Merge queue ===
    UpsertMergeItem { item: MergeQueueItem, reply: Reply<()> },
    GetMergeItem {
        id: String,
        reply: Reply<Option<MergeQueueItem>>,
    },
    ListMergeItems {
        status: Option<String>,
        reply: Reply<Vec<MergeQueueItem>>,
    },

    // === Batches ===
    UpsertBatch { batch: Batch, reply: Reply<()> },
    GetBatch { id: String, reply: Reply<Option<Batch>> },
    ListBatches { reply: Reply<Vec<Batch>> },

    /// Stop the actor
    Shutdown,
}
