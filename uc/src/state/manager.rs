//! StateManager - actor that owns the embedded store
//!
//! Processes commands via channels for thread-safe access to persistent
//! state. Writes serialise through the actor; callers hold snapshots.

use std::path::Path;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use understore::{Filter, Store};

use crate::domain::{AttemptRecord, ModelTier, Task, TaskStatus};
use crate::learn::{CoModification, DecisionPoint, ErrorPattern, KeywordCorrelation, Learning, PermanentFailure};
use crate::merge::MergeQueueItem;
use crate::worker::Checkpoint;

use super::messages::{StateCommand, StateError, StateResult};
use super::recovery::Batch;

/// Aggregated board metrics
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BoardMetrics {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub complete: u64,
    pub failed: u64,
}

/// Broadcast when state changes that watchers should react to
#[derive(Debug, Clone)]
pub enum StateEvent {
    TaskCreated { id: String },
    TaskUpdated { id: String },
    BatchUpdated { id: String },
}

/// Handle to send commands to the state actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateManager {
    /// Open the store and spawn the actor
    pub fn spawn(db_path: impl AsRef<Path>) -> eyre::Result<Self> {
        let store = Store::open(db_path.as_ref())?;
        let (tx, rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(actor_loop(store, rx));
        info!(db_path = %db_path.as_ref().display(), "StateManager spawned");

        Ok(Self { tx, event_tx })
    }

    /// Subscribe to state change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<StateResult<T>>) -> StateCommand) -> StateResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| StateError::ChannelClosed)?;
        reply_rx.await.map_err(|_| StateError::ChannelClosed)?
    }

    // === Task operations ===

    pub async fn create_task(&self, task: Task) -> StateResult<String> {
        debug!(task_id = %task.id, "create_task");
        let result = self.request(|reply| StateCommand::CreateTask { task, reply }).await;
        if let Ok(id) = &result {
            let _ = self.event_tx.send(StateEvent::TaskCreated { id: id.clone() });
        }
        result
    }

    pub async fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetTask { id, reply }).await
    }

    /// Get a task, erroring when missing
    pub async fn get_task_required(&self, id: &str) -> StateResult<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Task {}", id)))
    }

    pub async fn update_task(&self, task: Task) -> StateResult<()> {
        debug!(task_id = %task.id, status = %task.status, "update_task");
        let id = task.id.clone();
        let result = self.request(|reply| StateCommand::UpdateTask { task, reply }).await;
        if result.is_ok() {
            let _ = self.event_tx.send(StateEvent::TaskUpdated { id });
        }
        result
    }

    pub async fn list_tasks(&self, status: Option<&str>, parent: Option<&str>) -> StateResult<Vec<Task>> {
        let status = status.map(String::from);
        let parent = parent.map(String::from);
        self.request(|reply| StateCommand::ListTasks { status, parent, reply }).await
    }

    pub async fn delete_task(&self, id: &str) -> StateResult<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::DeleteTask { id, reply }).await
    }

    /// Aggregated board metrics
    pub async fn board_metrics(&self) -> StateResult<BoardMetrics> {
        let tasks = self.list_tasks(None, None).await?;
        let mut metrics = BoardMetrics::default();
        for task in tasks {
            metrics.total += 1;
            match task.status {
                TaskStatus::Pending => metrics.pending += 1,
                TaskStatus::InProgress => metrics.in_progress += 1,
                TaskStatus::Blocked => metrics.blocked += 1,
                TaskStatus::Complete => metrics.complete += 1,
                TaskStatus::Failed => metrics.failed += 1,
            }
        }
        Ok(metrics)
    }

    // === Attempt operations ===

    /// Append a new attempt; the actor assigns the next number
    pub async fn append_attempt(&self, task_id: &str, tier: ModelTier) -> StateResult<AttemptRecord> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::AppendAttempt { task_id, tier, reply }).await
    }

    pub async fn update_attempt(&self, attempt: AttemptRecord) -> StateResult<()> {
        self.request(|reply| StateCommand::UpdateAttempt { attempt, reply }).await
    }

    /// Attempts for one task (or all), ordered by attempt number
    pub async fn list_attempts(&self, task_id: Option<&str>) -> StateResult<Vec<AttemptRecord>> {
        let task_id = task_id.map(String::from);
        self.request(|reply| StateCommand::ListAttempts { task_id, reply }).await
    }

    // === Learning operations ===

    pub async fn upsert_learning(&self, learning: Learning) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertLearning { learning, reply }).await
    }

    pub async fn list_learnings(&self, category: Option<&str>) -> StateResult<Vec<Learning>> {
        let category = category.map(String::from);
        self.request(|reply| StateCommand::ListLearnings { category, reply }).await
    }

    // === Error pattern operations ===

    pub async fn upsert_error_pattern(&self, pattern: ErrorPattern) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertErrorPattern { pattern, reply }).await
    }

    pub async fn get_error_pattern(&self, signature: &str) -> StateResult<Option<ErrorPattern>> {
        let signature = signature.to_string();
        self.request(|reply| StateCommand::GetErrorPattern { signature, reply }).await
    }

    pub async fn list_error_patterns(&self) -> StateResult<Vec<ErrorPattern>> {
        self.request(|reply| StateCommand::ListErrorPatterns { reply }).await
    }

    pub async fn create_permanent_failure(&self, failure: PermanentFailure) -> StateResult<()> {
        self.request(|reply| StateCommand::CreatePermanentFailure { failure, reply }).await
    }

    pub async fn list_permanent_failures(&self) -> StateResult<Vec<PermanentFailure>> {
        self.request(|reply| StateCommand::ListPermanentFailures { reply }).await
    }

    // === Decision operations ===

    pub async fn upsert_decision(&self, decision: DecisionPoint) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertDecision { decision, reply }).await
    }

    pub async fn get_decision(&self, id: &str) -> StateResult<Option<DecisionPoint>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetDecision { id, reply }).await
    }

    pub async fn list_decisions(&self, filters: &[Filter]) -> StateResult<Vec<DecisionPoint>> {
        let filters = filters.to_vec();
        self.request(|reply| StateCommand::ListDecisions { filters, reply }).await
    }

    pub async fn delete_decision(&self, id: &str) -> StateResult<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::DeleteDecision { id, reply }).await
    }

    // === File pattern operations ===

    pub async fn upsert_keyword_correlation(&self, record: KeywordCorrelation) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertKeywordCorrelation { record, reply }).await
    }

    pub async fn get_keyword_correlation(&self, keyword: &str) -> StateResult<Option<KeywordCorrelation>> {
        let keyword = keyword.to_string();
        self.request(|reply| StateCommand::GetKeywordCorrelation { keyword, reply }).await
    }

    pub async fn upsert_co_modification(&self, record: CoModification) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertCoModification { record, reply }).await
    }

    pub async fn get_co_modification(&self, file: &str) -> StateResult<Option<CoModification>> {
        let file = file.to_string();
        self.request(|reply| StateCommand::GetCoModification { file, reply }).await
    }

    // === Checkpoint operations ===

    pub async fn upsert_checkpoint(&self, checkpoint: Checkpoint) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertCheckpoint { checkpoint, reply }).await
    }

    pub async fn get_checkpoint(&self, task_id: &str) -> StateResult<Option<Checkpoint>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::GetCheckpoint { task_id, reply }).await
    }

    pub async fn delete_checkpoint(&self, task_id: &str) -> StateResult<()> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::DeleteCheckpoint { task_id, reply }).await
    }

    // === Merge queue operations ===

    pub async fn upsert_merge_item(&self, item: MergeQueueItem) -> StateResult<()> {
        self.request(|reply| StateCommand::UpsertMergeItem { item, reply }).await
    }

    pub async fn get_merge_item(&self, id: &str) -> StateResult<Option<MergeQueueItem>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetMergeItem { id, reply }).await
    }

    pub async fn list_merge_items(&self, status: Option<&str>) -> StateResult<Vec<MergeQueueItem>> {
        let status = status.map(String::from);
        self.request(|reply| StateCommand::ListMergeItems { status, reply }).await
    }

    // === Batch operations ===

    pub async fn upsert_batch(&self, batch: Batch) -> StateResult<()> {
        let id = batch.id.clone();
        let result = self.request(|reply| StateCommand::UpsertBatch { batch, reply }).await;
        if result.is_ok() {
            let _ = self.event_tx.send(StateEvent::BatchUpdated { id });
        }
        result
    }

    pub async fn get_batch(&self, id: &str) -> StateResult<Option<Batch>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetBatch { id, reply }).await
    }

    pub async fn list_batches(&self) -> StateResult<Vec<Batch>> {
        self.request(|reply| StateCommand::ListBatches { reply }).await
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> StateResult<()> {
        self.tx.send(StateCommand::Shutdown).await.map_err(|_| StateError::ChannelClosed)
    }
}

fn store_err(e: understore::StoreError) -> StateError {
    StateError::Store(e.to_string())
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("State actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateTask { task, reply } => {
                let _ = reply.send(store.create(task).map_err(store_err));
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get::<Task>(&id).map_err(store_err));
            }
            StateCommand::UpdateTask { task, reply } => {
                let _ = reply.send(store.update(task).map_err(store_err));
            }
            StateCommand::ListTasks { status, parent, reply } => {
                let mut filters = Vec::new();
                if let Some(status) = status {
                    filters.push(Filter::eq("status", status));
                }
                if let Some(parent) = parent {
                    filters.push(Filter::eq("parent", parent));
                }
                let _ = reply.send(store.list::<Task>(&filters).map_err(store_err));
            }
            StateCommand::DeleteTask { id, reply } => {
                let _ = reply.send(store.delete::<Task>(&id).map_err(store_err));
            }

            StateCommand::AppendAttempt { task_id, tier, reply } => {
                let result = store
                    .list::<AttemptRecord>(&[Filter::eq("task_id", task_id.clone())])
                    .map_err(store_err)
                    .and_then(|existing| {
                        // Attempt number equals position + 1, append-only
                        let attempt = AttemptRecord::start(&task_id, existing.len() as u32 + 1, tier);
                        store.create(attempt.clone()).map_err(store_err)?;
                        Ok(attempt)
                    });
                let _ = reply.send(result);
            }
            StateCommand::UpdateAttempt { attempt, reply } => {
                let _ = reply.send(store.update(attempt).map_err(store_err));
            }
            StateCommand::ListAttempts { task_id, reply } => {
                let filters = match task_id {
                    Some(task_id) => vec![Filter::eq("task_id", task_id)],
                    None => Vec::new(),
                };
                let result = store.list::<AttemptRecord>(&filters).map_err(store_err).map(|mut attempts| {
                    attempts.sort_by_key(|a| (a.task_id.clone(), a.number));
                    attempts
                });
                let _ = reply.send(result);
            }

            StateCommand::UpsertLearning { learning, reply } => {
                let _ = reply.send(store.update(learning).map_err(store_err));
            }
            StateCommand::ListLearnings { category, reply } => {
                let filters = match category {
                    Some(category) => vec![Filter::eq("category", category)],
                    None => Vec::new(),
                };
                let _ = reply.send(store.list::<Learning>(&filters).map_err(store_err));
            }

            StateCommand::UpsertErrorPattern { pattern, reply } => {
                let _ = reply.send(store.update(pattern).map_err(store_err));
            }
            StateCommand::GetErrorPattern { signature, reply } => {
                let _ = reply.send(store.get::<ErrorPattern>(&signature).map_err(store_err));
            }
            StateCommand::ListErrorPatterns { reply } => {
                let _ = reply.send(store.list::<ErrorPattern>(&[]).map_err(store_err));
            }
            StateCommand::CreatePermanentFailure { failure, reply } => {
                let _ = reply.send(store.create(failure).map(|_| ()).map_err(store_err));
            }
            StateCommand::ListPermanentFailures { reply } => {
                let _ = reply.send(store.list::<PermanentFailure>(&[]).map_err(store_err));
            }

            StateCommand::UpsertDecision { decision, reply } => {
                let _ = reply.send(store.update(decision).map_err(store_err));
            }
            StateCommand::GetDecision { id, reply } => {
                let _ = reply.send(store.get::<DecisionPoint>(&id).map_err(store_err));
            }
            StateCommand::ListDecisions { filters, reply } => {
                let _ = reply.send(store.list::<DecisionPoint>(&filters).map_err(store_err));
            }
            StateCommand::DeleteDecision { id, reply } => {
                let _ = reply.send(store.delete::<DecisionPoint>(&id).map_err(store_err));
            }

            StateCommand::UpsertKeywordCorrelation { record, reply } => {
                let _ = reply.send(store.update(record).map_err(store_err));
            }
            StateCommand::GetKeywordCorrelation { keyword, reply } => {
                let _ = reply.send(store.get::<KeywordCorrelation>(&keyword).map_err(store_err));
            }
            StateCommand::UpsertCoModification { record, reply } => {
                let _ = reply.send(store.update(record).map_err(store_err));
            }
            StateCommand::GetCoModification { file, reply } => {
                let _ = reply.send(store.get::<CoModification>(&file).map_err(store_err));
            }

            StateCommand::UpsertCheckpoint { checkpoint, reply } => {
                let _ = reply.send(store.update(checkpoint).map_err(store_err));
            }
            StateCommand::GetCheckpoint { task_id, reply } => {
                let _ = reply.send(store.get::<Checkpoint>(&task_id).map_err(store_err));
            }
            StateCommand::DeleteCheckpoint { task_id, reply } => {
                let _ = reply.send(store.delete::<Checkpoint>(&task_id).map_err(store_err));
            }

            StateCommand::UpsertMergeItem { item, reply } => {
                let _ = reply.send(store.update(item).map_err(store_err));
            }
            StateCommand::GetMergeItem { id, reply } => {
                let _ = reply.send(store.get::<MergeQueueItem>(&id).map_err(store_err));
            }
            StateCommand::ListMergeItems { status, reply } => {
                let filters = match status {
                    Some(status) => vec![Filter::eq("status", status)],
                    None => Vec::new(),
                };
                let result = store.list::<MergeQueueItem>(&filters).map_err(store_err).map(|mut items| {
                    items.sort_by_key(|i| i.queued_at);
                    items
                });
                let _ = reply.send(result);
            }

            StateCommand::UpsertBatch { batch, reply } => {
                let _ = reply.send(store.update(batch).map_err(store_err));
            }
            StateCommand::GetBatch { id, reply } => {
                let _ = reply.send(store.get::<Batch>(&id).map_err(store_err));
            }
            StateCommand::ListBatches { reply } => {
                let result = store.list::<Batch>(&[]).map_err(store_err).map(|mut batches| {
                    batches.sort_by_key(|b| b.started_at);
                    batches
                });
                let _ = reply.send(result);
            }

            StateCommand::Shutdown => {
                info!("State actor shutting down");
                break;
            }
        }
    }

    debug!("State actor stopped");
}
