//! Orchestrator - parallel workers, serial integration
//!
//! Pulls pending tasks from the board, dispatches up to `max_concurrent`
//! workers, feeds completed branches to the merge queue, and persists
//! batch state so an interrupted session resumes where it stopped.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::domain::{ModelTier, Task, TaskTag};
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, Message, ToolDefinition};
use crate::merge::MergeQueue;
use crate::meta::{MetaRecommendation, MetaTaskEngine};
use crate::prompts::{MetaTriageContext, PromptRenderer};
use crate::ratelimit::{GuardOutcome, UsageGuard};
use crate::state::{Batch, StateManager, recover};
use crate::worker::{Worker, WorkerOutcome};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parallel workers; clamped to 1..=5
    pub max_concurrent: u32,
    /// Stop after this many tasks (the `-n` flag)
    pub count: Option<u32>,
    /// Poll interval while paused or waiting
    pub idle_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            count: None,
            idle_delay_ms: 500,
        }
    }
}

/// Result of one batch
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub batch_id: String,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// The top-level scheduler
pub struct Orchestrator {
    state: StateManager,
    worker: Arc<Worker>,
    merge_queue: Arc<MergeQueue>,
    guard: Arc<UsageGuard>,
    llm: Arc<dyn LlmClient>,
    llm_config: LlmConfig,
    renderer: PromptRenderer,
    config: OrchestratorConfig,
    /// Shared with the control daemon
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        worker: Arc<Worker>,
        merge_queue: Arc<MergeQueue>,
        guard: Arc<UsageGuard>,
        llm: Arc<dyn LlmClient>,
        llm_config: LlmConfig,
        mut config: OrchestratorConfig,
    ) -> Self {
        config.max_concurrent = config.max_concurrent.clamp(1, 5);
        Self {
            state,
            worker,
            merge_queue,
            guard,
            llm,
            llm_config,
            renderer: PromptRenderer::new(),
            config,
            paused: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pause flag handle for the control daemon
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Stop flag handle for the control daemon
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    /// Run one batch until the board is drained, the count is reached, or
    /// a stop is requested
    pub async fn run_batch(&self) -> eyre::Result<BatchSummary> {
        // Recovery first: crashed in-progress tasks go back to pending and
        // an interrupted batch resumes before new work starts
        let (_stats, interrupted) = recover(&self.state).await?;

        let mut batch = match interrupted {
            Some(batch) => batch,
            None => {
                let pending: Vec<String> = self
                    .state
                    .list_tasks(Some("pending"), None)
                    .await?
                    .into_iter()
                    .map(|t| t.id)
                    .collect();
                Batch::new(pending)
            }
        };
        self.state.upsert_batch(batch.clone()).await?;
        info!(batch_id = %batch.id, pending = batch.pending_task_ids.len(), "Batch starting");

        let mut summary = BatchSummary {
            batch_id: batch.id.clone(),
            ..Default::default()
        };
        let mut running: JoinSet<(String, eyre::Result<WorkerOutcome>)> = JoinSet::new();
        let mut running_tasks: HashMap<String, Task> = HashMap::new();
        let mut dispatched = 0u32;

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                info!("Stop requested; waiting for in-flight workers");
                break;
            }

            // While paused, in-flight workers keep running but nothing new
            // dispatches
            let usage_paused = self.guard.tracker().is_paused() && !self.guard.tracker().check_auto_resume();
            let paused = self.paused.load(Ordering::SeqCst) || usage_paused;

            if !paused {
                let budget_left = self
                    .config
                    .count
                    .map(|count| dispatched < count)
                    .unwrap_or(true);
                if budget_left && running.len() < self.config.max_concurrent as usize {
                    if let Some(task) = self.select_ready(&running_tasks).await? {
                        dispatched += 1;
                        info!(task_id = %task.id, priority = task.priority, "Dispatching worker");
                        running_tasks.insert(task.id.clone(), task.clone());

                        if task.tag() == Some(TaskTag::MetaTriage) {
                            let this = self.clone_for_meta();
                            let task_id = task.id.clone();
                            running.spawn(async move {
                                let result = this.run_meta_task(&task_id).await;
                                (task_id, result)
                            });
                        } else {
                            let worker = self.worker.clone();
                            let task_id = task.id.clone();
                            running.spawn(async move {
                                let result = worker.run(&task_id).await;
                                (task_id, result)
                            });
                        }
                        continue;
                    }
                }
            }

            if running.is_empty() {
                if paused {
                    tokio::time::sleep(Duration::from_millis(self.config.idle_delay_ms)).await;
                    continue;
                }
                // Nothing running and nothing ready: drained
                break;
            }

            // Wait for the next worker to finish
            if let Some(joined) = running.join_next().await {
                let (task_id, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Worker task panicked");
                        continue;
                    }
                };
                running_tasks.remove(&task_id);
                self.handle_outcome(&task_id, result, &mut batch, &mut summary).await?;
                self.state.upsert_batch(batch.clone()).await?;
            }
        }

        // Drain in-flight workers before finishing the batch
        while let Some(joined) = running.join_next().await {
            if let Ok((task_id, result)) = joined {
                running_tasks.remove(&task_id);
                self.handle_outcome(&task_id, result, &mut batch, &mut summary).await?;
            }
        }

        batch.finish();
        self.state.upsert_batch(batch).await?;
        info!(
            batch_id = %summary.batch_id,
            completed = summary.completed,
            failed = summary.failed,
            "Batch finished"
        );
        Ok(summary)
    }

    async fn handle_outcome(
        &self,
        task_id: &str,
        result: eyre::Result<WorkerOutcome>,
        batch: &mut Batch,
        summary: &mut BatchSummary,
    ) -> eyre::Result<()> {
        match result {
            Ok(WorkerOutcome::Complete { branch, files_modified }) => {
                summary.completed += 1;
                batch.record_outcome(task_id, true);
                if let Some(branch) = branch {
                    self.merge_queue.add(&branch, task_id, "worker", files_modified).await?;
                    let merged = self.merge_queue.process_all().await?;
                    debug!(count = merged.len(), "Merge queue drained");
                }
            }
            Ok(WorkerOutcome::AlreadyComplete { .. }) => {
                summary.completed += 1;
                batch.record_outcome(task_id, true);
            }
            Ok(WorkerOutcome::Decomposed { subtasks }) => {
                // Children are new pending work within this batch
                summary.completed += 1;
                batch.record_outcome(task_id, true);
                batch.pending_task_ids.extend(subtasks);
            }
            Ok(WorkerOutcome::Blocked { .. }) => {
                summary.blocked += 1;
                batch.record_outcome(task_id, false);
            }
            Ok(WorkerOutcome::Failed { category, message }) => {
                warn!(task_id, %category, %message, "Task failed");
                summary.failed += 1;
                batch.record_outcome(task_id, false);
            }
            Err(e) => {
                // Failures never crash the orchestrator
                warn!(task_id, error = %e, "Worker errored");
                summary.failed += 1;
                batch.record_outcome(task_id, false);
            }
        }
        Ok(())
    }

    /// Highest-priority ready task that does not conflict with running work
    async fn select_ready(&self, running: &HashMap<String, Task>) -> eyre::Result<Option<Task>> {
        let all = self.state.list_tasks(None, None).await?;
        let completed: Vec<&str> = all
            .iter()
            .filter(|t| t.status == crate::domain::TaskStatus::Complete)
            .map(|t| t.id.as_str())
            .collect();

        let running_files: HashSet<&String> = running.values().flat_map(|t| t.estimated_files.iter()).collect();
        let running_ids: HashSet<&str> = running.keys().map(String::as_str).collect();

        let mut candidates: Vec<&Task> = all
            .iter()
            .filter(|t| !running_ids.contains(t.id.as_str()))
            .filter(|t| t.is_ready(&completed))
            .filter(|t| !t.conflicts.iter().any(|c| running_ids.contains(c.as_str())))
            .filter(|t| !t.estimated_files.iter().any(|f| running_files.contains(f)))
            .collect();

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.created_at.cmp(&b.created_at)));
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    fn clone_for_meta(&self) -> MetaRunner {
        MetaRunner {
            state: self.state.clone(),
            guard: self.guard.clone(),
            llm: self.llm.clone(),
            llm_config: self.llm_config.clone(),
        }
    }
}

/// Detached meta-task execution (needs only LLM and board access)
struct MetaRunner {
    state: StateManager,
    guard: Arc<UsageGuard>,
    llm: Arc<dyn LlmClient>,
    llm_config: LlmConfig,
}

impl MetaRunner {
    /// Ask the LLM for board recommendations and apply the valid ones
    async fn run_meta_task(&self, task_id: &str) -> eyre::Result<WorkerOutcome> {
        let mut task = self.state.get_task_required(task_id).await?;
        task.mark_started();
        self.state.update_task(task.clone()).await?;

        let board = self.state.list_tasks(None, None).await?;
        let board_json: Vec<_> = board
            .iter()
            .map(|t| json!({ "id": t.id, "objective": t.objective, "status": t.status.to_string(), "priority": t.priority }))
            .collect();

        let prompt = PromptRenderer::new().meta_triage(&MetaTriageContext {
            board_json: serde_json::to_string_pretty(&board_json)?,
        })?;

        let request = CompletionRequest {
            model: self.llm_config.model_id(ModelTier::Mid),
            system_prompt: "You triage task boards for an autonomous development system.".to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![ToolDefinition::new(
                "submit_recommendations",
                "Submit every board recommendation. Call exactly once.",
                json!({
                    "type": "object",
                    "properties": {
                        "recommendations": { "type": "array", "items": { "type": "object" } }
                    },
                    "required": ["recommendations"]
                }),
            )],
            max_tokens: self.llm_config.max_tokens,
        };

        let outcome = self
            .guard
            .guard(ModelTier::Mid, self.llm.complete(request), |r: &CompletionResponse| r.usage)
            .await?;
        let response = match outcome {
            GuardOutcome::Executed(response) => response,
            GuardOutcome::RateLimited(e) => return Err(e.into()),
            GuardOutcome::Blocked { reason, .. } => {
                return Err(eyre::eyre!("usage guard blocked meta-task: {}", reason));
            }
        };

        let recommendations: Vec<MetaRecommendation> = response
            .tool_input("submit_recommendations")
            .and_then(|input| input.get("recommendations"))
            .and_then(|recs| serde_json::from_value(recs.clone()).ok())
            .unwrap_or_default();

        let report = MetaTaskEngine::new(self.state.clone())
            .process(task_id, recommendations)
            .await?;

        let mut task = self.state.get_task_required(task_id).await?;
        task.triage_issues.push(format!(
            "applied {} recommendations, dropped {}",
            report.applied,
            report.rejected.len()
        ));
        task.mark_complete();
        self.state.update_task(task).await?;

        Ok(WorkerOutcome::Complete {
            branch: None,
            files_modified: Vec::new(),
        })
    }
}
