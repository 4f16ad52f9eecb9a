//! Worker - executes one task's full lifecycle
//!
//! briefing -> plan (optional) -> agent -> verification -> review, with
//! checkpoints at every phase boundary. Attempt accounting caps same-tier
//! retries, escalates through the router, and records a permanent failure
//! only after every retry and escalation is exhausted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assess::{Assessment, ComplexityAssessor, ModelRouter, SuccessStats};
use crate::config::LlmConfig;
use crate::domain::{ErrorCategory, LastAttempt, ModelTier, Task, TaskTag};
use crate::learn::{ErrorPatternStore, FilePatternStore, KnowledgeBase, PermanentFailure};
use crate::llm::{
    AgentBrief, AgentEvent, AgentRuntime, CompletionRequest, CompletionResponse, LlmClient, Message, ToolDefinition,
};
use crate::planner::{PlanOutcome, Planner};
use crate::prompts::{BriefingContext, ExecutionReviewContext, PromptRenderer};
use crate::ratelimit::{GuardOutcome, UsageGuard};
use crate::state::StateManager;
use crate::verify::{FeedbackEnricher, Verifier};

use super::checkpoint::{Checkpoint, WorkerPhase};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Global attempt cap per task
    pub max_attempts: u32,
    /// Same-tier retries before consulting the escalation ladder
    pub max_retries_per_tier: u32,
    /// Consecutive no-op agent runs before declaring already-complete
    pub no_op_threshold: u32,
    /// Review pass after verification
    pub review: bool,
    /// Soft timeout per agent call
    pub agent_timeout_ms: u64,
    /// Backoff base for transient retries
    pub retry_base_delay_ms: u64,
    /// Repository root the agent works in
    pub repo_root: PathBuf,
    /// Create a work branch per task (off for --no-commit and tests)
    pub create_branch: bool,
    /// Minimum samples before historical metrics adjust routing
    pub metrics_min_samples: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            max_retries_per_tier: 2,
            no_op_threshold: 3,
            review: true,
            agent_timeout_ms: 1_800_000,
            retry_base_delay_ms: 1000,
            repo_root: PathBuf::from("."),
            create_branch: true,
            metrics_min_samples: 5,
        }
    }
}

/// Final outcome of a worker run
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    /// Task done; branch is set when a work branch was created
    Complete {
        branch: Option<String>,
        files_modified: Vec<String>,
    },
    /// Nothing to do; reason recorded on the task
    AlreadyComplete { reason: String },
    /// Split into subtasks instead of executing
    Decomposed { subtasks: Vec<String> },
    /// Human-required questions block execution
    Blocked { open_questions: Vec<String> },
    /// Exhausted retries; permanent failure recorded
    Failed { category: ErrorCategory, message: String },
}

/// Executes one task's full lifecycle
pub struct Worker {
    state: StateManager,
    agent: Arc<dyn AgentRuntime>,
    llm: Arc<dyn LlmClient>,
    llm_config: LlmConfig,
    guard: Arc<UsageGuard>,
    planner: Planner,
    verifier: Verifier,
    enricher: FeedbackEnricher,
    errors: ErrorPatternStore,
    knowledge: KnowledgeBase,
    files: FilePatternStore,
    assessor: ComplexityAssessor,
    router: ModelRouter,
    renderer: PromptRenderer,
    config: WorkerConfig,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        agent: Arc<dyn AgentRuntime>,
        llm: Arc<dyn LlmClient>,
        llm_config: LlmConfig,
        guard: Arc<UsageGuard>,
        planner: Planner,
        verifier: Verifier,
        assessor: ComplexityAssessor,
        router: ModelRouter,
        config: WorkerConfig,
    ) -> Self {
        let errors = ErrorPatternStore::new(state.clone());
        let knowledge = KnowledgeBase::new(state.clone());
        let files = FilePatternStore::new(state.clone());
        let enricher = FeedbackEnricher::new(
            ErrorPatternStore::new(state.clone()),
            KnowledgeBase::new(state.clone()),
            FilePatternStore::new(state.clone()),
        );

        Self {
            state,
            agent,
            llm,
            llm_config,
            guard,
            planner,
            verifier,
            enricher,
            errors,
            knowledge,
            files,
            assessor,
            router,
            renderer: PromptRenderer::new(),
            config,
        }
    }

    /// Run one task to a terminal outcome
    pub async fn run(&self, task_id: &str) -> eyre::Result<WorkerOutcome> {
        let mut task = self.state.get_task_required(task_id).await?;
        if !task.mark_started() {
            return Ok(WorkerOutcome::Failed {
                category: ErrorCategory::ValidationError,
                message: format!("task {} cannot start from status {}", task_id, task.status),
            });
        }
        self.state.update_task(task.clone()).await?;

        let assessment = self.assessor.assess(&task.objective);
        info!(
            task_id,
            level = %assessment.level,
            confidence = assessment.confidence,
            "Worker starting"
        );

        // Pure local-tool objectives skip the agent entirely
        if let Some(tool) = &assessment.local_tool {
            return self.run_local_tool(task, &tool.command.clone()).await;
        }

        // [plan] tasks produce a plan and stop; nothing executes
        if task.tag() == Some(TaskTag::Plan) {
            return self.run_plan_only(task).await;
        }

        // Resume from the checkpoint when one exists
        let mut checkpoint = match self.state.get_checkpoint(task_id).await? {
            Some(checkpoint) => {
                info!(task_id, phase = %checkpoint.phase, attempts = checkpoint.attempts, "Resuming from checkpoint");
                checkpoint
            }
            None => Checkpoint::new(task_id, self.starting_tier(&assessment, &task).await),
        };

        // Planning (skipped below the standard level and for resumed work
        // already past the phase)
        let mut plan_text = None;
        if assessment.team.needs_planning && checkpoint.phase <= WorkerPhase::Planning {
            checkpoint.advance(WorkerPhase::Planning);
            self.state.upsert_checkpoint(checkpoint.clone()).await?;

            match self
                .planner
                .create_plan(&task.objective, &self.config.repo_root, checkpoint.tier)
                .await?
            {
                PlanOutcome::Approved { plan, .. } => {
                    task.set_estimated_files(plan.files_to_modify.clone());
                    self.state.update_task(task.clone()).await?;
                    plan_text = Some(plan.render());
                }
                PlanOutcome::AlreadyComplete { reason } => {
                    return self.finish_already_complete(task, checkpoint, reason).await;
                }
                PlanOutcome::NeedsDecomposition { subtasks } => {
                    return self.finish_decomposed(task, checkpoint, subtasks).await;
                }
                PlanOutcome::Blocked { open_questions } => {
                    task.block(format!("open questions: {}", open_questions.join("; ")));
                    self.state.update_task(task).await?;
                    self.state.delete_checkpoint(task_id).await?;
                    return Ok(WorkerOutcome::Blocked { open_questions });
                }
                PlanOutcome::Rejected { reason } => {
                    // A rejected plan is not fatal; execute unplanned
                    warn!(task_id, %reason, "Plan rejected, executing without one");
                }
            }
        }

        let branch = self.prepare_branch(task_id).await;
        self.attempt_loop(task, checkpoint, assessment, plan_text, branch).await
    }

    /// The execute -> verify -> review loop with retries and escalation
    async fn attempt_loop(
        &self,
        mut task: Task,
        mut checkpoint: Checkpoint,
        assessment: Assessment,
        plan_text: Option<String>,
        branch: Option<String>,
    ) -> eyre::Result<WorkerOutcome> {
        let mut tier = checkpoint.tier;
        let mut attempts_on_tier = 0u32;
        let mut crash_retried = false;
        let mut feedback: Option<String> = checkpoint.last_verification.clone();
        let mut detailed_errors: Vec<String> = Vec::new();
        let mut files_attempted: Vec<String> = Vec::new();

        while checkpoint.attempts < self.config.max_attempts {
            checkpoint.advance(WorkerPhase::Executing);
            let attempt_record = self.state.append_attempt(&task.id, tier).await?;
            checkpoint.record_attempt(tier, attempt_record.number);
            self.state.upsert_checkpoint(checkpoint.clone()).await?;
            attempts_on_tier += 1;

            debug!(task_id = %task.id, attempt = attempt_record.number, tier = %tier, "Attempt starting");

            let brief = self.build_brief(&task, &assessment, plan_text.as_deref(), feedback.as_deref()).await?;
            let (events_tx, events_rx) = mpsc::channel(64);
            drain_events(events_rx);

            let mut attempt = attempt_record;
            let failure: Option<(ErrorCategory, String)> = match self.agent.run(brief, events_tx).await {
                Err(agent_error) => {
                    let category = agent_error.category();
                    Some((category, agent_error.to_string()))
                }
                Ok(outcome) => {
                    attempt.add_usage(
                        outcome.usage.input_tokens,
                        outcome.usage.output_tokens,
                        outcome.usage.cost_usd(&self.llm_config.model_id(tier)),
                    );
                    self.guard
                        .tracker()
                        .record_usage(tier, outcome.usage.input_tokens, outcome.usage.output_tokens);

                    if !outcome.success {
                        Some((ErrorCategory::ToolError, outcome.message.clone()))
                    } else if outcome.files_modified.is_empty() {
                        // No-op detection
                        let count = task.record_no_op_edit();
                        self.state.update_task(task.clone()).await?;
                        if count >= self.config.no_op_threshold {
                            attempt.succeed(Vec::new());
                            self.state.update_attempt(attempt).await?;
                            return self
                                .finish_already_complete(
                                    task,
                                    checkpoint,
                                    "agent repeatedly reported no changes needed".to_string(),
                                )
                                .await;
                        }
                        Some((
                            ErrorCategory::NoChanges,
                            format!(
                                "the agent finished without modifying any files; expected changes toward: {}",
                                task.objective
                            ),
                        ))
                    } else {
                        files_attempted = outcome.files_modified.clone();
                        self.verify_and_review(&task, &mut checkpoint, &outcome.files_modified, &outcome.message)
                            .await?
                    }
                }
            };

            match failure {
                None => {
                    attempt.succeed(files_attempted.clone());
                    self.state.update_attempt(attempt).await?;
                    return self.finish_complete(task, checkpoint, branch, files_attempted).await;
                }
                Some((category, message)) => {
                    attempt.fail(category, &message);
                    self.state.update_attempt(attempt.clone()).await?;
                    detailed_errors.push(format!("attempt {}: [{}] {}", attempt.number, category, message));

                    task.record_attempt(LastAttempt {
                        model: tier.name().to_string(),
                        error_category: Some(category),
                        error_message: Some(message.clone()),
                        modified_files: files_attempted.clone(),
                        attempt_count: attempt.number,
                    });
                    self.state.update_task(task.clone()).await?;

                    if let Err(e) = self.errors.record_failure(category, &message).await {
                        debug!(error = %e, "Failed to record error pattern");
                    }

                    // Enriched feedback for the next attempt; sub-failures
                    // are swallowed inside the enricher
                    let enriched = self
                        .enricher
                        .enrich(&task.objective, &message, &message, &files_attempted)
                        .await;
                    checkpoint.last_verification = Some(enriched.clone());
                    feedback = Some(enriched);

                    if category.is_transient() {
                        // Transient: backoff, retry the same tier
                        let delay = self.config.retry_base_delay_ms * (1u64 << attempts_on_tier.min(6));
                        debug!(delay_ms = delay, "Transient failure, backing off");
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        continue;
                    }

                    if category == ErrorCategory::Crash && !crash_retried {
                        // One same-tier retry for a crashed agent, then
                        // escalation takes over
                        crash_retried = true;
                        continue;
                    }

                    let escalate_now = category == ErrorCategory::ValidationError
                        || category == ErrorCategory::Crash
                        || attempts_on_tier >= self.config.max_retries_per_tier;
                    if escalate_now {
                        let step = self.router.get_next_model_tier(tier);
                        if step.can_escalate
                            && let Some(next) = step.next_tier
                        {
                            info!(task_id = %task.id, from = %tier, to = %next, "Escalating tier");
                            tier = next;
                            attempts_on_tier = 0;
                        }
                    }
                }
            }
        }

        // All retries and escalations exhausted
        let last = task.last_attempt.clone().unwrap_or_default();
        let category = ErrorCategory::MaxAttempts;
        let message = last
            .error_message
            .clone()
            .unwrap_or_else(|| "max attempts reached".to_string());

        self.errors
            .record_permanent_failure(PermanentFailure::new(
                last.error_category.unwrap_or(ErrorCategory::Unknown),
                &message,
                &task.objective,
                tier,
                checkpoint.attempts,
                files_attempted,
                detailed_errors,
            ))
            .await?;

        self.files
            .record_task_outcome(&task.objective, &[], false)
            .await
            .unwrap_or_else(|e| debug!(error = %e, "Pattern store update failed"));

        checkpoint.advance(WorkerPhase::Failed);
        self.state.upsert_checkpoint(checkpoint).await?;
        task.mark_failed();
        self.state.update_task(task.clone()).await?;
        self.state.delete_checkpoint(&task.id).await?;

        warn!(task_id = %task.id, "Task failed permanently");
        Ok(WorkerOutcome::Failed { category, message })
    }

    /// Verify, then run the review pass; None means success
    async fn verify_and_review(
        &self,
        task: &Task,
        checkpoint: &mut Checkpoint,
        files_modified: &[String],
        agent_summary: &str,
    ) -> eyre::Result<Option<(ErrorCategory, String)>> {
        checkpoint.advance(WorkerPhase::Verifying);
        self.state.upsert_checkpoint(checkpoint.clone()).await?;

        let verification = self.verifier.run(&self.config.repo_root).await?;
        if !verification.passed {
            let category = verification.category.unwrap_or(ErrorCategory::Unknown);
            return Ok(Some((category, verification.feedback)));
        }

        if !self.config.review {
            return Ok(None);
        }
        let review_level = self.router.determine_review_level(&self.assessor.assess(&task.objective));
        if !review_level.review {
            return Ok(None);
        }

        checkpoint.advance(WorkerPhase::Reviewing);
        self.state.upsert_checkpoint(checkpoint.clone()).await?;

        match self
            .review_pass(task, files_modified, agent_summary, review_level.max_review_tier)
            .await
        {
            Ok(Some(issues)) => Ok(Some((ErrorCategory::ValidationError, issues))),
            Ok(None) => Ok(None),
            Err(e) => {
                // A broken reviewer never blocks verified work
                warn!(error = %e, "Review pass failed, accepting verified result");
                Ok(None)
            }
        }
    }

    /// LLM review of a verified change; Some(issues) means rejection
    async fn review_pass(
        &self,
        task: &Task,
        files_modified: &[String],
        agent_summary: &str,
        tier: ModelTier,
    ) -> eyre::Result<Option<String>> {
        let prompt = self.renderer.execution_review(&ExecutionReviewContext {
            objective: task.objective.clone(),
            files_modified: files_modified.to_vec(),
            summary: agent_summary.to_string(),
        })?;

        let request = CompletionRequest {
            model: self.llm_config.model_id(tier),
            system_prompt: "You review automated code changes for objective mismatches.".to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![ToolDefinition::new(
                "submit_review",
                "Submit the review verdict. Call exactly once.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "approved": { "type": "boolean" },
                        "issues": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["approved"]
                }),
            )],
            max_tokens: self.llm_config.max_tokens,
        };

        let outcome = self
            .guard
            .guard(tier, self.llm.complete(request), |r: &CompletionResponse| r.usage)
            .await?;
        let response = match outcome {
            GuardOutcome::Executed(response) => response,
            GuardOutcome::RateLimited(e) => return Err(e.into()),
            GuardOutcome::Blocked { reason, .. } => return Err(eyre::eyre!("usage guard blocked review: {}", reason)),
        };

        let Some(input) = response.tool_input("submit_review") else {
            return Ok(None);
        };
        let approved = input.get("approved").and_then(|v| v.as_bool()).unwrap_or(true);
        if approved {
            return Ok(None);
        }

        let issues: Vec<String> = input
            .get("issues")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(Some(format!("review rejected the change: {}", issues.join("; "))))
    }

    /// `[plan]` tasks: plan, record it on the task, never execute
    async fn run_plan_only(&self, mut task: Task) -> eyre::Result<WorkerOutcome> {
        let objective = task.objective.trim_start().trim_start_matches("[plan]").trim().to_string();

        match self
            .planner
            .create_plan(&objective, &self.config.repo_root, ModelTier::Mid)
            .await?
        {
            PlanOutcome::Approved { plan, .. } => {
                task.set_estimated_files(plan.files_to_modify.clone());
                let handoff = task.handoff.get_or_insert_with(Default::default);
                handoff.decisions.push(plan.render());
                task.mark_complete();
                self.state.update_task(task).await?;
                Ok(WorkerOutcome::Complete {
                    branch: None,
                    files_modified: Vec::new(),
                })
            }
            PlanOutcome::AlreadyComplete { reason } => {
                task.triage_issues.push(format!("already complete: {}", reason));
                task.mark_complete();
                self.state.update_task(task).await?;
                Ok(WorkerOutcome::AlreadyComplete { reason })
            }
            PlanOutcome::NeedsDecomposition { subtasks } => {
                let checkpoint = Checkpoint::new(&task.id, ModelTier::Mid);
                self.finish_decomposed(task, checkpoint, subtasks).await
            }
            PlanOutcome::Blocked { open_questions } => {
                task.block(format!("open questions: {}", open_questions.join("; ")));
                self.state.update_task(task).await?;
                Ok(WorkerOutcome::Blocked { open_questions })
            }
            PlanOutcome::Rejected { reason } => {
                task.mark_failed();
                self.state.update_task(task).await?;
                Ok(WorkerOutcome::Failed {
                    category: ErrorCategory::Planning,
                    message: reason,
                })
            }
        }
    }

    /// Run a pure local-tool objective without any LLM
    async fn run_local_tool(&self, mut task: Task, command: &str) -> eyre::Result<WorkerOutcome> {
        info!(task_id = %task.id, %command, "Running local tool");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.config.repo_root)
            .output()
            .await?;

        if output.status.success() {
            task.mark_complete();
            self.state.update_task(task).await?;
            Ok(WorkerOutcome::Complete {
                branch: None,
                files_modified: Vec::new(),
            })
        } else {
            let message = format!(
                "local tool `{}` failed: {}",
                command,
                String::from_utf8_lossy(&output.stderr)
            );
            task.mark_failed();
            self.state.update_task(task).await?;
            Ok(WorkerOutcome::Failed {
                category: ErrorCategory::ToolError,
                message,
            })
        }
    }

    /// Starting tier from the router, adjusted by historical success
    async fn starting_tier(&self, assessment: &Assessment, task: &Task) -> ModelTier {
        let recommended = self.router.determine_starting_model(assessment, &task.objective);

        let mut stats = SuccessStats::default();
        if let Ok(attempts) = self.state.list_attempts(None).await {
            for attempt in attempts {
                // Level is re-derived from the attempt's own task when
                // available; the current level is a reasonable proxy
                stats.record(attempt.tier, assessment.level, attempt.success);
            }
        }

        self.router
            .adjust_model_from_metrics(recommended, assessment.level, &stats, self.config.metrics_min_samples)
    }

    async fn prepare_branch(&self, task_id: &str) -> Option<String> {
        if !self.config.create_branch {
            return None;
        }
        let branch = format!("undercity/{}", task_id);
        match crate::merge::create_branch(&self.config.repo_root, &branch).await {
            Ok(()) => Some(branch),
            Err(e) => {
                warn!(error = %e, "Branch creation failed, working on the current branch");
                None
            }
        }
    }

    async fn build_brief(
        &self,
        task: &Task,
        assessment: &Assessment,
        plan: Option<&str>,
        feedback: Option<&str>,
    ) -> eyre::Result<AgentBrief> {
        let suggested_files = if task.estimated_files.is_empty() {
            self.files
                .suggest_files(&task.objective, 8)
                .await
                .map(|files| files.into_iter().map(|(f, _)| f).collect())
                .unwrap_or_default()
        } else {
            task.estimated_files.clone()
        };

        let keywords = crate::domain::extract_keywords(&task.objective);
        let learnings = self
            .knowledge
            .compact_for_prompt(&keywords, 6)
            .await
            .ok()
            .filter(|s| !s.is_empty());

        let prompt = self.renderer.briefing(&BriefingContext {
            objective: task.objective.clone(),
            plan: plan.map(String::from),
            suggested_files,
            learnings,
            feedback: feedback.map(String::from),
        })?;

        let tier = match assessment.level {
            crate::assess::ComplexityLevel::Critical => ModelTier::Top,
            _ => ModelTier::Mid,
        };

        Ok(AgentBrief {
            task_id: task.id.clone(),
            prompt,
            working_dir: self.config.repo_root.clone(),
            model: self.llm_config.model_id(tier),
            timeout_ms: self.config.agent_timeout_ms,
        })
    }

    async fn finish_complete(
        &self,
        mut task: Task,
        mut checkpoint: Checkpoint,
        branch: Option<String>,
        files_modified: Vec<String>,
    ) -> eyre::Result<WorkerOutcome> {
        checkpoint.advance(WorkerPhase::Complete);
        self.state.upsert_checkpoint(checkpoint).await?;

        task.mark_complete();
        self.state.update_task(task.clone()).await?;
        self.state.delete_checkpoint(&task.id).await?;

        self.files
            .record_task_outcome(&task.objective, &files_modified, true)
            .await
            .unwrap_or_else(|e| debug!(error = %e, "Pattern store update failed"));

        info!(task_id = %task.id, files = files_modified.len(), "Task complete");
        Ok(WorkerOutcome::Complete { branch, files_modified })
    }

    async fn finish_already_complete(
        &self,
        mut task: Task,
        mut checkpoint: Checkpoint,
        reason: String,
    ) -> eyre::Result<WorkerOutcome> {
        checkpoint.advance(WorkerPhase::Complete);
        self.state.upsert_checkpoint(checkpoint).await?;

        task.triage_issues.push(format!("already complete: {}", reason));
        task.mark_complete();
        self.state.update_task(task.clone()).await?;
        self.state.delete_checkpoint(&task.id).await?;

        info!(task_id = %task.id, %reason, "Task already complete");
        Ok(WorkerOutcome::AlreadyComplete { reason })
    }

    async fn finish_decomposed(
        &self,
        mut task: Task,
        checkpoint: Checkpoint,
        subtasks: Vec<String>,
    ) -> eyre::Result<WorkerOutcome> {
        let mut ids = Vec::new();
        for objective in &subtasks {
            let child = Task::new(objective).with_parent(&task.id).with_priority(task.priority);
            let id = self.state.create_task(child).await?;
            task.add_subtask(&id);
            ids.push(id);
        }

        task.block("decomposed into subtasks");
        self.state.update_task(task.clone()).await?;
        self.state.delete_checkpoint(&checkpoint.id).await?;

        info!(task_id = %task.id, count = ids.len(), "Task decomposed");
        Ok(WorkerOutcome::Decomposed { subtasks: ids })
    }
}

/// Agent events only feed logging here; the TUI consumer attaches its own
/// receiver in supervised runs
fn drain_events(mut rx: mpsc::Receiver<AgentEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Partial { text } => debug!(len = text.len(), "agent partial"),
                AgentEvent::ToolCall { name, .. } => debug!(%name, "agent tool call"),
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, VerifyConfig};
    use crate::learn::DecisionTracker;
    use crate::llm::agent::mock::MockAgent;
    use crate::llm::client::mock::MockLlmClient;
    use crate::llm::{AgentError, AgentOutcome, TokenUsage};
    use crate::ratelimit::{RateLimitTracker, UsageGuardConfig};
    use crate::state::test_support::temp_state;
    use crate::assess::RouterConfig;
    use crate::domain::TaskStatus;

    fn verifier_ok() -> Verifier {
        Verifier::new(VerifyConfig {
            typecheck_command: Some("true".to_string()),
            test_command: Some("true".to_string()),
            timeout_ms: 10_000,
        })
    }

    fn worker_with(
        state: &StateManager,
        agent: MockAgent,
        llm_responses: Vec<CompletionResponse>,
        verifier: Verifier,
        config: WorkerConfig,
    ) -> Worker {
        let guard = Arc::new(UsageGuard::new(
            Arc::new(RateLimitTracker::new(RateLimitConfig::default())),
            UsageGuardConfig::default(),
        ));
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(llm_responses));
        let planner = Planner::new(
            llm.clone(),
            LlmConfig::default(),
            guard.clone(),
            KnowledgeBase::new(state.clone()),
            FilePatternStore::new(state.clone()),
            DecisionTracker::new(state.clone()),
            ModelTier::Top,
        );

        Worker::new(
            state.clone(),
            Arc::new(agent),
            llm,
            LlmConfig::default(),
            guard,
            planner,
            verifier,
            ComplexityAssessor::new(),
            ModelRouter::new(RouterConfig::default()),
            config,
        )
    }

    fn simple_config(dir: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            review: false,
            create_branch: false,
            retry_base_delay_ms: 1,
            repo_root: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn ok_outcome(files: &[&str]) -> Result<AgentOutcome, AgentError> {
        Ok(AgentOutcome {
            success: true,
            files_modified: files.iter().map(|s| s.to_string()).collect(),
            message: "done".to_string(),
            usage: TokenUsage::new(1000, 100),
        })
    }

    #[tokio::test]
    async fn test_simple_task_completes_first_attempt() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        state.create_task(Task::with_id("t1", "fix the login bug")).await.unwrap();
        let worker = worker_with(
            &state,
            MockAgent::new(vec![ok_outcome(&["src/auth.rs"])]),
            vec![],
            verifier_ok(),
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        match outcome {
            WorkerOutcome::Complete { files_modified, branch } => {
                assert_eq!(files_modified, vec!["src/auth.rs"]);
                assert!(branch.is_none());
            }
            other => panic!("expected complete, got {:?}", other),
        }

        let task = state.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.completed_at.is_some());

        // Checkpoint cleaned up, attempt recorded as success
        assert!(state.get_checkpoint("t1").await.unwrap().is_none());
        let attempts = state.list_attempts(Some("t1")).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].input_tokens, 1000);

        // Usage flowed into the tracker
        assert_eq!(worker.guard.tracker().snapshot().total_calls, 1);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_verification_failure_retries_with_feedback() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        // First verification run fails, second passes
        let marker = dir.path().join("verified-once");
        let test_command = format!(
            "test -f {m} || {{ touch {m}; echo '1 tests failed'; exit 1; }}",
            m = marker.display()
        );
        let verifier = Verifier::new(VerifyConfig {
            typecheck_command: None,
            test_command: Some(test_command),
            timeout_ms: 10_000,
        });

        state.create_task(Task::with_id("t1", "fix the login bug")).await.unwrap();
        let worker = worker_with(
            &state,
            MockAgent::new(vec![ok_outcome(&["src/auth.rs"]), ok_outcome(&["src/auth.rs"])]),
            vec![],
            verifier,
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Complete { .. }));

        let attempts = state.list_attempts(Some("t1")).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].error_category, Some(ErrorCategory::Test));
        assert!(attempts[1].success);

        // The failure fed the error pattern store
        let patterns = state.list_error_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_op_detection_marks_already_complete() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        state.create_task(Task::with_id("t1", "fix the login bug")).await.unwrap();
        let worker = worker_with(
            &state,
            MockAgent::new(vec![ok_outcome(&[]), ok_outcome(&[]), ok_outcome(&[])]),
            vec![],
            verifier_ok(),
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        match outcome {
            WorkerOutcome::AlreadyComplete { reason } => {
                assert!(reason.contains("no changes"));
            }
            other => panic!("expected already-complete, got {:?}", other),
        }

        let task = state.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.no_op_edits, 3);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_escalates_and_exhausts_to_permanent_failure() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        state.create_task(Task::with_id("t1", "fix the login bug")).await.unwrap();
        let crashes: Vec<Result<AgentOutcome, AgentError>> =
            (0..4).map(|_| Err(AgentError::Crashed { code: Some(1) })).collect();

        let worker = worker_with(
            &state,
            MockAgent::new(crashes),
            vec![],
            verifier_ok(),
            WorkerConfig {
                max_attempts: 4,
                max_retries_per_tier: 1,
                ..simple_config(dir.path())
            },
        );

        let outcome = worker.run("t1").await.unwrap();
        match outcome {
            WorkerOutcome::Failed { category, .. } => {
                assert_eq!(category, ErrorCategory::MaxAttempts);
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let task = state.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        // Escalation happened: later attempts ran on a higher tier
        let attempts = state.list_attempts(Some("t1")).await.unwrap();
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts[0].tier, ModelTier::Mid);
        assert_eq!(attempts.last().unwrap().tier, ModelTier::Top);

        // Permanent failure recorded once, with the full journey
        let failures = state.list_permanent_failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt_count, 4);
        assert_eq!(failures[0].category, ErrorCategory::Crash);
        assert_eq!(failures[0].detailed_errors.len(), 4);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_local_tool_objective_skips_agent() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        state.create_task(Task::with_id("t1", "run format")).await.unwrap();

        // The assessor maps "run format" to `pnpm format`, which is not
        // installed here; stub it via PATH
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("pnpm"), "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(bin.join("pnpm"), std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        // Prepend to PATH for the child process via an sh wrapper task
        unsafe {
            std::env::set_var("PATH", format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default()));
        }

        let worker = worker_with(
            &state,
            MockAgent::new(vec![]),
            vec![],
            verifier_ok(),
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Complete { .. }));

        // No attempts, no agent involvement
        assert!(state.list_attempts(Some("t1")).await.unwrap().is_empty());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_tag_plans_without_executing() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("auth.rs"), "fn login() {}").unwrap();

        state
            .create_task(Task::with_id("t1", "[plan] rework the login flow"))
            .await
            .unwrap();

        let plan_json = serde_json::json!({
            "objective": "rework the login flow",
            "files_to_modify": ["auth.rs"],
            "steps": ["split login into request and verify"],
            "expected_outcome": "two-phase login"
        });
        let llm_responses = vec![
            CompletionResponse {
                tool_calls: vec![crate::llm::ToolCall {
                    id: "c1".to_string(),
                    name: "submit_plan".to_string(),
                    input: plan_json,
                }],
                ..Default::default()
            },
            CompletionResponse {
                tool_calls: vec![crate::llm::ToolCall {
                    id: "c2".to_string(),
                    name: "submit_review".to_string(),
                    input: serde_json::json!({"approved": true}),
                }],
                ..Default::default()
            },
        ];

        let worker = worker_with(
            &state,
            MockAgent::new(vec![]),
            llm_responses,
            verifier_ok(),
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Complete { .. }));

        // The plan is recorded; no agent attempt ran
        let task = state.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.estimated_files, vec!["auth.rs"]);
        assert!(task.handoff.unwrap().decisions[0].contains("split login"));
        assert!(state.list_attempts(Some("t1")).await.unwrap().is_empty());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_tier() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        state.create_task(Task::with_id("t1", "fix the login bug")).await.unwrap();

        // A previous session got as far as executing on the top tier
        let mut checkpoint = Checkpoint::new("t1", ModelTier::Top);
        checkpoint.advance(WorkerPhase::Executing);
        state.upsert_checkpoint(checkpoint).await.unwrap();

        let worker = worker_with(
            &state,
            MockAgent::new(vec![ok_outcome(&["src/auth.rs"])]),
            vec![],
            verifier_ok(),
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Complete { .. }));

        let attempts = state.list_attempts(Some("t1")).await.unwrap();
        assert_eq!(attempts[0].tier, ModelTier::Top);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cannot_start_terminal_task() {
        let (_temp, state) = temp_state();
        let dir = tempfile::tempdir().unwrap();

        let mut task = Task::with_id("t1", "done already");
        task.mark_started();
        task.mark_complete();
        state.create_task(task).await.unwrap();

        let worker = worker_with(
            &state,
            MockAgent::new(vec![]),
            vec![],
            verifier_ok(),
            simple_config(dir.path()),
        );

        let outcome = worker.run("t1").await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed { category: ErrorCategory::ValidationError, .. }));

        state.shutdown().await.unwrap();
    }
}
