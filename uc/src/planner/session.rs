//! Planner - tiered plan creation with a higher-tier review loop
//!
//! A cheap planner drafts; a reviewer one tier above critiques; the loop
//! runs until approval or the iteration cap. Open questions resolve
//! inline through the decision tracker where possible - human-required
//! questions block execution.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use understore::now_ms;

use crate::config::LlmConfig;
use crate::domain::ModelTier;
use crate::learn::{DecisionCategory, DecisionTracker, FilePatternStore, KnowledgeBase, Resolution, Resolver};
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, Message, ToolDefinition};
use crate::prompts::{PlanContext, PlanReviewContext, PromptRenderer};
use crate::ratelimit::{GuardOutcome, UsageGuard};

use super::types::{ExecutionPlan, PlanOutcome, PlanReview, ResolvedQuestion};

/// Review loop cap
pub const MAX_PLAN_ITERATIONS: u32 = 3;

/// Step phrases that make a plan non-specific
const VAGUE_MARKERS: &[&str] = &["tbd", "explore", "figure out", "investigate later", "somehow", "etc."];

/// Plans naming more files than this are considered unbounded
const MAX_PLAN_FILES: usize = 25;

/// Tiered planner with review loop
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    llm_config: LlmConfig,
    guard: Arc<UsageGuard>,
    renderer: PromptRenderer,
    knowledge: KnowledgeBase,
    files: FilePatternStore,
    decisions: DecisionTracker,
    max_tier: ModelTier,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        llm_config: LlmConfig,
        guard: Arc<UsageGuard>,
        knowledge: KnowledgeBase,
        files: FilePatternStore,
        decisions: DecisionTracker,
        max_tier: ModelTier,
    ) -> Self {
        Self {
            llm,
            llm_config,
            guard,
            renderer: PromptRenderer::new(),
            knowledge,
            files,
            decisions,
            max_tier,
        }
    }

    /// Create and review a plan for an objective
    pub async fn create_plan(&self, objective: &str, dir: &Path, planner_tier: ModelTier) -> eyre::Result<PlanOutcome> {
        let context = self.gather_context(objective).await;
        let mut tier = planner_tier.min(self.max_tier);

        let mut plan = match self.request_plan(objective, &context, tier, None).await? {
            Some(plan) => plan,
            None => return Ok(PlanOutcome::Rejected { reason: "planner produced no plan".to_string() }),
        };

        // Already-complete detection short-circuits everything
        if let Some(already) = &plan.already_complete
            && already.likely
        {
            info!(%objective, "Planner judged the objective already complete");
            return Ok(PlanOutcome::AlreadyComplete {
                reason: already.reason.clone(),
            });
        }

        // Decomposition: escalate through tiers until a non-empty subtask
        // list is produced or the top tier has been tried
        if let Some(decomposition) = &plan.needs_decomposition
            && decomposition.needed
        {
            let mut subtasks = decomposition.subtasks.clone();
            let mut decompose_tier = tier;
            while subtasks.is_empty() {
                let Some(next) = decompose_tier.next().filter(|t| *t <= self.max_tier) else {
                    return Ok(PlanOutcome::Rejected {
                        reason: "decomposition needed but no subtasks produced at any tier".to_string(),
                    });
                };
                decompose_tier = next;
                debug!(tier = %decompose_tier, "Escalating for decomposition");
                if let Some(retry) = self.request_plan(objective, &context, decompose_tier, None).await? {
                    subtasks = retry
                        .needs_decomposition
                        .map(|d| d.subtasks)
                        .unwrap_or_default();
                }
            }
            return Ok(PlanOutcome::NeedsDecomposition { subtasks });
        }

        // Inline question resolution via the decision tracker
        let (resolved, open) = self.resolve_questions(&plan.open_questions).await?;
        if !open.is_empty() {
            info!(open = open.len(), "Human-required questions block execution");
            return Ok(PlanOutcome::Blocked { open_questions: open });
        }
        plan.resolved_decisions = resolved.clone();

        // Specificity validation, with a single tier escalation
        let mut issues = validate_specificity(&plan, dir);
        if !issues.is_empty()
            && let Some(next) = tier.next().filter(|t| *t <= self.max_tier)
        {
            debug!(?issues, tier = %next, "Plan not specific, escalating planner once");
            tier = next;
            if let Some(better) = self.request_plan(objective, &context, tier, Some(&issues)).await? {
                plan = better;
                plan.resolved_decisions = resolved.clone();
                issues = validate_specificity(&plan, dir);
            }
        }

        // Review loop: reviewer sits one tier above the planner
        let reviewer_tier = tier.next().unwrap_or(tier).min(self.max_tier);
        let mut empty_retries = 0;
        for iteration in 1..=MAX_PLAN_ITERATIONS {
            let review = match self.request_review(objective, &plan, &issues, reviewer_tier).await? {
                Some(review) => review,
                None if empty_retries == 0 => {
                    // Empty review response: retry once, then reject
                    warn!(iteration, "Empty review response, retrying once");
                    empty_retries += 1;
                    continue;
                }
                None => {
                    return Ok(PlanOutcome::Rejected {
                        reason: "reviewer returned an empty response twice".to_string(),
                    });
                }
            };

            if review.skip_execution {
                return Ok(PlanOutcome::AlreadyComplete {
                    reason: review
                        .issues
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "reviewer recommended skipping execution".to_string()),
                });
            }

            if review.approved {
                info!(iteration, "Plan approved");
                return Ok(PlanOutcome::Approved { plan, resolved });
            }

            // Actionable feedback: take the revision or re-plan against
            // the reviewer's issues
            if let Some(revised) = review.revised_plan {
                debug!(iteration, "Adopting reviewer's revised plan");
                plan = revised;
                plan.resolved_decisions = resolved.clone();
            } else if !review.issues.is_empty() {
                debug!(iteration, issues = review.issues.len(), "Re-planning against review issues");
                if let Some(better) = self.request_plan(objective, &context, tier, Some(&review.issues)).await? {
                    plan = better;
                    plan.resolved_decisions = resolved.clone();
                }
            } else {
                return Ok(PlanOutcome::Rejected {
                    reason: "reviewer rejected the plan without actionable feedback".to_string(),
                });
            }
            issues = validate_specificity(&plan, dir);
        }

        Ok(PlanOutcome::Rejected {
            reason: format!("no approval after {} review iterations", MAX_PLAN_ITERATIONS),
        })
    }

    /// Fast local pre-context: suggested files and compact learnings
    async fn gather_context(&self, objective: &str) -> PlanContext {
        let suggested_files = match self.files.suggest_files(objective, 10).await {
            Ok(files) => files.into_iter().map(|(f, _)| f).collect(),
            Err(e) => {
                debug!(error = %e, "File suggestion lookup failed");
                Vec::new()
            }
        };

        let keywords = crate::domain::extract_keywords(objective);
        let learnings = match self.knowledge.compact_for_prompt(&keywords, 8).await {
            Ok(compact) if !compact.is_empty() => Some(compact),
            _ => None,
        };

        PlanContext {
            objective: objective.to_string(),
            suggested_files,
            learnings,
        }
    }

    async fn guarded_complete(&self, tier: ModelTier, request: CompletionRequest) -> eyre::Result<CompletionResponse> {
        let outcome = self
            .guard
            .guard(tier, self.llm.complete(request), |r: &CompletionResponse| r.usage)
            .await?;

        match outcome {
            GuardOutcome::Executed(response) => Ok(response),
            GuardOutcome::RateLimited(error) => Err(error.into()),
            GuardOutcome::Blocked { reason, .. } => Err(eyre::eyre!("usage guard blocked planning: {}", reason)),
        }
    }

    async fn request_plan(
        &self,
        objective: &str,
        context: &PlanContext,
        tier: ModelTier,
        feedback: Option<&[String]>,
    ) -> eyre::Result<Option<ExecutionPlan>> {
        let mut prompt = self.renderer.plan(context)?;
        if let Some(feedback) = feedback {
            prompt.push_str("\n## Issues with the previous plan\n");
            for issue in feedback {
                prompt.push_str(&format!("- {}\n", issue));
            }
        }

        let request = CompletionRequest {
            model: self.llm_config.model_id(tier),
            system_prompt: "You are a careful software planner. Plans must be concrete and bounded.".to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![plan_tool()],
            max_tokens: self.llm_config.max_tokens,
        };

        let response = self.guarded_complete(tier, request).await?;
        let Some(input) = response.tool_input("submit_plan") else {
            // Fallback: some models answer with raw JSON content
            if let Some(content) = &response.content
                && let Ok(plan) = serde_json::from_str::<ExecutionPlan>(content)
            {
                return Ok(Some(plan));
            }
            return Ok(None);
        };

        match serde_json::from_value::<ExecutionPlan>(input.clone()) {
            Ok(mut plan) => {
                if plan.objective.is_empty() {
                    plan.objective = objective.to_string();
                }
                Ok(Some(plan))
            }
            Err(e) => {
                warn!(error = %e, "Plan tool input failed to parse");
                Ok(None)
            }
        }
    }

    async fn request_review(
        &self,
        objective: &str,
        plan: &ExecutionPlan,
        validation_issues: &[String],
        tier: ModelTier,
    ) -> eyre::Result<Option<PlanReview>> {
        let prompt = self.renderer.plan_review(&PlanReviewContext {
            objective: objective.to_string(),
            plan_json: serde_json::to_string_pretty(plan)?,
            validation_issues: validation_issues.to_vec(),
        })?;

        let request = CompletionRequest {
            model: self.llm_config.model_id(tier),
            system_prompt: "You are a skeptical plan reviewer. Approve only concrete, bounded, safe plans.".to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![review_tool()],
            max_tokens: self.llm_config.max_tokens,
        };

        let response = self.guarded_complete(tier, request).await?;
        if response.is_empty() {
            return Ok(None);
        }

        let Some(input) = response.tool_input("submit_review") else {
            return Ok(None);
        };
        match serde_json::from_value::<PlanReview>(input.clone()) {
            Ok(review) => Ok(Some(review)),
            Err(e) => {
                warn!(error = %e, "Review tool input failed to parse");
                Ok(None)
            }
        }
    }

    /// Resolve open questions; returns (resolved, still-open-human-required)
    async fn resolve_questions(&self, questions: &[String]) -> eyre::Result<(Vec<ResolvedQuestion>, Vec<String>)> {
        let mut resolved = Vec::new();
        let mut open = Vec::new();

        for question in questions {
            // Past resolutions first
            if let Some(past) = self.decisions.find_matching(question).await? {
                if let Some(resolution) = past.resolution {
                    resolved.push(ResolvedQuestion {
                        question: question.clone(),
                        decision: resolution.decision,
                        resolved_by: "history".to_string(),
                    });
                    continue;
                }
            }

            let decision = self.decisions.raise(question, "raised during planning").await?;
            match decision.category {
                DecisionCategory::AutoHandle => {
                    let text = "Proceed with the conservative default and continue.".to_string();
                    self.decisions
                        .resolve(
                            &decision.id,
                            Resolution {
                                resolved_by: Resolver::Auto,
                                decision: text.clone(),
                                reasoning: None,
                                confidence: Some(0.7),
                                outcome: None,
                                resolved_at: now_ms(),
                            },
                        )
                        .await?;
                    resolved.push(ResolvedQuestion {
                        question: question.clone(),
                        decision: text,
                        resolved_by: "auto".to_string(),
                    });
                }
                DecisionCategory::PmDecidable => {
                    // Automated PM policy: smallest change consistent with
                    // existing conventions wins
                    let text = "Follow the repository's existing convention; prefer the smaller change.".to_string();
                    self.decisions
                        .resolve(
                            &decision.id,
                            Resolution {
                                resolved_by: Resolver::Pm,
                                decision: text.clone(),
                                reasoning: Some("automated PM policy".to_string()),
                                confidence: Some(0.6),
                                outcome: None,
                                resolved_at: now_ms(),
                            },
                        )
                        .await?;
                    resolved.push(ResolvedQuestion {
                        question: question.clone(),
                        decision: text,
                        resolved_by: "pm".to_string(),
                    });
                }
                DecisionCategory::HumanRequired => {
                    open.push(question.clone());
                }
            }
        }

        Ok((resolved, open))
    }
}

/// A plan is specific iff steps are concrete, named files exist, and the
/// scope is bounded
pub fn validate_specificity(plan: &ExecutionPlan, dir: &Path) -> Vec<String> {
    let mut issues = Vec::new();

    if plan.steps.is_empty() {
        issues.push("plan has no steps".to_string());
    }
    for step in &plan.steps {
        let lower = step.to_lowercase();
        if VAGUE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            issues.push(format!("vague step: {}", step));
        }
    }

    for file in plan.existing_files() {
        if !dir.join(file).exists() {
            issues.push(format!("file does not exist: {}", file));
        }
    }

    let named = plan.files_to_read.len() + plan.files_to_modify.len() + plan.files_to_create.len();
    if named > MAX_PLAN_FILES {
        issues.push(format!("plan names {} files, scope looks unbounded", named));
    }

    issues
}

fn plan_tool() -> ToolDefinition {
    ToolDefinition::new(
        "submit_plan",
        "Submit the execution plan. Call exactly once.",
        json!({
            "type": "object",
            "properties": {
                "objective": { "type": "string" },
                "files_to_read": { "type": "array", "items": { "type": "string" } },
                "files_to_modify": { "type": "array", "items": { "type": "string" } },
                "files_to_create": { "type": "array", "items": { "type": "string" } },
                "steps": { "type": "array", "items": { "type": "string" } },
                "risks": { "type": "array", "items": { "type": "string" } },
                "expected_outcome": { "type": "string" },
                "already_complete": {
                    "type": "object",
                    "properties": {
                        "likely": { "type": "boolean" },
                        "reason": { "type": "string" }
                    }
                },
                "needs_decomposition": {
                    "type": "object",
                    "properties": {
                        "needed": { "type": "boolean" },
                        "subtasks": { "type": "array", "items": { "type": "string" } }
                    }
                },
                "open_questions": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["steps", "expected_outcome"]
        }),
    )
}

fn review_tool() -> ToolDefinition {
    ToolDefinition::new(
        "submit_review",
        "Submit the plan review verdict. Call exactly once.",
        json!({
            "type": "object",
            "properties": {
                "approved": { "type": "boolean" },
                "issues": { "type": "array", "items": { "type": "string" } },
                "suggestions": { "type": "array", "items": { "type": "string" } },
                "revised_plan": { "type": "object" },
                "skip_execution": { "type": "boolean" }
            },
            "required": ["approved"]
        }),
    )
}
