//! Prompt templates
//!
//! All prompts are Handlebars templates rendered with typed contexts, so
//! a template rename or a missing field fails loudly at render time
//! instead of producing a silently broken prompt.

use handlebars::Handlebars;
use serde::Serialize;

const BRIEFING_TEMPLATE: &str = "\
You are executing one development task against this repository.

## Objective
{{objective}}

{{#if plan}}## Plan
{{plan}}

{{/if}}{{#if suggested_files}}## Files likely involved
{{#each suggested_files}}- {{this}}
{{/each}}
{{/if}}{{#if learnings}}## Learnings from previous work
{{learnings}}

{{/if}}{{#if feedback}}## Feedback from the previous attempt
{{feedback}}

{{/if}}Work only inside the working directory. Make the smallest change
that satisfies the objective, then stop.
";

const PLAN_TEMPLATE: &str = "\
Plan the following development task. Do not execute anything.

## Objective
{{objective}}

{{#if suggested_files}}## Files past similar tasks touched
{{#each suggested_files}}- {{this}}
{{/each}}
{{/if}}{{#if learnings}}## Relevant learnings
{{learnings}}

{{/if}}Produce a concrete plan: exact files to read, modify, and create,
ordered steps, risks, and the expected outcome. If the objective already
appears satisfied, say so. If it is too large for one task, propose
subtasks instead. List open questions you cannot answer from the
repository alone.

Call submit_plan exactly once with the full plan.
";

const PLAN_REVIEW_TEMPLATE: &str = "\
Review this execution plan before any code is touched.

## Objective
{{objective}}

## Plan
{{plan_json}}

{{#if validation_issues}}## Pre-validation findings
{{#each validation_issues}}- {{this}}
{{/each}}
{{/if}}Judge whether the plan is concrete, correctly scoped, and safe.
Vague steps, files that do not exist, or unbounded scope are grounds for
rejection. Call submit_review exactly once.
";

const EXECUTION_REVIEW_TEMPLATE: &str = "\
Review the result of an automated code change.

## Objective
{{objective}}

## Files modified
{{#each files_modified}}- {{this}}
{{/each}}

## Agent summary
{{summary}}

Verification already passed. Look for objective mismatches, incomplete
work, and changes outside the stated scope. Call submit_review exactly
once.
";

const META_TRIAGE_TEMPLATE: &str = "\
You are triaging a task board. Recommend mutations that improve it:
complete stale done-work, merge duplicates, block what cannot proceed,
and fix wrong statuses.

## Board
{{board_json}}

Call submit_recommendations exactly once with every recommendation.
";

/// Context for the agent briefing prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct BriefingContext {
    pub objective: String,
    pub plan: Option<String>,
    pub suggested_files: Vec<String>,
    pub learnings: Option<String>,
    pub feedback: Option<String>,
}

/// Context for the planner prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanContext {
    pub objective: String,
    pub suggested_files: Vec<String>,
    pub learnings: Option<String>,
}

/// Context for the plan review prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReviewContext {
    pub objective: String,
    pub plan_json: String,
    pub validation_issues: Vec<String>,
}

/// Context for the post-execution review prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReviewContext {
    pub objective: String,
    pub files_modified: Vec<String>,
    pub summary: String,
}

/// Context for the meta-triage prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetaTriageContext {
    pub board_json: String,
}

/// Renders the system's prompt templates
pub struct PromptRenderer {
    registry: Handlebars<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        // Templates are compile-time constants; registration cannot fail
        // unless a template itself is broken, which the tests catch
        for (name, template) in [
            ("briefing", BRIEFING_TEMPLATE),
            ("plan", PLAN_TEMPLATE),
            ("plan_review", PLAN_REVIEW_TEMPLATE),
            ("execution_review", EXECUTION_REVIEW_TEMPLATE),
            ("meta_triage", META_TRIAGE_TEMPLATE),
        ] {
            if let Err(e) = registry.register_template_string(name, template) {
                tracing::error!(name, error = %e, "Failed to register prompt template");
            }
        }

        Self { registry }
    }

    pub fn briefing(&self, context: &BriefingContext) -> eyre::Result<String> {
        Ok(self.registry.render("briefing", context)?)
    }

    pub fn plan(&self, context: &PlanContext) -> eyre::Result<String> {
        Ok(self.registry.render("plan", context)?)
    }

    pub fn plan_review(&self, context: &PlanReviewContext) -> eyre::Result<String> {
        Ok(self.registry.render("plan_review", context)?)
    }

    pub fn execution_review(&self, context: &ExecutionReviewContext) -> eyre::Result<String> {
        Ok(self.registry.render("execution_review", context)?)
    }

    pub fn meta_triage(&self, context: &MetaTriageContext) -> eyre::Result<String> {
        Ok(self.registry.render("meta_triage", context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_briefing_minimal() {
        let renderer = PromptRenderer::new();
        let prompt = renderer
            .briefing(&BriefingContext {
                objective: "Fix the login bug".to_string(),
                ..Default::default()
            })
            .unwrap();

        assert!(prompt.contains("Fix the login bug"));
        assert!(!prompt.contains("## Plan"));
        assert!(!prompt.contains("## Feedback"));
    }

    #[test]
    fn test_briefing_full() {
        let renderer = PromptRenderer::new();
        let prompt = renderer
            .briefing(&BriefingContext {
                objective: "Fix the login bug".to_string(),
                plan: Some("1. Edit auth.rs".to_string()),
                suggested_files: vec!["src/auth.rs".to_string()],
                learnings: Some("- [gotcha] sessions cache aggressively".to_string()),
                feedback: Some("Tests failed: session_test".to_string()),
            })
            .unwrap();

        assert!(prompt.contains("## Plan"));
        assert!(prompt.contains("src/auth.rs"));
        assert!(prompt.contains("sessions cache aggressively"));
        assert!(prompt.contains("## Feedback from the previous attempt"));
    }

    #[test]
    fn test_plan_and_review_render() {
        let renderer = PromptRenderer::new();

        let plan = renderer
            .plan(&PlanContext {
                objective: "Add rate limiting".to_string(),
                suggested_files: vec!["src/server.rs".to_string()],
                learnings: None,
            })
            .unwrap();
        assert!(plan.contains("submit_plan"));
        assert!(plan.contains("src/server.rs"));

        let review = renderer
            .plan_review(&PlanReviewContext {
                objective: "Add rate limiting".to_string(),
                plan_json: "{\"steps\":[]}".to_string(),
                validation_issues: vec!["file src/missing.rs does not exist".to_string()],
            })
            .unwrap();
        assert!(review.contains("submit_review"));
        assert!(review.contains("src/missing.rs"));
    }

    #[test]
    fn test_no_html_escaping() {
        let renderer = PromptRenderer::new();
        let prompt = renderer
            .briefing(&BriefingContext {
                objective: "Handle <Option<&str>> correctly".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(prompt.contains("<Option<&str>>"));
    }
}
