//! Plan and review types
//!
//! These are parsed from forced tool calls; unknown fields from the model
//! are dropped by serde rather than propagated.

use serde::{Deserialize, Serialize};

/// Signal that the objective already appears satisfied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlreadyComplete {
    pub likely: bool,
    pub reason: String,
}

/// Signal that the task is too large and should be split
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Decomposition {
    pub needed: bool,
    pub subtasks: Vec<String>,
}

/// A question the planner resolved inline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuestion {
    pub question: String,
    pub decision: String,
    pub resolved_by: String,
}

/// A structured execution plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPlan {
    pub objective: String,
    pub files_to_read: Vec<String>,
    pub files_to_modify: Vec<String>,
    pub files_to_create: Vec<String>,
    pub steps: Vec<String>,
    pub risks: Vec<String>,
    pub expected_outcome: String,
    pub already_complete: Option<AlreadyComplete>,
    pub needs_decomposition: Option<Decomposition>,
    pub open_questions: Vec<String>,
    pub resolved_decisions: Vec<ResolvedQuestion>,
}

impl ExecutionPlan {
    /// All files the plan names as existing inputs
    pub fn existing_files(&self) -> impl Iterator<Item = &String> {
        self.files_to_read.iter().chain(self.files_to_modify.iter())
    }

    /// Render for the briefing prompt
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.files_to_modify.is_empty() {
            out.push_str(&format!("Modify: {}\n", self.files_to_modify.join(", ")));
        }
        if !self.files_to_create.is_empty() {
            out.push_str(&format!("Create: {}\n", self.files_to_create.join(", ")));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", idx + 1, step));
        }
        if !self.expected_outcome.is_empty() {
            out.push_str(&format!("Expected outcome: {}\n", self.expected_outcome));
        }
        out
    }
}

/// Reviewer verdict over a plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanReview {
    pub approved: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub revised_plan: Option<ExecutionPlan>,
    pub skip_execution: bool,
}

/// Final outcome of the planning phase
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// Execute this plan
    Approved {
        plan: ExecutionPlan,
        resolved: Vec<ResolvedQuestion>,
    },
    /// Skip execution; the objective is already satisfied
    AlreadyComplete { reason: String },
    /// Split into these subtasks instead of executing
    NeedsDecomposition { subtasks: Vec<String> },
    /// Human-required questions remain open
    Blocked { open_questions: Vec<String> },
    /// Planning failed outright
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parses_from_model_json_dropping_unknowns() {
        let json = r#"{
            "objective": "add rate limiting",
            "files_to_modify": ["src/server.rs"],
            "steps": ["add the middleware", "wire the config"],
            "expected_outcome": "requests above the limit get 429",
            "confidence_vibes": "high"
        }"#;

        let plan: ExecutionPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.files_to_modify, vec!["src/server.rs"]);
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.already_complete.is_none());
    }

    #[test]
    fn test_plan_render() {
        let plan = ExecutionPlan {
            objective: "x".to_string(),
            files_to_modify: vec!["a.rs".to_string()],
            steps: vec!["edit a.rs".to_string()],
            expected_outcome: "it works".to_string(),
            ..Default::default()
        };

        let rendered = plan.render();
        assert!(rendered.contains("Modify: a.rs"));
        assert!(rendered.contains("1. edit a.rs"));
        assert!(rendered.contains("Expected outcome: it works"));
    }

    #[test]
    fn test_review_defaults() {
        let review: PlanReview = serde_json::from_str("{}").unwrap();
        assert!(!review.approved);
        assert!(!review.skip_execution);
        assert!(review.issues.is_empty());
    }
}
