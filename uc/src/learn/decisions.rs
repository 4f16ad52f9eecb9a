//! Decision tracker
//!
//! Questions raised during planning and execution are classified by who
//! may answer them. Auto-handleable questions resolve inline, PM-decidable
//! ones go to the automated PM, and human-required questions stay open and
//! block execution. Human overrides are appended immutably.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use understore::{Filter, IndexValue, Record, now_ms};

use crate::domain::{extract_keywords, generate_id};
use crate::state::{StateManager, StateResult};

/// Who may answer a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCategory {
    /// The system may answer it and continue
    AutoHandle,
    /// The automated PM applies policy (and optionally an LLM)
    PmDecidable,
    /// Never auto-resolved; blocks execution
    HumanRequired,
}

impl std::fmt::Display for DecisionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AutoHandle => "auto_handle",
            Self::PmDecidable => "pm_decidable",
            Self::HumanRequired => "human_required",
        };
        write!(f, "{}", s)
    }
}

/// Decision lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    #[default]
    Pending,
    Resolved,
}

/// Who produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolver {
    Auto,
    Pm,
    Human,
}

/// A recorded resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: Resolver,
    pub decision: String,
    pub reasoning: Option<String>,
    pub confidence: Option<f64>,
    /// Filled in later when the outcome is known
    pub outcome: Option<String>,
    pub resolved_at: i64,
}

/// An immutable human override entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanOverride {
    pub decision: String,
    pub reasoning: Option<String>,
    pub overridden_at: i64,
}

/// A question raised during planning or execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub id: String,
    pub question: String,
    pub context: String,
    pub category: DecisionCategory,
    pub status: DecisionStatus,
    pub resolution: Option<Resolution>,
    /// Appended immutably; never rewritten
    pub overrides: Vec<HumanOverride>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DecisionPoint {
    pub fn new(question: &str, context: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("decision", question),
            question: question.to_string(),
            context: context.to_string(),
            category: classify_decision(question, context),
            status: DecisionStatus::Pending,
            resolution: None,
            overrides: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for DecisionPoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "decisions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("category".to_string(), IndexValue::String(self.category.to_string()));
        let status = match self.status {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Resolved => "resolved",
        };
        fields.insert("status".to_string(), IndexValue::String(status.to_string()));
        fields
    }
}

const HUMAN_KEYWORDS: &[&str] = &[
    "delete",
    "remove",
    "drop",
    "production",
    "database",
    "irreversible",
    "payment",
    "credential",
    "secret",
    "billing",
    "destroy",
];

const AUTO_KEYWORDS: &[&str] = &["retry", "retrying", "continue", "proceed", "rerun", "wait"];

const PM_KEYWORDS: &[&str] = &["option", "approach", "alternative", "choose", "which", "prefer", "tradeoff"];

/// Classify a question by keyword patterns over question + context
///
/// Human-required wins over everything; otherwise auto beats PM beats the
/// PM fallback for anything that looks like an open choice.
pub fn classify_decision(question: &str, context: &str) -> DecisionCategory {
    let text = format!("{} {}", question, context).to_lowercase();

    if HUMAN_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return DecisionCategory::HumanRequired;
    }
    if AUTO_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return DecisionCategory::AutoHandle;
    }
    if PM_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return DecisionCategory::PmDecidable;
    }

    DecisionCategory::PmDecidable
}

/// Resolved decisions retained; older ones are pruned
pub const RESOLVED_DECISION_CAP: usize = 500;

/// The decision tracker facade
pub struct DecisionTracker {
    state: StateManager,
}

impl DecisionTracker {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Raise a new decision point
    pub async fn raise(&self, question: &str, context: &str) -> StateResult<DecisionPoint> {
        let decision = DecisionPoint::new(question, context);
        self.state.upsert_decision(decision.clone()).await?;
        debug!(id = %decision.id, category = %decision.category, "Raised decision");
        Ok(decision)
    }

    /// Resolve a pending decision
    ///
    /// Human-required decisions only accept human resolutions; the
    /// invariant that they are never auto-resolved lives here.
    pub async fn resolve(&self, id: &str, resolution: Resolution) -> StateResult<bool> {
        let Some(mut decision) = self.state.get_decision(id).await? else {
            return Ok(false);
        };

        if decision.category == DecisionCategory::HumanRequired && resolution.resolved_by != Resolver::Human {
            debug!(%id, "Refusing non-human resolution for human-required decision");
            return Ok(false);
        }

        decision.status = DecisionStatus::Resolved;
        decision.resolution = Some(resolution);
        decision.updated_at = now_ms();
        self.state.upsert_decision(decision).await?;

        self.prune_resolved().await?;
        Ok(true)
    }

    /// Append a human override (immutably) to a decision
    pub async fn record_human_override(&self, id: &str, decision_text: &str, reasoning: Option<String>) -> StateResult<bool> {
        let Some(mut decision) = self.state.get_decision(id).await? else {
            return Ok(false);
        };

        decision.overrides.push(HumanOverride {
            decision: decision_text.to_string(),
            reasoning,
            overridden_at: now_ms(),
        });
        decision.updated_at = now_ms();
        self.state.upsert_decision(decision).await?;
        Ok(true)
    }

    /// Find a resolved decision whose question matches this one
    ///
    /// Matching is keyword overlap over the question text; the most recent
    /// match wins.
    pub async fn find_matching(&self, question: &str) -> StateResult<Option<DecisionPoint>> {
        let keywords = extract_keywords(question);
        if keywords.is_empty() {
            return Ok(None);
        }

        let resolved = self
            .state
            .list_decisions(&[Filter::eq("status", "resolved")])
            .await?;

        let mut best: Option<(usize, DecisionPoint)> = None;
        for decision in resolved {
            let decision_keywords = extract_keywords(&decision.question);
            let overlap = decision_keywords.iter().filter(|k| keywords.contains(k)).count();
            // At least half of the question's keywords must match
            if overlap * 2 >= keywords.len()
                && best.as_ref().map(|(b, _)| overlap > *b).unwrap_or(true)
            {
                best = Some((overlap, decision));
            }
        }

        Ok(best.map(|(_, d)| d))
    }

    /// List pending decisions
    pub async fn pending(&self) -> StateResult<Vec<DecisionPoint>> {
        self.state.list_decisions(&[Filter::eq("status", "pending")]).await
    }

    /// Drop the oldest resolved decisions beyond the cap
    async fn prune_resolved(&self) -> StateResult<()> {
        let mut resolved = self
            .state
            .list_decisions(&[Filter::eq("status", "resolved")])
            .await?;
        if resolved.len() <= RESOLVED_DECISION_CAP {
            return Ok(());
        }

        // Oldest resolution first
        resolved.sort_by_key(|d| d.resolution.as_ref().map(|r| r.resolved_at).unwrap_or(d.updated_at));
        let excess = resolved.len() - RESOLVED_DECISION_CAP;
        for decision in resolved.into_iter().take(excess) {
            self.state.delete_decision(&decision.id).await?;
        }
        debug!(excess, "Pruned resolved decisions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::temp_state;

    #[test]
    fn test_classify_auto_handle() {
        assert_eq!(classify_decision("Should I retry?", "retrying now"), DecisionCategory::AutoHandle);
    }

    #[test]
    fn test_classify_human_required() {
        assert_eq!(
            classify_decision("Should I delete?", "remove production database"),
            DecisionCategory::HumanRequired
        );
    }

    #[test]
    fn test_classify_pm_decidable() {
        assert_eq!(
            classify_decision("Which approach?", "option A or option B"),
            DecisionCategory::PmDecidable
        );
    }

    #[test]
    fn test_classify_human_wins_over_auto() {
        // "retry" is auto but "production" forces human
        assert_eq!(
            classify_decision("Retry the deploy?", "this touches production"),
            DecisionCategory::HumanRequired
        );
    }

    #[tokio::test]
    async fn test_raise_and_resolve() {
        let (_temp, state) = temp_state();
        let tracker = DecisionTracker::new(state.clone());

        let decision = tracker.raise("Which approach?", "option A or option B").await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Pending);

        let resolved = tracker
            .resolve(
                &decision.id,
                Resolution {
                    resolved_by: Resolver::Pm,
                    decision: "option A".to_string(),
                    reasoning: Some("smaller blast radius".to_string()),
                    confidence: Some(0.8),
                    outcome: None,
                    resolved_at: now_ms(),
                },
            )
            .await
            .unwrap();
        assert!(resolved);

        let stored = state.get_decision(&decision.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DecisionStatus::Resolved);
        assert_eq!(stored.resolution.unwrap().decision, "option A");

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_human_required_never_auto_resolved() {
        let (_temp, state) = temp_state();
        let tracker = DecisionTracker::new(state.clone());

        let decision = tracker
            .raise("Drop the old table?", "the production database still references it")
            .await
            .unwrap();
        assert_eq!(decision.category, DecisionCategory::HumanRequired);

        for resolver in [Resolver::Auto, Resolver::Pm] {
            let resolved = tracker
                .resolve(
                    &decision.id,
                    Resolution {
                        resolved_by: resolver,
                        decision: "yes".to_string(),
                        reasoning: None,
                        confidence: None,
                        outcome: None,
                        resolved_at: now_ms(),
                    },
                )
                .await
                .unwrap();
            assert!(!resolved);
        }

        // A human may resolve it
        let resolved = tracker
            .resolve(
                &decision.id,
                Resolution {
                    resolved_by: Resolver::Human,
                    decision: "keep the table".to_string(),
                    reasoning: None,
                    confidence: None,
                    outcome: None,
                    resolved_at: now_ms(),
                },
            )
            .await
            .unwrap();
        assert!(resolved);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_human_overrides_append() {
        let (_temp, state) = temp_state();
        let tracker = DecisionTracker::new(state.clone());

        let decision = tracker.raise("Which approach?", "option A or B").await.unwrap();
        tracker
            .record_human_override(&decision.id, "actually use B", Some("A breaks the cache".to_string()))
            .await
            .unwrap();
        tracker
            .record_human_override(&decision.id, "B with a feature flag", None)
            .await
            .unwrap();

        let stored = state.get_decision(&decision.id).await.unwrap().unwrap();
        assert_eq!(stored.overrides.len(), 2);
        assert_eq!(stored.overrides[0].decision, "actually use B");

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_matching_resolved_decision() {
        let (_temp, state) = temp_state();
        let tracker = DecisionTracker::new(state.clone());

        let decision = tracker
            .raise("Which serializer should the exporter use?", "json or yaml")
            .await
            .unwrap();
        tracker
            .resolve(
                &decision.id,
                Resolution {
                    resolved_by: Resolver::Pm,
                    decision: "json".to_string(),
                    reasoning: None,
                    confidence: None,
                    outcome: None,
                    resolved_at: now_ms(),
                },
            )
            .await
            .unwrap();

        let found = tracker
            .find_matching("Which serializer should the importer use?")
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().resolution.unwrap().decision, "json");

        let none = tracker.find_matching("Completely unrelated topic").await.unwrap();
        assert!(none.is_none());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolved_cap_prunes_oldest() {
        let (_temp, state) = temp_state();
        let tracker = DecisionTracker::new(state.clone());

        // Insert cap + 1 resolved decisions with distinct timestamps
        let mut first_id = None;
        for i in 0..=RESOLVED_DECISION_CAP {
            let mut decision = DecisionPoint::new(&format!("question number {}", i), "context");
            decision.status = DecisionStatus::Resolved;
            decision.resolution = Some(Resolution {
                resolved_by: Resolver::Auto,
                decision: "ok".to_string(),
                reasoning: None,
                confidence: None,
                outcome: None,
                resolved_at: i as i64,
            });
            if i == 0 {
                first_id = Some(decision.id.clone());
            }
            state.upsert_decision(decision).await.unwrap();
        }

        // Trigger the prune through a resolve
        let extra = tracker.raise("one more question to keep", "context").await.unwrap();
        tracker
            .resolve(
                &extra.id,
                Resolution {
                    resolved_by: Resolver::Auto,
                    decision: "ok".to_string(),
                    reasoning: None,
                    confidence: None,
                    outcome: None,
                    resolved_at: now_ms(),
                },
            )
            .await
            .unwrap();

        let resolved = state
            .list_decisions(&[Filter::eq("status", "resolved")])
            .await
            .unwrap();
        assert_eq!(resolved.len(), RESOLVED_DECISION_CAP);

        // The oldest one is gone
        let oldest = state.get_decision(&first_id.unwrap()).await.unwrap();
        assert!(oldest.is_none());

        state.shutdown().await.unwrap();
    }
}
