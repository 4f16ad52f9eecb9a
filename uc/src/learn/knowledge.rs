//! Knowledge base - categorised learnings with novelty scoring
//!
//! A learning's confidence rises on successful reuse (capped at 1.0) and
//! decays on failure (floored at 0.1). Near-duplicate content is rejected
//! at insertion time; similarity is a pluggable strategy so tests can pin
//! it down.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use understore::{IndexValue, Record, now_ms};

use crate::domain::generate_id;
use crate::state::{StateManager, StateResult};

/// Learning categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Pattern,
    Fact,
    Gotcha,
    Constraint,
    Approach,
}

impl std::fmt::Display for LearningCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pattern => "pattern",
            Self::Fact => "fact",
            Self::Gotcha => "gotcha",
            Self::Constraint => "constraint",
            Self::Approach => "approach",
        };
        write!(f, "{}", s)
    }
}

/// A reusable insight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub category: LearningCategory,
    pub content: String,
    pub keywords: Vec<String>,
    /// Optional structured payload
    pub payload: Option<serde_json::Value>,
    /// Confidence in [0.1, 1.0]
    pub confidence: f64,
    pub used_count: u64,
    pub success_count: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Learning {
    pub fn new(category: LearningCategory, content: impl Into<String>, keywords: Vec<String>) -> Self {
        let content = content.into();
        let now = now_ms();
        Self {
            id: generate_id("learning", &content),
            category,
            content,
            keywords,
            payload: None,
            confidence: 0.5,
            used_count: 0,
            success_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record one use; confidence rises on success, decays on failure
    pub fn record_use(&mut self, success: bool) {
        self.used_count += 1;
        if success {
            self.success_count += 1;
            self.confidence = (self.confidence + 0.1).min(1.0);
        } else {
            self.confidence = (self.confidence - 0.1).max(0.1);
        }
        self.updated_at = now_ms();
    }

    /// How many of the given keywords this learning matches
    pub fn keyword_overlap(&self, keywords: &[String]) -> usize {
        self.keywords.iter().filter(|k| keywords.contains(k)).count()
    }
}

impl Record for Learning {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "learnings"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("category".to_string(), IndexValue::String(self.category.to_string()));
        fields
    }
}

/// Content similarity strategy
///
/// The production default is token Jaccard; real semantic similarity can
/// be plugged in without touching the store.
pub trait Similarity: Send + Sync {
    /// Similarity in [0.0, 1.0]
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Jaccard similarity over lowercase alphanumeric tokens
#[derive(Debug, Default)]
pub struct TokenJaccard;

impl Similarity for TokenJaccard {
    fn score(&self, a: &str, b: &str) -> f64 {
        let tokens = |s: &str| -> HashSet<String> {
            s.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        };

        let set_a = tokens(a);
        let set_b = tokens(b);
        if set_a.is_empty() && set_b.is_empty() {
            return 1.0;
        }

        let intersection = set_a.intersection(&set_b).count() as f64;
        let union = set_a.union(&set_b).count() as f64;
        intersection / union
    }
}

/// Similarity at or above this rejects the insertion as a near-duplicate
pub const NOVELTY_REJECT_THRESHOLD: f64 = 0.85;

/// Result of an add_learning call
#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub added: bool,
    /// 1.0 means nothing similar exists; rounded to two decimals
    pub novelty_score: f64,
    pub id: Option<String>,
}

/// The knowledge base facade
pub struct KnowledgeBase {
    state: StateManager,
    similarity: Arc<dyn Similarity>,
}

impl KnowledgeBase {
    pub fn new(state: StateManager) -> Self {
        Self {
            state,
            similarity: Arc::new(TokenJaccard),
        }
    }

    pub fn with_similarity(state: StateManager, similarity: Arc<dyn Similarity>) -> Self {
        Self { state, similarity }
    }

    /// Add a learning unless a near-duplicate already exists
    pub async fn add_learning(
        &self,
        category: LearningCategory,
        content: &str,
        keywords: Vec<String>,
    ) -> StateResult<AddOutcome> {
        let existing = self.state.list_learnings(None).await?;
        let max_similarity = existing
            .iter()
            .map(|l| self.similarity.score(&l.content, content))
            .fold(0.0_f64, f64::max);

        let novelty_score = ((1.0 - max_similarity) * 100.0).round() / 100.0;

        if max_similarity >= NOVELTY_REJECT_THRESHOLD {
            debug!(novelty_score, "Rejected near-duplicate learning");
            return Ok(AddOutcome {
                added: false,
                novelty_score,
                id: None,
            });
        }

        let learning = Learning::new(category, content, keywords);
        let id = learning.id.clone();
        self.state.upsert_learning(learning).await?;

        Ok(AddOutcome {
            added: true,
            novelty_score,
            id: Some(id),
        })
    }

    /// Feed a usage outcome back into a learning's confidence
    pub async fn record_feedback(&self, id: &str, success: bool) -> StateResult<()> {
        let learnings = self.state.list_learnings(None).await?;
        if let Some(mut learning) = learnings.into_iter().find(|l| l.id == id) {
            learning.record_use(success);
            self.state.upsert_learning(learning).await?;
        }
        Ok(())
    }

    /// Learnings matching any of the keywords, best first
    pub async fn find_relevant(&self, keywords: &[String], limit: usize) -> StateResult<Vec<Learning>> {
        let mut scored: Vec<(usize, Learning)> = self
            .state
            .list_learnings(None)
            .await?
            .into_iter()
            .filter_map(|l| {
                let overlap = l.keyword_overlap(keywords);
                (overlap > 0).then_some((overlap, l))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.confidence.partial_cmp(&a.1.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });

        Ok(scored.into_iter().take(limit).map(|(_, l)| l).collect())
    }

    /// Compact one-line-per-learning rendering for prompt injection
    pub async fn compact_for_prompt(&self, keywords: &[String], limit: usize) -> StateResult<String> {
        let relevant = self.find_relevant(keywords, limit).await?;
        Ok(relevant
            .iter()
            .map(|l| format!("- [{}] {} (confidence {:.1})", l.category, l.content, l.confidence))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::temp_state;

    #[test]
    fn test_confidence_bounds() {
        let mut learning = Learning::new(LearningCategory::Fact, "x", vec![]);
        for _ in 0..20 {
            learning.record_use(true);
        }
        assert_eq!(learning.confidence, 1.0);

        for _ in 0..20 {
            learning.record_use(false);
        }
        assert!((learning.confidence - 0.1).abs() < 1e-9);
        assert_eq!(learning.used_count, 40);
        assert_eq!(learning.success_count, 20);
    }

    #[test]
    fn test_token_jaccard() {
        let sim = TokenJaccard;
        assert_eq!(sim.score("use oauth for auth", "use oauth for auth"), 1.0);
        assert_eq!(sim.score("alpha beta", "gamma delta"), 0.0);

        // 4 shared of 5 total tokens
        let score = sim.score("Use OAuth2 for auth", "Use OAuth2 schemas for auth");
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_add_learning_novelty() {
        let (_temp, state) = temp_state();
        let kb = KnowledgeBase::new(state.clone());

        let outcome = kb
            .add_learning(
                LearningCategory::Approach,
                "Use OAuth2 for auth",
                vec!["oauth".to_string(), "auth".to_string()],
            )
            .await
            .unwrap();
        assert!(outcome.added);
        assert_eq!(outcome.novelty_score, 1.0);

        // Similar but under the rejection threshold: added with low novelty
        let outcome = kb
            .add_learning(
                LearningCategory::Approach,
                "Use OAuth2 schemas for auth",
                vec!["oauth".to_string(), "auth".to_string()],
            )
            .await
            .unwrap();
        assert!(outcome.novelty_score < 1.0);
        assert!(outcome.added);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_learning_rejects_duplicate() {
        let (_temp, state) = temp_state();
        let kb = KnowledgeBase::new(state.clone());

        kb.add_learning(LearningCategory::Fact, "The build needs node 20", vec![])
            .await
            .unwrap();

        let outcome = kb
            .add_learning(LearningCategory::Fact, "The build needs node 20", vec![])
            .await
            .unwrap();
        assert!(!outcome.added);
        assert_eq!(outcome.novelty_score, 0.0);
        assert!(outcome.id.is_none());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_relevant_orders_by_overlap() {
        let (_temp, state) = temp_state();
        let kb = KnowledgeBase::new(state.clone());

        kb.add_learning(
            LearningCategory::Gotcha,
            "The oauth callback must be registered",
            vec!["oauth".to_string(), "callback".to_string()],
        )
        .await
        .unwrap();
        kb.add_learning(
            LearningCategory::Fact,
            "Migrations run on deploy",
            vec!["migrations".to_string()],
        )
        .await
        .unwrap();

        let relevant = kb
            .find_relevant(&["oauth".to_string(), "callback".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(relevant.len(), 1);
        assert!(relevant[0].content.contains("oauth callback"));

        let none = kb.find_relevant(&["nothing".to_string()], 10).await.unwrap();
        assert!(none.is_empty());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_feedback_roundtrips() {
        let (_temp, state) = temp_state();
        let kb = KnowledgeBase::new(state.clone());

        let outcome = kb
            .add_learning(LearningCategory::Pattern, "Prefer upserts", vec!["db".to_string()])
            .await
            .unwrap();
        let id = outcome.id.unwrap();

        kb.record_feedback(&id, true).await.unwrap();

        let learnings = state.list_learnings(None).await.unwrap();
        let learning = learnings.iter().find(|l| l.id == id).unwrap();
        assert_eq!(learning.used_count, 1);
        assert!((learning.confidence - 0.6).abs() < 1e-9);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_compact_for_prompt_format() {
        let (_temp, state) = temp_state();
        let kb = KnowledgeBase::new(state.clone());

        kb.add_learning(
            LearningCategory::Constraint,
            "Never edit generated files",
            vec!["generated".to_string()],
        )
        .await
        .unwrap();

        let compact = kb.compact_for_prompt(&["generated".to_string()], 5).await.unwrap();
        assert!(compact.starts_with("- [constraint] Never edit generated files"));

        state.shutdown().await.unwrap();
    }
}
