//! Legacy side-file migration
//!
//! Earlier versions kept the learning stores in JSON side-files:
//! `knowledge.json`, `decisions.json`, `task-file-patterns.json`, and
//! `error-fix-patterns.json`. On first run against a fresh database,
//! anything readable from those files is imported; the files themselves
//! stay in place for external readers.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};
use understore::read_json_opt;

use crate::config::StateDir;
use crate::domain::ErrorCategory;
use crate::learn::{CoModification, DecisionPoint, ErrorPattern, Fix, KeywordCorrelation, Learning, LearningCategory};

use super::manager::StateManager;
use super::messages::StateResult;

#[derive(Debug, Deserialize)]
struct LegacyLearning {
    content: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyKnowledge {
    #[serde(default)]
    learnings: Vec<LegacyLearning>,
}

#[derive(Debug, Deserialize)]
struct LegacyDecisions {
    #[serde(default)]
    decisions: Vec<LegacyDecision>,
}

#[derive(Debug, Deserialize)]
struct LegacyDecision {
    question: String,
    #[serde(default)]
    context: String,
}

#[derive(Debug, Deserialize)]
struct LegacyFilePatterns {
    /// keyword -> correlation
    #[serde(default)]
    keywords: HashMap<String, LegacyKeywordCorrelation>,
    /// file -> co-modified file -> count
    #[serde(default)]
    co_modifications: HashMap<String, HashMap<String, u64>>,
}

#[derive(Debug, Deserialize)]
struct LegacyKeywordCorrelation {
    #[serde(default)]
    files: HashMap<String, u64>,
    #[serde(default)]
    attempts: u64,
    #[serde(default)]
    successes: u64,
}

#[derive(Debug, Deserialize)]
struct LegacyErrorPatterns {
    #[serde(default)]
    patterns: Vec<LegacyErrorPattern>,
}

#[derive(Debug, Deserialize)]
struct LegacyErrorPattern {
    message: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    occurrences: Option<u64>,
    #[serde(default)]
    fixes: Vec<LegacyFix>,
}

#[derive(Debug, Deserialize)]
struct LegacyFix {
    description: String,
    #[serde(default)]
    files_changed: Vec<String>,
    #[serde(default)]
    success_count: u64,
    #[serde(default)]
    failure_count: u64,
}

/// Import legacy JSON side-files into a fresh database
///
/// Only runs against a database with no learnings and no error patterns,
/// so it is a no-op on every run after the first.
pub async fn migrate_legacy(state_dir: &StateDir, state: &StateManager) -> StateResult<usize> {
    let fresh =
        state.list_learnings(None).await?.is_empty() && state.list_error_patterns().await?.is_empty();
    if !fresh {
        return Ok(0);
    }

    let mut imported = 0;

    if let Some(knowledge) = read_json_opt::<LegacyKnowledge>(state_dir.root().join("knowledge.json")) {
        for legacy in knowledge.learnings {
            let category = match legacy.category.as_deref() {
                Some("pattern") => LearningCategory::Pattern,
                Some("gotcha") => LearningCategory::Gotcha,
                Some("constraint") => LearningCategory::Constraint,
                Some("approach") => LearningCategory::Approach,
                _ => LearningCategory::Fact,
            };
            let learning = Learning::new(category, legacy.content, legacy.keywords);
            if let Err(e) = state.upsert_learning(learning).await {
                warn!(error = %e, "Skipping unmigratable learning");
                continue;
            }
            imported += 1;
        }
    }

    if let Some(legacy) = read_json_opt::<LegacyDecisions>(state_dir.root().join("decisions.json")) {
        for decision in legacy.decisions {
            let point = DecisionPoint::new(&decision.question, &decision.context);
            if let Err(e) = state.upsert_decision(point).await {
                warn!(error = %e, "Skipping unmigratable decision");
                continue;
            }
            imported += 1;
        }
    }

    if let Some(legacy) = read_json_opt::<LegacyFilePatterns>(state_dir.root().join("task-file-patterns.json")) {
        for (keyword, correlation) in legacy.keywords {
            let mut record = KeywordCorrelation::new(&keyword);
            record.files = correlation.files;
            record.task_attempts = correlation.attempts;
            record.task_successes = correlation.successes;
            if let Err(e) = state.upsert_keyword_correlation(record).await {
                warn!(error = %e, "Skipping unmigratable keyword correlation");
                continue;
            }
            imported += 1;
        }

        for (file, partners) in legacy.co_modifications {
            let mut record = CoModification::new(&file);
            record.partners = partners;
            if let Err(e) = state.upsert_co_modification(record).await {
                warn!(error = %e, "Skipping unmigratable co-modification record");
                continue;
            }
            imported += 1;
        }
    }

    if let Some(legacy) = read_json_opt::<LegacyErrorPatterns>(state_dir.root().join("error-fix-patterns.json")) {
        for legacy_pattern in legacy.patterns {
            let category = match legacy_pattern.category.as_deref() {
                Some("typecheck") => ErrorCategory::Typecheck,
                Some("test") => ErrorCategory::Test,
                Some("lint") => ErrorCategory::Lint,
                Some("build") => ErrorCategory::Build,
                Some("no_changes") => ErrorCategory::NoChanges,
                Some("planning") => ErrorCategory::Planning,
                Some("timeout") => ErrorCategory::Timeout,
                _ => ErrorCategory::Unknown,
            };

            let mut pattern = ErrorPattern::new(category, &legacy_pattern.message);
            pattern.occurrences = legacy_pattern.occurrences.unwrap_or(1).max(1);
            for legacy_fix in legacy_pattern.fixes {
                let mut fix = Fix::new(legacy_fix.description, legacy_fix.files_changed);
                fix.success_count = legacy_fix.success_count;
                fix.failure_count = legacy_fix.failure_count;
                pattern.fixes.push(fix);
            }

            if let Err(e) = state.upsert_error_pattern(pattern).await {
                warn!(error = %e, "Skipping unmigratable error pattern");
                continue;
            }
            imported += 1;
        }
    }

    if imported > 0 {
        info!(imported, "Migrated legacy side-files into the database");
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::error_signature;
    use crate::state::test_support::temp_state;
    use understore::write_json_atomic;

    #[tokio::test]
    async fn test_migrates_legacy_files_once() {
        let (temp, state) = temp_state();
        let state_dir = StateDir::new(temp.path());

        write_json_atomic(
            temp.path().join("knowledge.json"),
            &serde_json::json!({
                "learnings": [
                    { "content": "Use OAuth2 for auth", "keywords": ["oauth"], "category": "approach" },
                    { "content": "CI needs node 20", "keywords": ["node"] }
                ]
            }),
        )
        .unwrap();
        write_json_atomic(
            temp.path().join("decisions.json"),
            &serde_json::json!({
                "decisions": [ { "question": "Which db?", "context": "option A or B" } ]
            }),
        )
        .unwrap();
        write_json_atomic(
            temp.path().join("task-file-patterns.json"),
            &serde_json::json!({
                "keywords": {
                    "oauth": { "files": { "src/auth.rs": 4 }, "attempts": 5, "successes": 4 }
                },
                "co_modifications": {
                    "src/auth.rs": { "src/session.rs": 3 }
                }
            }),
        )
        .unwrap();
        write_json_atomic(
            temp.path().join("error-fix-patterns.json"),
            &serde_json::json!({
                "patterns": [
                    {
                        "message": "cannot find module 'left-pad'",
                        "category": "build",
                        "occurrences": 7,
                        "fixes": [
                            { "description": "add the dependency", "success_count": 3, "failure_count": 1 }
                        ]
                    }
                ]
            }),
        )
        .unwrap();

        // 2 learnings + 1 decision + 1 keyword + 1 co-modification + 1 pattern
        let imported = migrate_legacy(&state_dir, &state).await.unwrap();
        assert_eq!(imported, 6);

        let learnings = state.list_learnings(None).await.unwrap();
        assert_eq!(learnings.len(), 2);
        assert!(learnings.iter().any(|l| l.content.contains("OAuth2")));

        let correlation = state.get_keyword_correlation("oauth").await.unwrap().unwrap();
        assert_eq!(correlation.files.get("src/auth.rs"), Some(&4));
        assert_eq!(correlation.task_attempts, 5);
        assert!((correlation.success_ratio() - 0.8).abs() < 1e-9);

        let co_mod = state.get_co_modification("src/auth.rs").await.unwrap().unwrap();
        assert_eq!(co_mod.partners.get("src/session.rs"), Some(&3));

        let signature = error_signature("cannot find module 'left-pad'");
        let pattern = state.get_error_pattern(&signature).await.unwrap().unwrap();
        assert_eq!(pattern.category, ErrorCategory::Build);
        assert_eq!(pattern.occurrences, 7);
        assert_eq!(pattern.fixes.len(), 1);
        assert!((pattern.fixes[0].success_rate() - 0.75).abs() < 1e-9);

        // Second run is a no-op
        let imported = migrate_legacy(&state_dir, &state).await.unwrap();
        assert_eq!(imported, 0);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files_are_fine() {
        let (temp, state) = temp_state();
        let state_dir = StateDir::new(temp.path());

        std::fs::write(temp.path().join("knowledge.json"), "{broken").unwrap();
        std::fs::write(temp.path().join("task-file-patterns.json"), "also broken").unwrap();

        let imported = migrate_legacy(&state_dir, &state).await.unwrap();
        assert_eq!(imported, 0);

        state.shutdown().await.unwrap();
    }
}
