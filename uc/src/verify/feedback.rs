//! Feedback enrichment
//!
//! The next attempt's prompt is the verifier output plus whatever the
//! learning stores know about this failure: fix suggestions, human
//! guidance, co-modification hints, and keyword-matched learnings.
//! Enrichment is best-effort - any sub-failure is swallowed and the base
//! feedback still flows.

use tracing::debug;

use crate::learn::{ErrorPatternStore, FilePatternStore, KnowledgeBase};

/// Builds enriched feedback prompts for retry attempts
pub struct FeedbackEnricher {
    errors: ErrorPatternStore,
    knowledge: KnowledgeBase,
    files: FilePatternStore,
}

impl FeedbackEnricher {
    pub fn new(errors: ErrorPatternStore, knowledge: KnowledgeBase, files: FilePatternStore) -> Self {
        Self {
            errors,
            knowledge,
            files,
        }
    }

    /// Enrich base verifier feedback for the next attempt
    pub async fn enrich(
        &self,
        objective: &str,
        base_feedback: &str,
        error_message: &str,
        touched_files: &[String],
    ) -> String {
        let mut sections = vec![base_feedback.to_string()];

        match self.errors.find_fixes(error_message).await {
            Ok(fixes) if !fixes.is_empty() => {
                let mut section = String::from("Fixes that worked for this error before:\n");
                for fix in fixes.iter().take(3) {
                    section.push_str(&format!(
                        "- {} (success rate {:.0}%)\n",
                        fix.description,
                        fix.success_rate() * 100.0
                    ));
                }
                sections.push(section);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Fix lookup failed, continuing without"),
        }

        match self.errors.human_guidance(error_message).await {
            Ok(Some(guidance)) => {
                sections.push(format!("Human guidance for this error:\n{}", guidance));
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Guidance lookup failed, continuing without"),
        }

        for file in touched_files.iter().take(5) {
            match self.files.co_modified_with(file, 3).await {
                Ok(partners) if !partners.is_empty() => {
                    let names: Vec<&str> = partners.iter().map(|(f, _)| f.as_str()).collect();
                    sections.push(format!(
                        "{} usually changes together with: {}",
                        file,
                        names.join(", ")
                    ));
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Co-modification lookup failed, continuing without"),
            }
        }

        let keywords = crate::domain::extract_keywords(objective);
        match self.knowledge.compact_for_prompt(&keywords, 5).await {
            Ok(compact) if !compact.is_empty() => {
                sections.push(format!("Relevant learnings:\n{}", compact));
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Learning lookup failed, continuing without"),
        }

        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorCategory;
    use crate::learn::{Fix, LearningCategory};
    use crate::state::test_support::temp_state;

    #[tokio::test]
    async fn test_enrich_with_everything() {
        let (_temp, state) = temp_state();
        let errors = ErrorPatternStore::new(state.clone());
        let knowledge = KnowledgeBase::new(state.clone());
        let files = FilePatternStore::new(state.clone());

        let message = "cannot find module 'left-pad'";
        let signature = errors.record_failure(ErrorCategory::Build, message).await.unwrap();
        errors
            .add_fix(&signature, Fix::new("add the dependency to package.json", vec![]))
            .await
            .unwrap();
        errors.record_fix_outcome(&signature, 0, true).await.unwrap();
        errors
            .set_human_guidance(&signature, "check the workspace root lockfile")
            .await
            .unwrap();

        files
            .record_co_modifications(&["src/api.rs".to_string(), "src/types.rs".to_string()])
            .await
            .unwrap();

        knowledge
            .add_learning(
                LearningCategory::Gotcha,
                "The module resolver caches lookups",
                vec!["module".to_string()],
            )
            .await
            .unwrap();

        let enricher = FeedbackEnricher::new(errors, knowledge, files);
        let enriched = enricher
            .enrich(
                "fix the module loading",
                "Build failed: cannot find module",
                message,
                &["src/api.rs".to_string()],
            )
            .await;

        assert!(enriched.starts_with("Build failed"));
        assert!(enriched.contains("add the dependency to package.json"));
        assert!(enriched.contains("check the workspace root lockfile"));
        assert!(enriched.contains("src/types.rs"));
        assert!(enriched.contains("module resolver caches"));

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enrich_with_empty_stores_returns_base() {
        let (_temp, state) = temp_state();
        let enricher = FeedbackEnricher::new(
            ErrorPatternStore::new(state.clone()),
            KnowledgeBase::new(state.clone()),
            FilePatternStore::new(state.clone()),
        );

        let enriched = enricher
            .enrich("fix it", "Tests failed: assertion", "assertion failed", &[])
            .await;
        assert_eq!(enriched, "Tests failed: assertion");

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enrich_survives_closed_state() {
        let (_temp, state) = temp_state();
        let enricher = FeedbackEnricher::new(
            ErrorPatternStore::new(state.clone()),
            KnowledgeBase::new(state.clone()),
            FilePatternStore::new(state.clone()),
        );

        // Kill the actor; every lookup will fail
        state.shutdown().await.unwrap();
        tokio::task::yield_now().await;

        let enriched = enricher.enrich("fix it", "base feedback", "some error", &[]).await;
        assert_eq!(enriched, "base feedback");
    }
}
