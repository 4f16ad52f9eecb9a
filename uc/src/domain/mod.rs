//! Domain types for the task board

mod attempt;
mod category;
mod id;
mod task;
mod tier;

pub use attempt::AttemptRecord;
pub use category::ErrorCategory;
pub use id::{generate_id, slugify};
pub use task::{HandoffContext, LastAttempt, Task, TaskStatus, TaskTag};
pub use tier::ModelTier;

/// Extract lowercase keywords from free-form text
///
/// Shared by the learning stores and the complexity assessor. Tokens are
/// lowercased alphanumeric runs of three or more characters, minus a small
/// stopword list.
pub fn extract_keywords(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "has", "have", "had", "not", "all",
        "its", "it's", "can", "will", "should", "would", "into", "out", "when", "then", "than", "them", "they",
    ];

    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();

    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
    {
        if STOPWORDS.contains(&token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            keywords.push(token.to_string());
        }
    }

    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keywords_basic() {
        let kws = extract_keywords("Fix the OAuth login flow");
        assert_eq!(kws, vec!["fix", "oauth", "login", "flow"]);
    }

    #[test]
    fn test_extract_keywords_dedupes() {
        let kws = extract_keywords("test test testing");
        assert_eq!(kws, vec!["test", "testing"]);
    }

    #[test]
    fn test_extract_keywords_drops_stopwords_and_short() {
        let kws = extract_keywords("do it for the db");
        assert!(kws.is_empty());
    }
}
