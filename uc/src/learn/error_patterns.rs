//! Error->fix pattern store and the permanent-failure log
//!
//! Failures are canonicalised into stable signatures so the same error
//! seen across tasks accumulates occurrence counts and fix suggestions.
//! Human guidance attached to a signature is surfaced into the next
//! attempt's feedback.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;
use understore::{IndexValue, Record, now_ms};

use crate::domain::{ErrorCategory, ModelTier, generate_id};
use crate::state::{StateManager, StateResult};

/// Normalise an error message and hash it into a stable signature
///
/// Numbers, hex runs, and paths vary between occurrences of the same
/// underlying failure, so they are collapsed before hashing.
pub fn error_signature(message: &str) -> String {
    let mut normalised = String::with_capacity(message.len());
    for token in message.to_lowercase().split_whitespace() {
        if !normalised.is_empty() {
            normalised.push(' ');
        }
        if token.contains('/') || token.contains('\\') {
            normalised.push_str("<path>");
        } else if token.chars().all(|c| c.is_ascii_hexdigit()) && token.len() >= 6 {
            normalised.push_str("<hex>");
        } else {
            // Collapse digit runs so counts and line numbers do not split
            // otherwise-identical failures
            let mut in_digits = false;
            for c in token.chars() {
                if c.is_ascii_digit() {
                    if !in_digits {
                        normalised.push('#');
                        in_digits = true;
                    }
                } else {
                    normalised.push(c);
                    in_digits = false;
                }
            }
        }
    }

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    normalised.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// A fix that was tried against an error pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub description: String,
    /// Optional patch text
    pub patch: Option<String>,
    pub files_changed: Vec<String>,
    pub success_count: u64,
    pub failure_count: u64,
}

impl Fix {
    pub fn new(description: impl Into<String>, files_changed: Vec<String>) -> Self {
        Self {
            description: description.into(),
            patch: None,
            files_changed,
            success_count: 0,
            failure_count: 0,
        }
    }

    /// Success ratio; fixes with no outcomes rank lowest
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// Canonicalised failure signature with its fixes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    /// The signature is the record ID
    pub id: String,
    pub category: ErrorCategory,
    /// A representative raw message
    pub sample_message: String,
    pub occurrences: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub fixes: Vec<Fix>,
    /// Guidance a human attached to this signature
    pub human_guidance: Option<String>,
    pub updated_at: i64,
}

impl ErrorPattern {
    pub fn new(category: ErrorCategory, message: &str) -> Self {
        let now = now_ms();
        Self {
            id: error_signature(message),
            category,
            sample_message: message.to_string(),
            occurrences: 1,
            first_seen: now,
            last_seen: now,
            fixes: Vec::new(),
            human_guidance: None,
            updated_at: now,
        }
    }

    pub fn record_occurrence(&mut self) {
        self.occurrences += 1;
        self.last_seen = now_ms();
        self.updated_at = now_ms();
    }
}

impl Record for ErrorPattern {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "error_patterns"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("category".to_string(), IndexValue::String(self.category.to_string()));
        fields
    }
}

/// Captured when a task exhausts all retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub id: String,
    pub signature: String,
    pub category: ErrorCategory,
    pub sample_message: String,
    pub task_objective: String,
    pub last_tier: ModelTier,
    pub attempt_count: u32,
    pub files_attempted: Vec<String>,
    pub detailed_errors: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PermanentFailure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        category: ErrorCategory,
        message: &str,
        task_objective: &str,
        last_tier: ModelTier,
        attempt_count: u32,
        files_attempted: Vec<String>,
        detailed_errors: Vec<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("permfail", task_objective),
            signature: error_signature(message),
            category,
            sample_message: message.to_string(),
            task_objective: task_objective.to_string(),
            last_tier,
            attempt_count,
            files_attempted,
            detailed_errors,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for PermanentFailure {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "permanent_failures"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("category".to_string(), IndexValue::String(self.category.to_string()));
        fields.insert("signature".to_string(), IndexValue::String(self.signature.clone()));
        fields
    }
}

/// Facade over the error pattern and permanent-failure collections
pub struct ErrorPatternStore {
    state: StateManager,
}

impl ErrorPatternStore {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Record a failure, creating or bumping its pattern
    pub async fn record_failure(&self, category: ErrorCategory, message: &str) -> StateResult<String> {
        let signature = error_signature(message);
        match self.state.get_error_pattern(&signature).await? {
            Some(mut pattern) => {
                pattern.record_occurrence();
                self.state.upsert_error_pattern(pattern).await?;
            }
            None => {
                self.state.upsert_error_pattern(ErrorPattern::new(category, message)).await?;
            }
        }
        debug!(%signature, %category, "Recorded failure");
        Ok(signature)
    }

    /// Attach a fix to an existing pattern
    pub async fn add_fix(&self, signature: &str, fix: Fix) -> StateResult<()> {
        if let Some(mut pattern) = self.state.get_error_pattern(signature).await? {
            pattern.fixes.push(fix);
            pattern.updated_at = now_ms();
            self.state.upsert_error_pattern(pattern).await?;
        }
        Ok(())
    }

    /// Record whether a fix (by index) worked
    pub async fn record_fix_outcome(&self, signature: &str, fix_index: usize, success: bool) -> StateResult<()> {
        if let Some(mut pattern) = self.state.get_error_pattern(signature).await?
            && let Some(fix) = pattern.fixes.get_mut(fix_index)
        {
            if success {
                fix.success_count += 1;
            } else {
                fix.failure_count += 1;
            }
            pattern.updated_at = now_ms();
            self.state.upsert_error_pattern(pattern).await?;
        }
        Ok(())
    }

    /// Fixes for an error message, best success rate first
    pub async fn find_fixes(&self, message: &str) -> StateResult<Vec<Fix>> {
        let signature = error_signature(message);
        let Some(pattern) = self.state.get_error_pattern(&signature).await? else {
            return Ok(Vec::new());
        };

        let mut fixes = pattern.fixes;
        fixes.sort_by(|a, b| {
            b.success_rate()
                .partial_cmp(&a.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(fixes)
    }

    /// Human guidance attached to an error message's signature
    pub async fn human_guidance(&self, message: &str) -> StateResult<Option<String>> {
        let signature = error_signature(message);
        Ok(self
            .state
            .get_error_pattern(&signature)
            .await?
            .and_then(|p| p.human_guidance))
    }

    /// Attach human guidance to a signature
    pub async fn set_human_guidance(&self, signature: &str, guidance: &str) -> StateResult<()> {
        if let Some(mut pattern) = self.state.get_error_pattern(signature).await? {
            pattern.human_guidance = Some(guidance.to_string());
            pattern.updated_at = now_ms();
            self.state.upsert_error_pattern(pattern).await?;
        }
        Ok(())
    }

    /// Record a task that exhausted all retries
    pub async fn record_permanent_failure(&self, failure: PermanentFailure) -> StateResult<()> {
        self.state.create_permanent_failure(failure).await
    }
}
