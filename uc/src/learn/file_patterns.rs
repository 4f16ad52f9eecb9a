//! Task->file pattern store
//!
//! Two pattern families feed file prediction: keyword->file correlations
//! (which files tasks mentioning a keyword ended up touching) and
//! co-modification counts (which files change together). Both update on
//! task completion and feed the planner's pre-context and the merge
//! queue's conflict hints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use understore::{IndexValue, Record, now_ms};

use crate::domain::extract_keywords;
use crate::state::{StateManager, StateResult};

/// Keyword -> file counts, plus task success ratio for the keyword
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordCorrelation {
    /// The keyword is the record ID
    pub id: String,
    pub files: HashMap<String, u64>,
    pub task_attempts: u64,
    pub task_successes: u64,
    pub updated_at: i64,
}

impl KeywordCorrelation {
    pub fn new(keyword: &str) -> Self {
        Self {
            id: keyword.to_string(),
            files: HashMap::new(),
            task_attempts: 0,
            task_successes: 0,
            updated_at: now_ms(),
        }
    }

    pub fn success_ratio(&self) -> f64 {
        if self.task_attempts == 0 {
            return 0.0;
        }
        self.task_successes as f64 / self.task_attempts as f64
    }
}

impl Record for KeywordCorrelation {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "task_file_records"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        HashMap::new()
    }
}

/// File -> co-modified file counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoModification {
    /// The file path is the record ID
    pub id: String,
    pub partners: HashMap<String, u64>,
    pub updated_at: i64,
}

impl CoModification {
    pub fn new(file: &str) -> Self {
        Self {
            id: file.to_string(),
            partners: HashMap::new(),
            updated_at: now_ms(),
        }
    }
}

impl Record for CoModification {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "co_modifications"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        HashMap::new()
    }
}

/// Facade over the pattern collections
pub struct FilePatternStore {
    state: StateManager,
}

impl FilePatternStore {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Record a finished task: keyword correlations always, file counts
    /// and co-modifications only on success
    pub async fn record_task_outcome(&self, objective: &str, files: &[String], success: bool) -> StateResult<()> {
        for keyword in extract_keywords(objective) {
            let mut correlation = self
                .state
                .get_keyword_correlation(&keyword)
                .await?
                .unwrap_or_else(|| KeywordCorrelation::new(&keyword));

            correlation.task_attempts += 1;
            if success {
                correlation.task_successes += 1;
                for file in files {
                    *correlation.files.entry(file.clone()).or_insert(0) += 1;
                }
            }
            correlation.updated_at = now_ms();
            self.state.upsert_keyword_correlation(correlation).await?;
        }

        if success && files.len() > 1 {
            self.record_co_modifications(files).await?;
        }
        Ok(())
    }

    /// Bump pairwise co-modification counts for a set of files
    pub async fn record_co_modifications(&self, files: &[String]) -> StateResult<()> {
        for file in files {
            let mut record = self
                .state
                .get_co_modification(file)
                .await?
                .unwrap_or_else(|| CoModification::new(file));

            for partner in files {
                if partner != file {
                    *record.partners.entry(partner.clone()).or_insert(0) += 1;
                }
            }
            record.updated_at = now_ms();
            self.state.upsert_co_modification(record).await?;
        }
        Ok(())
    }

    /// Files past tasks with these keywords touched, highest count first
    pub async fn suggest_files(&self, objective: &str, limit: usize) -> StateResult<Vec<(String, u64)>> {
        let mut counts: HashMap<String, u64> = HashMap::new();

        for keyword in extract_keywords(objective) {
            if let Some(correlation) = self.state.get_keyword_correlation(&keyword).await? {
                for (file, count) in correlation.files {
                    *counts.entry(file).or_insert(0) += count;
                }
            }
        }

        let mut suggestions: Vec<(String, u64)> = counts.into_iter().collect();
        suggestions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        suggestions.truncate(limit);
        Ok(suggestions)
    }

    /// Files that historically change together with this one
    pub async fn co_modified_with(&self, file: &str, limit: usize) -> StateResult<Vec<(String, u64)>> {
        let Some(record) = self.state.get_co_modification(file).await? else {
            return Ok(Vec::new());
        };

        let mut partners: Vec<(String, u64)> = record.partners.into_iter().collect();
        partners.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        partners.truncate(limit);
        Ok(partners)
    }

    /// Success ratio for tasks mentioning a keyword
    pub async fn keyword_success_ratio(&self, keyword: &str) -> StateResult<Option<f64>> {
        Ok(self
            .state
            .get_keyword_correlation(keyword)
            .await?
            .map(|c| c.success_ratio()))
    }
}
