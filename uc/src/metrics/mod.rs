//! Live metrics and reporting
//!
//! `live-metrics.json` is the one metrics surface external tools read; it
//! is rewritten atomically after every change worth reporting. The report
//! builders here also back the `limits`, `postmortem`, `insights`,
//! `patterns`, and `effectiveness` commands.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use understore::{now_ms, write_json_atomic};

use crate::domain::ModelTier;
use crate::ratelimit::{RateLimitTracker, UsageWindow};
use crate::state::{BoardMetrics, StateManager, StateResult};

/// Snapshot written to `live-metrics.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveMetrics {
    #[serde(rename = "updated-at")]
    pub updated_at: i64,
    #[serde(rename = "batch-id")]
    pub batch_id: Option<String>,
    pub tasks: BoardSnapshot,
    /// Usage fraction per window name
    pub usage: HashMap<String, f64>,
    #[serde(rename = "total-calls")]
    pub total_calls: u64,
    #[serde(rename = "total-cost-usd")]
    pub total_cost_usd: f64,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSnapshot {
    pub pending: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub complete: u64,
    pub failed: u64,
}

impl From<BoardMetrics> for BoardSnapshot {
    fn from(metrics: BoardMetrics) -> Self {
        Self {
            pending: metrics.pending,
            in_progress: metrics.in_progress,
            blocked: metrics.blocked,
            complete: metrics.complete,
            failed: metrics.failed,
        }
    }
}

/// Writes the live metrics side-file
pub struct MetricsWriter {
    path: PathBuf,
    state: StateManager,
    tracker: Arc<RateLimitTracker>,
}

impl MetricsWriter {
    pub fn new(path: impl Into<PathBuf>, state: StateManager, tracker: Arc<RateLimitTracker>) -> Self {
        Self {
            path: path.into(),
            state,
            tracker,
        }
    }

    /// Gather and atomically write the current snapshot
    pub async fn write(&self, batch_id: Option<&str>) -> StateResult<LiveMetrics> {
        let board = self.state.board_metrics().await?;
        let attempts = self.state.list_attempts(None).await?;
        let total_cost_usd = attempts.iter().map(|a| a.cost_usd).sum();

        let mut usage = HashMap::new();
        for window in UsageWindow::ALL {
            usage.insert(window.name().to_string(), self.tracker.get_usage_percentage(window));
        }

        let metrics = LiveMetrics {
            updated_at: now_ms(),
            batch_id: batch_id.map(String::from),
            tasks: board.into(),
            usage,
            total_calls: self.tracker.snapshot().total_calls,
            total_cost_usd,
            paused: self.tracker.is_paused(),
        };

        if let Err(e) = write_json_atomic(&self.path, &metrics) {
            debug!(error = %e, "Live metrics write failed");
        }
        Ok(metrics)
    }
}

/// Usage snapshot for the `limits` command
pub fn format_limits(tracker: &RateLimitTracker) -> String {
    let snapshot = tracker.snapshot();
    let mut out = String::new();

    for window in UsageWindow::ALL {
        let pct = tracker.get_usage_percentage(window) * 100.0;
        out.push_str(&format!("{:>3} window: {:>5.1}% of budget\n", window.name(), pct));
    }
    out.push_str(&format!(
        "totals: {} calls, {} input tokens, {} output tokens\n",
        snapshot.total_calls, snapshot.total_input_tokens, snapshot.total_output_tokens
    ));

    if tracker.is_paused() {
        out.push_str(&format!("PAUSED: resumes in {}\n", tracker.format_remaining_time()));
    }
    if !snapshot.hits.is_empty() {
        out.push_str(&format!("rate-limit hits: {}\n", snapshot.hits.len()));
    }
    out
}

/// One row of the `postmortem` report
#[derive(Debug, Serialize)]
pub struct PostmortemEntry {
    pub objective: String,
    pub category: String,
    pub attempts: u32,
    pub last_tier: String,
    pub sample_message: String,
}

/// Permanent failures, most recent first
pub async fn postmortem(state: &StateManager) -> StateResult<Vec<PostmortemEntry>> {
    let mut failures = state.list_permanent_failures().await?;
    failures.sort_by_key(|f| std::cmp::Reverse(f.created_at));

    Ok(failures
        .into_iter()
        .map(|f| PostmortemEntry {
            objective: f.task_objective,
            category: f.category.to_string(),
            attempts: f.attempt_count,
            last_tier: f.last_tier.to_string(),
            sample_message: f.sample_message,
        })
        .collect())
}

/// One row of the `insights` report
#[derive(Debug, Serialize)]
pub struct InsightEntry {
    pub category: String,
    pub content: String,
    pub confidence: f64,
    pub used: u64,
    pub created_at: i64,
}

/// Learnings, optionally filtered to those created since a timestamp,
/// highest confidence first
pub async fn insights(state: &StateManager, since: Option<i64>, last: Option<usize>) -> StateResult<Vec<InsightEntry>> {
    let mut learnings = state.list_learnings(None).await?;
    if let Some(since) = since {
        learnings.retain(|l| l.created_at >= since);
    }
    learnings.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(last) = last {
        learnings.truncate(last);
    }

    Ok(learnings
        .into_iter()
        .map(|l| InsightEntry {
            category: l.category.to_string(),
            content: l.content,
            confidence: l.confidence,
            used: l.used_count,
            created_at: l.created_at,
        })
        .collect())
}

/// One row of the `patterns` report
#[derive(Debug, Serialize)]
pub struct PatternEntry {
    pub signature: String,
    pub category: String,
    pub occurrences: u64,
    pub fixes: usize,
    pub sample_message: String,
}

/// Error patterns by occurrence count
pub async fn patterns(state: &StateManager) -> StateResult<Vec<PatternEntry>> {
    let mut patterns = state.list_error_patterns().await?;
    patterns.sort_by_key(|p| std::cmp::Reverse(p.occurrences));

    Ok(patterns
        .into_iter()
        .map(|p| PatternEntry {
            signature: p.id,
            category: p.category.to_string(),
            occurrences: p.occurrences,
            fixes: p.fixes.len(),
            sample_message: p.sample_message,
        })
        .collect())
}

/// One row of the `effectiveness` report
#[derive(Debug, Serialize)]
pub struct EffectivenessEntry {
    pub tier: String,
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub total_cost_usd: f64,
}

/// Per-tier attempt success rates - the same data that feeds
/// `adjust_model_from_metrics`
pub async fn effectiveness(state: &StateManager) -> StateResult<Vec<EffectivenessEntry>> {
    let attempts = state.list_attempts(None).await?;

    let mut by_tier: HashMap<ModelTier, (u64, u64, f64)> = HashMap::new();
    for attempt in attempts {
        let entry = by_tier.entry(attempt.tier).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if attempt.success {
            entry.1 += 1;
        }
        entry.2 += attempt.cost_usd;
    }

    let mut rows: Vec<EffectivenessEntry> = by_tier
        .into_iter()
        .map(|(tier, (attempts, successes, cost))| EffectivenessEntry {
            tier: tier.to_string(),
            attempts,
            successes,
            success_rate: if attempts > 0 { successes as f64 / attempts as f64 } else { 0.0 },
            total_cost_usd: cost,
        })
        .collect();
    rows.sort_by(|a, b| a.tier.cmp(&b.tier));
    Ok(rows)
}

/// Past advice for an `oracle` query: matching learnings plus fixes for
/// similar errors
pub async fn oracle(state: &StateManager, situation: &str) -> StateResult<Vec<String>> {
    let keywords = crate::domain::extract_keywords(situation);
    let mut advice = Vec::new();

    for learning in state.list_learnings(None).await? {
        if learning.keyword_overlap(&keywords) > 0 {
            advice.push(format!("[{}] {}", learning.category, learning.content));
        }
    }

    for pattern in state.list_error_patterns().await? {
        let pattern_keywords = crate::domain::extract_keywords(&pattern.sample_message);
        if pattern_keywords.iter().any(|k| keywords.contains(k)) {
            for fix in pattern.fixes.iter().filter(|f| f.success_count > 0) {
                advice.push(format!("[fix] {}", fix.description));
            }
        }
    }

    Ok(advice)
}
