//! Rate-limit state types
//!
//! The full state round-trips through `rate-limit-state.json` so external
//! tools (and the `limits` command in another process) can read it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A rolling usage window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    /// 5-hour window
    FiveHour,
    /// 7-day window
    Weekly,
}

impl UsageWindow {
    pub const ALL: [UsageWindow; 2] = [UsageWindow::FiveHour, UsageWindow::Weekly];

    /// Window length in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::FiveHour => 5 * 60 * 60 * 1000,
            Self::Weekly => 7 * 24 * 60 * 60 * 1000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FiveHour => "5h",
            Self::Weekly => "7d",
        }
    }
}

/// One recorded LLM call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Call timestamp (Unix milliseconds)
    pub timestamp: i64,
    /// Input tokens
    #[serde(rename = "input-tokens")]
    pub input_tokens: u64,
    /// Output tokens
    #[serde(rename = "output-tokens")]
    pub output_tokens: u64,
    /// Tier-weighted tokens for the single-dimensional budget
    #[serde(rename = "sonnet-equivalent")]
    pub sonnet_equivalent: f64,
}

/// An active pause (global or per-model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPause {
    pub reason: String,
    /// When work may resume (Unix milliseconds)
    #[serde(rename = "resume-at")]
    pub resume_at: i64,
}

/// A logged 429 hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHit {
    pub model: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(rename = "retry-after-ms")]
    pub retry_after_ms: Option<i64>,
}

/// Parsed `x-ratelimit-*` headers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaderInfo {
    pub retry_after_ms: Option<i64>,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset: Option<String>,
    pub window: Option<String>,
}

/// Full persisted rate-limit state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitState {
    /// Per-model rolling buffers; entries older than the window are
    /// dropped on read
    #[serde(rename = "per-model")]
    pub per_model: HashMap<String, Vec<UsageEntry>>,

    /// Lifetime totals
    #[serde(rename = "total-input-tokens")]
    pub total_input_tokens: u64,
    #[serde(rename = "total-output-tokens")]
    pub total_output_tokens: u64,
    #[serde(rename = "total-calls")]
    pub total_calls: u64,

    /// 429 hit log (bounded)
    pub hits: Vec<RateLimitHit>,

    /// Global pause, if any
    #[serde(rename = "global-pause")]
    pub global_pause: Option<ModelPause>,

    /// Per-model pauses
    #[serde(rename = "model-pauses")]
    pub model_pauses: HashMap<String, ModelPause>,
}

impl RateLimitState {
    /// Drop entries older than the weekly window (the longest we track)
    pub fn prune(&mut self, now: i64) {
        let cutoff = now - UsageWindow::Weekly.duration_ms();
        for entries in self.per_model.values_mut() {
            entries.retain(|e| e.timestamp >= cutoff);
        }
        self.per_model.retain(|_, entries| !entries.is_empty());
    }

    /// Sonnet-equivalent tokens used within a window, across all models
    pub fn window_usage(&self, window: UsageWindow, now: i64) -> f64 {
        let cutoff = now - window.duration_ms();
        self.per_model
            .values()
            .flatten()
            .filter(|e| e.timestamp >= cutoff)
            .map(|e| e.sonnet_equivalent)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_durations() {
        assert_eq!(UsageWindow::FiveHour.duration_ms(), 18_000_000);
        assert_eq!(UsageWindow::Weekly.duration_ms(), 604_800_000);
    }

    #[test]
    fn test_prune_drops_old_entries() {
        let mut state = RateLimitState::default();
        let now = 1_000_000_000_000;
        state.per_model.insert(
            "sonnet".to_string(),
            vec![
                UsageEntry {
                    timestamp: now - UsageWindow::Weekly.duration_ms() - 1,
                    input_tokens: 100,
                    output_tokens: 10,
                    sonnet_equivalent: 110.0,
                },
                UsageEntry {
                    timestamp: now,
                    input_tokens: 200,
                    output_tokens: 20,
                    sonnet_equivalent: 220.0,
                },
            ],
        );

        state.prune(now);
        assert_eq!(state.per_model["sonnet"].len(), 1);
        assert_eq!(state.per_model["sonnet"][0].input_tokens, 200);
    }

    #[test]
    fn test_window_usage_sums_within_window() {
        let mut state = RateLimitState::default();
        let now = 1_000_000_000_000;
        state.per_model.insert(
            "sonnet".to_string(),
            vec![
                UsageEntry {
                    timestamp: now - UsageWindow::FiveHour.duration_ms() - 1,
                    input_tokens: 0,
                    output_tokens: 0,
                    sonnet_equivalent: 500.0,
                },
                UsageEntry {
                    timestamp: now - 1000,
                    input_tokens: 0,
                    output_tokens: 0,
                    sonnet_equivalent: 100.0,
                },
            ],
        );
        state.per_model.insert(
            "opus".to_string(),
            vec![UsageEntry {
                timestamp: now - 2000,
                input_tokens: 0,
                output_tokens: 0,
                sonnet_equivalent: 50.0,
            }],
        );

        // 5h window misses the old sonnet entry
        assert_eq!(state.window_usage(UsageWindow::FiveHour, now), 150.0);
        // Weekly window sees everything
        assert_eq!(state.window_usage(UsageWindow::Weekly, now), 650.0);
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = RateLimitState::default();
        state.total_calls = 3;
        state.global_pause = Some(ModelPause {
            reason: "429".to_string(),
            resume_at: 123,
        });

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("global-pause"));
        let parsed: RateLimitState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total_calls, 3);
        assert_eq!(parsed.global_pause.unwrap().resume_at, 123);
    }
}
