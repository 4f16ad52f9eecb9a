//! RateLimitTracker - rolling-window token accounting and pause clock
//!
//! Process-wide; state is mutated under a mutex and read as snapshots.
//! Every mutation is persisted to `rate-limit-state.json` atomically so a
//! crashed session resumes with its budgets intact.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use understore::{now_ms, read_json_or_default, write_json_atomic};

use crate::config::RateLimitConfig;
use crate::domain::ModelTier;

use super::types::{ModelPause, RateLimitHeaderInfo, RateLimitHit, RateLimitState, UsageEntry, UsageWindow};

/// Bound on the 429 hit log
const MAX_HITS: usize = 200;

/// Check whether an error message looks like a rate limit
pub fn is_429_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("quota exceeded")
        || lower.contains("too many requests")
}

/// Parse a `retry-after` header (seconds) into milliseconds
///
/// Zero is valid; non-numeric or negative values yield None. Header lookup
/// is case-insensitive.
pub fn extract_retry_after(headers: &HashMap<String, String>) -> Option<i64> {
    let value = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
        .map(|(_, v)| v.trim())?;

    let seconds: f64 = value.parse().ok()?;
    if seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0) as i64)
}

/// Parse retry-after plus the `x-ratelimit-*` family (case-insensitive)
pub fn process_rate_limit_headers(headers: &HashMap<String, String>) -> RateLimitHeaderInfo {
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim().to_string())
    };

    RateLimitHeaderInfo {
        retry_after_ms: extract_retry_after(headers),
        limit: find("x-ratelimit-limit").and_then(|v| v.parse().ok()),
        remaining: find("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
        reset: find("x-ratelimit-reset"),
        window: find("x-ratelimit-window"),
    }
}

/// Report from [`RateLimitTracker::continuous_monitoring`]
#[derive(Debug, Clone)]
pub struct MonitoringReport {
    pub should_resume: bool,
    /// Usage fraction per window
    pub current_usage: HashMap<UsageWindow, f64>,
    /// Milliseconds until the pause clock expires (None when not paused)
    pub time_until_resume: Option<i64>,
}

/// Rolling-window token accounting, 429 detection, and the pause clock
pub struct RateLimitTracker {
    state: Mutex<RateLimitState>,
    config: RateLimitConfig,
    state_path: Option<PathBuf>,
}

impl RateLimitTracker {
    /// In-memory tracker (tests, one-shot commands)
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(RateLimitState::default()),
            config,
            state_path: None,
        }
    }

    /// Tracker backed by `rate-limit-state.json`
    pub fn load(config: RateLimitConfig, state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let mut state: RateLimitState = read_json_or_default(&state_path);
        state.prune(now_ms());
        Self {
            state: Mutex::new(state),
            config,
            state_path: Some(state_path),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimitState> {
        // A poisoned lock still holds consistent state; recover it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &RateLimitState) {
        if let Some(path) = &self.state_path
            && let Err(e) = write_json_atomic(path, state)
        {
            warn!(error = %e, "Failed to persist rate-limit state");
        }
    }

    /// Snapshot of the full state (lock-free for callers)
    pub fn snapshot(&self) -> RateLimitState {
        self.lock().clone()
    }

    /// Record one LLM call's token usage
    pub fn record_usage(&self, tier: ModelTier, input_tokens: u64, output_tokens: u64) {
        let now = now_ms();
        let sonnet_equivalent = (input_tokens + output_tokens) as f64 * tier.sonnet_equivalent_weight();

        let mut state = self.lock();
        state.prune(now);
        state.per_model.entry(tier.name().to_string()).or_default().push(UsageEntry {
            timestamp: now,
            input_tokens,
            output_tokens,
            sonnet_equivalent,
        });
        state.total_input_tokens += input_tokens;
        state.total_output_tokens += output_tokens;
        state.total_calls += 1;
        self.persist(&state);

        debug!(model = tier.name(), input_tokens, output_tokens, sonnet_equivalent, "Recorded usage");
    }

    /// Usage fraction of the budget for a window (0.0..)
    pub fn get_usage_percentage(&self, window: UsageWindow) -> f64 {
        let budget = match window {
            UsageWindow::FiveHour => self.config.five_hour_budget,
            UsageWindow::Weekly => self.config.weekly_budget,
        };
        if budget <= 0.0 {
            return 0.0;
        }
        let state = self.lock();
        state.window_usage(window, now_ms()) / budget
    }

    /// Record a 429 hit and pause the model (and globally)
    pub fn record_rate_limit_hit(&self, model: ModelTier, message: &str, headers: Option<&HashMap<String, String>>) {
        let retry_after_ms = headers.and_then(extract_retry_after);

        {
            let mut state = self.lock();
            state.hits.push(RateLimitHit {
                model: model.name().to_string(),
                message: message.to_string(),
                timestamp: now_ms(),
                retry_after_ms,
            });
            if state.hits.len() > MAX_HITS {
                let excess = state.hits.len() - MAX_HITS;
                state.hits.drain(..excess);
            }
            self.persist(&state);
        }

        self.pause_for_rate_limit(model, message, headers);
    }

    /// Pause the given model and set the global pause clock
    pub fn pause_for_rate_limit(&self, model: ModelTier, reason: &str, headers: Option<&HashMap<String, String>>) {
        let backoff = headers
            .and_then(extract_retry_after)
            .unwrap_or(self.config.default_backoff_ms);
        let resume_at = now_ms() + backoff;

        let mut state = self.lock();
        state.model_pauses.insert(
            model.name().to_string(),
            ModelPause {
                reason: reason.to_string(),
                resume_at,
            },
        );

        // Global pause extends to the furthest model resume
        let global_resume = state
            .global_pause
            .as_ref()
            .map(|p| p.resume_at.max(resume_at))
            .unwrap_or(resume_at);
        state.global_pause = Some(ModelPause {
            reason: reason.to_string(),
            resume_at: global_resume,
        });
        self.persist(&state);

        info!(model = model.name(), resume_at, "Paused for rate limit");
    }

    /// Pause globally because a usage window crossed the pause threshold
    ///
    /// Estimated resume: 30 minutes for the 5-hour window, 2 hours for the
    /// weekly window.
    pub fn pause_for_usage(&self, window: UsageWindow, reason: &str) {
        let backoff = match window {
            UsageWindow::FiveHour => 30 * 60 * 1000,
            UsageWindow::Weekly => 2 * 60 * 60 * 1000,
        };
        let resume_at = now_ms() + backoff;

        let mut state = self.lock();
        state.global_pause = Some(ModelPause {
            reason: reason.to_string(),
            resume_at,
        });
        self.persist(&state);

        info!(window = window.name(), resume_at, "Paused for high usage");
    }

    pub fn is_paused(&self) -> bool {
        self.lock().global_pause.is_some()
    }

    pub fn is_model_paused(&self, model: ModelTier) -> bool {
        self.lock().model_pauses.contains_key(model.name())
    }

    /// Clear one model's pause; the global pause clears when no model
    /// pauses remain
    pub fn resume_model(&self, model: ModelTier) {
        let mut state = self.lock();
        state.model_pauses.remove(model.name());
        if state.model_pauses.is_empty() {
            state.global_pause = None;
        }
        self.persist(&state);
        info!(model = model.name(), "Resumed model");
    }

    /// Clear every pause
    pub fn resume_from_rate_limit(&self) {
        let mut state = self.lock();
        state.model_pauses.clear();
        state.global_pause = None;
        self.persist(&state);
        info!("Resumed from rate limit");
    }

    /// Milliseconds until the global pause expires (0 when not paused)
    pub fn get_remaining_pause_time(&self) -> i64 {
        let state = self.lock();
        state
            .global_pause
            .as_ref()
            .map(|p| (p.resume_at - now_ms()).max(0))
            .unwrap_or(0)
    }

    /// Remaining pause as `M:SS`
    pub fn format_remaining_time(&self) -> String {
        let ms = self.get_remaining_pause_time();
        let total_seconds = ms / 1000;
        format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
    }

    /// Auto-resume when the clock expired AND usage fell below
    /// pauseThreshold - 0.1 in all tracked windows
    pub fn check_auto_resume(&self) -> bool {
        let now = now_ms();
        let clock_expired = {
            let state = self.lock();
            match &state.global_pause {
                Some(pause) => pause.resume_at <= now,
                None => return false,
            }
        };
        if !clock_expired {
            return false;
        }

        let threshold = self.config.pause_threshold - 0.1;
        let usage_ok = UsageWindow::ALL.iter().all(|w| self.get_usage_percentage(*w) < threshold);
        if !usage_ok {
            debug!("Auto-resume deferred: usage still high");
            return false;
        }

        self.resume_from_rate_limit();
        true
    }

    /// One monitoring tick for the orchestrator's pause loop
    pub fn continuous_monitoring(&self) -> MonitoringReport {
        let mut current_usage = HashMap::new();
        for window in UsageWindow::ALL {
            current_usage.insert(window, self.get_usage_percentage(window));
        }

        let remaining = self.get_remaining_pause_time();
        let time_until_resume = if self.is_paused() { Some(remaining) } else { None };

        MonitoringReport {
            should_resume: self.check_auto_resume(),
            current_usage,
            time_until_resume,
        }
    }
}
