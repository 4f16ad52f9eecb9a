//! UsageGuard - pre-check and post-record around every LLM call
//!
//! The guard never lets a 429 unwind through the system: a rate-limited
//! call comes back as a regular [`GuardOutcome::RateLimited`] value that
//! the retry driver handles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::ModelTier;
use crate::llm::{LlmError, TokenUsage};

use super::tracker::{RateLimitTracker, is_429_message};
use super::types::UsageWindow;

/// Callback invoked with a human-readable reason
pub type GuardCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Guard thresholds and behaviour
#[derive(Clone)]
pub struct UsageGuardConfig {
    /// Usage fraction that pauses new work
    pub pause_threshold: f64,
    /// Usage fraction that fires the warning callback
    pub warning_threshold: f64,
    /// Pause automatically at the pause threshold
    pub auto_pause: bool,
    /// Fired when the guard pauses work
    pub on_pause: Option<GuardCallback>,
    /// Fired when usage crosses the warning threshold
    pub on_warning: Option<GuardCallback>,
}

impl Default for UsageGuardConfig {
    fn default() -> Self {
        Self {
            pause_threshold: 0.95,
            warning_threshold: 0.80,
            auto_pause: true,
            on_pause: None,
            on_warning: None,
        }
    }
}

impl std::fmt::Debug for UsageGuardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageGuardConfig")
            .field("pause_threshold", &self.pause_threshold)
            .field("warning_threshold", &self.warning_threshold)
            .field("auto_pause", &self.auto_pause)
            .finish()
    }
}

/// Result of a guarded call
#[derive(Debug)]
pub enum GuardOutcome<T> {
    /// The call ran and its usage was recorded
    Executed(T),
    /// The call ran and hit a rate limit; the hit has been recorded
    RateLimited(LlmError),
    /// The call never ran; the tracker is paused
    Blocked { reason: String, resume_in_ms: i64 },
}

impl<T> GuardOutcome<T> {
    pub fn executed(self) -> Option<T> {
        match self {
            Self::Executed(value) => Some(value),
            _ => None,
        }
    }
}

/// Wraps LLM calls with pre-check and post-record
pub struct UsageGuard {
    tracker: Arc<RateLimitTracker>,
    config: UsageGuardConfig,
}

impl UsageGuard {
    pub fn new(tracker: Arc<RateLimitTracker>, config: UsageGuardConfig) -> Self {
        Self { tracker, config }
    }

    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    /// Pre-flight check; Some means the call must not run
    fn check_usage(&self) -> Option<(String, i64)> {
        if self.tracker.is_paused() {
            let remaining = self.tracker.get_remaining_pause_time();
            return Some((
                format!("Rate-limit pause active, {} remaining", self.tracker.format_remaining_time()),
                remaining,
            ));
        }

        for window in UsageWindow::ALL {
            let usage = self.tracker.get_usage_percentage(window);

            if usage >= self.config.pause_threshold && self.config.auto_pause {
                let reason = format!("{} window at {:.0}% of budget", window.name(), usage * 100.0);
                warn!(window = window.name(), usage, "Usage crossed pause threshold");
                self.tracker.pause_for_usage(window, &reason);
                if let Some(on_pause) = &self.config.on_pause {
                    on_pause(&reason);
                }
                return Some((reason, self.tracker.get_remaining_pause_time()));
            }

            if usage >= self.config.warning_threshold
                && let Some(on_warning) = &self.config.on_warning
            {
                on_warning(&format!("{} window at {:.0}% of budget", window.name(), usage * 100.0));
            }
        }

        None
    }

    /// Run an LLM call under the guard
    ///
    /// `usage_of` extracts token usage from a successful response so the
    /// tracker can record it.
    pub async fn guard<T, Fut>(
        &self,
        tier: ModelTier,
        call: Fut,
        usage_of: impl FnOnce(&T) -> TokenUsage,
    ) -> Result<GuardOutcome<T>, LlmError>
    where
        Fut: Future<Output = Result<T, LlmError>>,
    {
        if let Some((reason, resume_in_ms)) = self.check_usage() {
            debug!(%reason, "Guard blocked call");
            return Ok(GuardOutcome::Blocked { reason, resume_in_ms });
        }

        match call.await {
            Ok(value) => {
                let usage = usage_of(&value);
                self.tracker.record_usage(tier, usage.input_tokens, usage.output_tokens);
                Ok(GuardOutcome::Executed(value))
            }
            Err(error) => {
                let message = error.to_string();
                if error.is_rate_limit() || is_429_message(&message) {
                    let headers = error.retry_after().map(|d| {
                        let mut h = HashMap::new();
                        h.insert("retry-after".to_string(), d.as_secs().to_string());
                        h
                    });
                    self.tracker.record_rate_limit_hit(tier, &message, headers.as_ref());
                    Ok(GuardOutcome::RateLimited(error))
                } else {
                    Err(error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn guard_with(config: RateLimitConfig, guard_config: UsageGuardConfig) -> UsageGuard {
        UsageGuard::new(Arc::new(RateLimitTracker::new(config)), guard_config)
    }

    fn usage_of_unit(_: &u32) -> TokenUsage {
        TokenUsage::new(100, 10)
    }

    #[tokio::test]
    async fn test_guard_executes_and_records() {
        let guard = guard_with(RateLimitConfig::default(), UsageGuardConfig::default());

        let outcome = guard
            .guard(ModelTier::Mid, async { Ok::<_, LlmError>(42u32) }, usage_of_unit)
            .await
            .unwrap();

        assert!(matches!(outcome, GuardOutcome::Executed(42)));
        let snapshot = guard.tracker().snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.total_input_tokens, 100);
    }

    #[tokio::test]
    async fn test_guard_maps_rate_limit_to_outcome() {
        let guard = guard_with(RateLimitConfig::default(), UsageGuardConfig::default());

        let outcome = guard
            .guard(
                ModelTier::Mid,
                async {
                    Err::<u32, _>(LlmError::RateLimited {
                        retry_after: Some(Duration::from_secs(60)),
                    })
                },
                usage_of_unit,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, GuardOutcome::RateLimited(_)));
        // The hit was recorded and the tracker is paused
        assert!(guard.tracker().is_paused());
        assert!(guard.tracker().is_model_paused(ModelTier::Mid));
        assert_eq!(guard.tracker().snapshot().hits.len(), 1);
    }

    #[tokio::test]
    async fn test_guard_propagates_other_errors() {
        let guard = guard_with(RateLimitConfig::default(), UsageGuardConfig::default());

        let result = guard
            .guard(
                ModelTier::Mid,
                async { Err::<u32, _>(LlmError::InvalidResponse("bad".to_string())) },
                usage_of_unit,
            )
            .await;

        assert!(result.is_err());
        assert!(!guard.tracker().is_paused());
    }

    #[tokio::test]
    async fn test_guard_blocks_while_paused() {
        let guard = guard_with(RateLimitConfig::default(), UsageGuardConfig::default());
        guard.tracker().pause_for_rate_limit(ModelTier::Mid, "429", None);

        let outcome = guard
            .guard(ModelTier::Mid, async { Ok::<_, LlmError>(1u32) }, usage_of_unit)
            .await
            .unwrap();

        match outcome {
            GuardOutcome::Blocked { reason, resume_in_ms } => {
                assert!(reason.contains("remaining"));
                assert!(resume_in_ms > 0);
            }
            _ => panic!("expected Blocked"),
        }
    }

    #[tokio::test]
    async fn test_guard_auto_pauses_at_threshold() {
        let pauses = Arc::new(AtomicUsize::new(0));
        let pauses_clone = pauses.clone();

        let guard = guard_with(
            RateLimitConfig {
                five_hour_budget: 100.0,
                weekly_budget: 1_000_000.0,
                ..Default::default()
            },
            UsageGuardConfig {
                on_pause: Some(Arc::new(move |_| {
                    pauses_clone.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        // Push the 5h window to 110%
        guard.tracker().record_usage(ModelTier::Mid, 100, 10);

        let outcome = guard
            .guard(ModelTier::Mid, async { Ok::<_, LlmError>(1u32) }, usage_of_unit)
            .await
            .unwrap();

        assert!(matches!(outcome, GuardOutcome::Blocked { .. }));
        assert!(guard.tracker().is_paused());
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_warning_callback() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let warnings_clone = warnings.clone();

        let guard = guard_with(
            RateLimitConfig {
                five_hour_budget: 100.0,
                weekly_budget: 1_000_000.0,
                ..Default::default()
            },
            UsageGuardConfig {
                on_warning: Some(Arc::new(move |_| {
                    warnings_clone.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        // 85% of the 5h window: warn but proceed
        guard.tracker().record_usage(ModelTier::Mid, 80, 5);

        let outcome = guard
            .guard(ModelTier::Mid, async { Ok::<_, LlmError>(1u32) }, usage_of_unit)
            .await
            .unwrap();

        assert!(matches!(outcome, GuardOutcome::Executed(1)));
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_no_auto_pause_when_disabled() {
        let guard = guard_with(
            RateLimitConfig {
                five_hour_budget: 100.0,
                weekly_budget: 1_000_000.0,
                ..Default::default()
            },
            UsageGuardConfig {
                auto_pause: false,
                ..Default::default()
            },
        );

        guard.tracker().record_usage(ModelTier::Mid, 100, 10);

        let outcome = guard
            .guard(ModelTier::Mid, async { Ok::<_, LlmError>(1u32) }, usage_of_unit)
            .await
            .unwrap();

        assert!(matches!(outcome, GuardOutcome::Executed(1)));
        assert!(!guard.tracker().is_paused());
    }
}
