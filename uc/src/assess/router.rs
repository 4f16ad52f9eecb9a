//! ModelRouter - maps assessments onto the tier ladder
//!
//! Starting tier, review intensity, and the escalation ladder all come
//! from here. Historical success rates (from the attempts table) can bump
//! a recommendation one tier.

use std::collections::HashMap;
use tracing::debug;

use crate::domain::ModelTier;

use super::complexity::{Assessment, ComplexityLevel};

/// Router configuration, derived from the grind config
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Forced starting tier (still capped at max_tier)
    pub model_override: Option<ModelTier>,
    /// Highest tier any route or escalation may reach
    pub max_tier: ModelTier,
    /// Review passes enabled at all
    pub reviews_enabled: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model_override: None,
            max_tier: ModelTier::Top,
            reviews_enabled: true,
        }
    }
}

/// One step on the escalation ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub can_escalate: bool,
    pub next_tier: Option<ModelTier>,
}

/// Review intensity for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewLevel {
    pub review: bool,
    pub multi_lens: bool,
    pub max_review_tier: ModelTier,
}

/// Historical success rates per (tier, level)
#[derive(Debug, Clone, Default)]
pub struct SuccessStats {
    samples: HashMap<(ModelTier, ComplexityLevel), (u64, u64)>,
}

impl SuccessStats {
    pub fn record(&mut self, tier: ModelTier, level: ComplexityLevel, success: bool) {
        let entry = self.samples.entry((tier, level)).or_insert((0, 0));
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
    }

    /// (attempts, success rate) for a combination
    pub fn rate(&self, tier: ModelTier, level: ComplexityLevel) -> (u64, f64) {
        match self.samples.get(&(tier, level)) {
            Some((attempts, successes)) if *attempts > 0 => (*attempts, *successes as f64 / *attempts as f64),
            _ => (0, 0.0),
        }
    }
}

/// Success rate below which a recommendation is upgraded one tier
const UPGRADE_THRESHOLD: f64 = 0.5;

/// Routes tasks onto the tier ladder
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Pick the starting tier for a task
    ///
    /// Rules in order: explicit override (capped), test-related raised to
    /// at least mid, level mapping (critical gets top, everything else
    /// mid), and finally the max-tier cap.
    pub fn determine_starting_model(&self, assessment: &Assessment, objective: &str) -> ModelTier {
        if let Some(tier) = self.config.model_override {
            let capped = tier.min(self.config.max_tier);
            debug!(tier = %capped, "Using configured model override");
            return capped;
        }

        let mut tier = match assessment.level {
            ComplexityLevel::Critical => ModelTier::Top,
            _ => ModelTier::Mid,
        };

        if objective.to_lowercase().contains("test") {
            tier = tier.max(ModelTier::Mid);
        }

        tier.min(self.config.max_tier)
    }

    /// Review intensity for a task
    ///
    /// The review tier is capped at sonnet for anything below critical;
    /// only critical unlocks top-tier multi-lens review.
    pub fn determine_review_level(&self, assessment: &Assessment) -> ReviewLevel {
        if !self.config.reviews_enabled {
            return ReviewLevel {
                review: false,
                multi_lens: false,
                max_review_tier: ModelTier::Low,
            };
        }

        if assessment.level == ComplexityLevel::Critical {
            ReviewLevel {
                review: true,
                multi_lens: true,
                max_review_tier: ModelTier::Top.min(self.config.max_tier),
            }
        } else {
            ReviewLevel {
                review: assessment.needs_review,
                multi_lens: false,
                max_review_tier: ModelTier::Mid.min(self.config.max_tier),
            }
        }
    }

    /// Next rung on the escalation ladder
    pub fn get_next_model_tier(&self, current: ModelTier) -> EscalationStep {
        match current.next() {
            Some(next) if next <= self.config.max_tier => EscalationStep {
                can_escalate: true,
                next_tier: Some(next),
            },
            _ => EscalationStep {
                can_escalate: false,
                next_tier: None,
            },
        }
    }

    /// Upgrade a recommendation when history says it underperforms
    ///
    /// With at least `min_samples` attempts and a success rate below the
    /// threshold, the recommendation moves up one tier. Never downgrades.
    pub fn adjust_model_from_metrics(
        &self,
        recommended: ModelTier,
        level: ComplexityLevel,
        stats: &SuccessStats,
        min_samples: u64,
    ) -> ModelTier {
        let (attempts, rate) = stats.rate(recommended, level);
        if attempts >= min_samples && rate < UPGRADE_THRESHOLD {
            if let Some(next) = recommended.next()
                && next <= self.config.max_tier
            {
                debug!(
                    from = %recommended,
                    to = %next,
                    attempts,
                    rate,
                    "Upgrading tier from historical metrics"
                );
                return next;
            }
        }
        recommended
    }
}
