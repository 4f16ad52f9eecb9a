//! Rate-limit tracking and the usage guard
//!
//! Every LLM call in the system goes through [`UsageGuard`], which
//! pre-checks the rolling-window budgets in [`RateLimitTracker`], runs the
//! call, and records token usage (or a 429 hit) afterwards.

mod guard;
mod tracker;
mod types;

pub use guard::{GuardCallback, GuardOutcome, UsageGuard, UsageGuardConfig};
pub use tracker::{MonitoringReport, RateLimitTracker, extract_retry_after, is_429_message, process_rate_limit_headers};
pub use types::{ModelPause, RateLimitHeaderInfo, RateLimitHit, RateLimitState, UsageEntry, UsageWindow};
