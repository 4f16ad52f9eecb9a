//! Undercity - autonomous code-modification orchestrator
//!
//! Undercity drives an external LLM coding agent through
//! plan -> execute -> verify -> review -> merge against one repository,
//! learns from successes and failures, and integrates results through a
//! serial merge queue over parallel workers.
//!
//! # Core machinery
//!
//! - **Task lifecycle**: forward-only phase machine per task with
//!   checkpointed resume, retry budgets, and tier escalation
//! - **Adaptive routing**: complexity heuristics plus historical success
//!   rates pick the starting model tier and the escalation ladder
//! - **Parallel scheduling, serial integration**: up to five workers run
//!   concurrently; the merge queue rebases, re-tests, and merges one
//!   branch at a time
//! - **Usage guard**: every LLM call is wrapped with rolling-window token
//!   accounting, 429 detection, and pause/auto-resume
//! - **Learning**: knowledge base, error->fix patterns, task->file
//!   correlations, and a decision tracker feed back into routing and
//!   planning
//!
//! # Modules
//!
//! - [`domain`] - task board records and shared enums
//! - [`ratelimit`] - rolling-window tracker and the usage guard
//! - [`assess`] - complexity assessment and the model router
//! - [`llm`] - LLM client trait, Anthropic client, agent boundary
//! - [`learn`] - knowledge base, error patterns, decisions, file patterns
//! - [`state`] - actor that owns the store, plus batch recovery
//! - [`planner`] - tiered plan generation and the review loop
//! - [`verify`] - external typecheck/test runner and feedback enrichment
//! - [`worker`] - per-task execution engine
//! - [`merge`] - serial merge queue with conflict prediction
//! - [`orchestrator`] - top-level dispatch loop
//! - [`meta`] - meta-task recommendations against the task board
//! - [`control`] - HTTP control daemon and lockfile

pub mod assess;
pub mod cli;
pub mod config;
pub mod control;
pub mod domain;
pub mod learn;
pub mod llm;
pub mod logging;
pub mod merge;
pub mod meta;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod ratelimit;
pub mod state;
pub mod verify;
pub mod worker;

pub use assess::{Assessment, ComplexityAssessor, ComplexityLevel, ModelRouter, RouterConfig};
pub use config::{Config, StateDir};
pub use domain::{AttemptRecord, ErrorCategory, ModelTier, Task, TaskStatus};
pub use ratelimit::{RateLimitTracker, UsageGuard};
pub use state::{StateError, StateManager};
