//! Top-level dispatch loop

mod core;

pub use core::{BatchSummary, Orchestrator, OrchestratorConfig};
