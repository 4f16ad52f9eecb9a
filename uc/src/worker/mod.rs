//! Per-task execution engine

mod checkpoint;
mod engine;

pub use checkpoint::{Checkpoint, WorkerPhase};
pub use engine::{Worker, WorkerConfig, WorkerOutcome};
