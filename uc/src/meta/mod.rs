//! Meta-tasks - recommendations against the task board

mod engine;

pub use engine::{AppliedReport, MetaAction, MetaRecommendation, MetaTaskEngine, NewTaskSpec};
