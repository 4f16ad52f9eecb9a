//! Complexity assessment and model routing

mod complexity;
mod router;

pub use complexity::{
    Assessment, CodebaseMetrics, ComplexityAssessor, ComplexityLevel, LocalTool, Scope, TeamComposition, scan_metrics,
};
pub use router::{EscalationStep, ModelRouter, ReviewLevel, RouterConfig, SuccessStats};
