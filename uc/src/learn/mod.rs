//! Learning subsystems
//!
//! Four stores feed back into routing, planning, and feedback enrichment:
//! the knowledge base (categorised learnings with novelty scoring), the
//! error->fix pattern store with the permanent-failure log, the decision
//! tracker, and the task->file pattern store.

mod decisions;
mod error_patterns;
mod file_patterns;
mod knowledge;

pub use decisions::{
    DecisionCategory, DecisionPoint, DecisionStatus, DecisionTracker, HumanOverride, Resolution, Resolver,
    classify_decision,
};
pub use error_patterns::{ErrorPattern, ErrorPatternStore, Fix, PermanentFailure, error_signature};
pub use file_patterns::{CoModification, FilePatternStore, KeywordCorrelation};
pub use knowledge::{
    AddOutcome, KnowledgeBase, Learning, LearningCategory, NOVELTY_REJECT_THRESHOLD, Similarity, TokenJaccard,
};
