//! Verification - external typecheck/test commands and feedback enrichment

mod feedback;
mod runner;

pub use feedback::FeedbackEnricher;
pub use runner::{VerificationResult, Verifier, classify_failure_text, is_transient_error};
