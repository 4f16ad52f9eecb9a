//! ComplexityAssessor - fast keyword-and-metric scoring
//!
//! A pure function of its input: the same objective (and metrics) always
//! produces the same assessment. No LLM is involved; this runs before any
//! model is chosen.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::ModelTier;

/// Ordered complexity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Standard,
    Complex,
    Critical,
}

impl std::fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Standard => "standard",
            Self::Complex => "complex",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A shell command that satisfies the objective without any LLM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTool {
    pub command: String,
}

/// Inferred change scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    SingleFile,
    #[default]
    FewFiles,
    CrossPackage,
}

/// Team composition for a complexity level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamComposition {
    pub needs_planning: bool,
    pub validator_count: u32,
    pub multi_angle_review: bool,
}

impl TeamComposition {
    fn for_level(level: ComplexityLevel) -> Self {
        match level {
            ComplexityLevel::Trivial => Self {
                needs_planning: false,
                validator_count: 0,
                multi_angle_review: false,
            },
            ComplexityLevel::Simple => Self {
                needs_planning: false,
                validator_count: 1,
                multi_angle_review: false,
            },
            ComplexityLevel::Standard => Self {
                needs_planning: true,
                validator_count: 2,
                multi_angle_review: false,
            },
            ComplexityLevel::Complex => Self {
                needs_planning: true,
                validator_count: 3,
                multi_angle_review: false,
            },
            ComplexityLevel::Critical => Self {
                needs_planning: true,
                validator_count: 5,
                multi_angle_review: true,
            },
        }
    }
}

/// Quantitative metrics from a static scan of the codebase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodebaseMetrics {
    pub file_count: usize,
    pub total_lines: usize,
    pub function_count: usize,
    pub unhealthy_files: usize,
    pub git_hotspots: usize,
    pub bug_prone_files: usize,
}

/// Full assessment of one objective
#[derive(Debug, Clone)]
pub struct Assessment {
    pub level: ComplexityLevel,
    pub confidence: f64,
    pub model: ModelTier,
    pub use_full_chain: bool,
    pub needs_review: bool,
    pub estimated_scope: Scope,
    pub signals: Vec<String>,
    pub score: f64,
    pub team: TeamComposition,
    pub local_tool: Option<LocalTool>,
}

const REDUCING_KEYWORDS: &[&str] = &[
    "typo", "small", "cleanup", "rename", "comment", "readme", "docs", "simple", "quick", "trivial", "minor",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "migrate",
    "migration",
    "redesign",
    "refactor",
    "architecture",
    "concurrent",
    "parallel",
    "performance",
    "optimize",
    "cross-package",
];

const CRITICAL_KEYWORDS: &[&str] = &["security", "vulnerability", "payment", "production", "credential", "secret"];

/// Commands satisfied locally without any LLM
const LOCAL_TOOLS: &[(&str, &str)] = &[
    ("format", "pnpm format"),
    ("fmt", "pnpm format"),
    ("lint", "pnpm lint"),
    ("typecheck", "pnpm typecheck"),
    ("test", "pnpm test"),
    ("tests", "pnpm test"),
    ("build", "pnpm build"),
    ("spell", "pnpm spell"),
    ("spellcheck", "pnpm spell"),
];

/// Keyword-and-metric complexity scoring
#[derive(Debug, Default)]
pub struct ComplexityAssessor {
    metrics: Option<CodebaseMetrics>,
}

impl ComplexityAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach static-scan metrics to feed the quantitative signals
    pub fn with_metrics(metrics: CodebaseMetrics) -> Self {
        Self { metrics: Some(metrics) }
    }

    /// Assess one objective
    pub fn assess(&self, objective: &str) -> Assessment {
        let lower = objective.to_lowercase();
        let mut signals = Vec::new();

        // Pure local-tool objectives skip the LLM entirely
        if let Some(tool) = Self::match_local_tool(&lower) {
            let level = ComplexityLevel::Trivial;
            return Assessment {
                level,
                confidence: 0.95,
                model: ModelTier::Low,
                use_full_chain: false,
                needs_review: false,
                estimated_scope: Scope::FewFiles,
                signals: vec![format!("local tool: {}", tool.command)],
                score: -10.0,
                team: TeamComposition::for_level(level),
                local_tool: Some(tool),
            };
        }

        let mut score = 0.0;

        for kw in REDUCING_KEYWORDS {
            if lower.contains(kw) {
                score -= 2.0;
                signals.push(format!("reducing keyword: {}", kw));
            }
        }
        for kw in COMPLEX_KEYWORDS {
            if lower.contains(kw) {
                score += 4.0;
                signals.push(format!("complex keyword: {}", kw));
            }
        }
        for kw in CRITICAL_KEYWORDS {
            if lower.contains(kw) {
                score += 6.0;
                signals.push(format!("critical keyword: {}", kw));
            }
        }
        if lower.contains("multiple packages") {
            score += 4.0;
            signals.push("complex phrase: multiple packages".to_string());
        }
        if lower.contains("auth") && lower.contains("refactor") {
            score += 10.0;
            signals.push("critical combination: auth + refactor".to_string());
        }

        let estimated_scope = Self::detect_scope(&lower, &mut signals, &mut score);
        self.apply_metrics(&mut signals, &mut score);

        let level = Self::level_from_score(score);
        let confidence = (0.5 + 0.08 * signals.len() as f64).min(0.95);

        let model = match level {
            ComplexityLevel::Critical => ModelTier::Top,
            ComplexityLevel::Complex | ComplexityLevel::Standard => ModelTier::Mid,
            _ => ModelTier::Low,
        };

        Assessment {
            level,
            confidence,
            model,
            use_full_chain: level >= ComplexityLevel::Complex,
            needs_review: level >= ComplexityLevel::Standard,
            estimated_scope,
            signals,
            score,
            team: TeamComposition::for_level(level),
            local_tool: None,
        }
    }

    fn match_local_tool(lower: &str) -> Option<LocalTool> {
        let stripped = lower.trim().trim_start_matches("run ").trim();
        LOCAL_TOOLS
            .iter()
            .find(|(name, _)| *name == stripped)
            .map(|(_, command)| LocalTool {
                command: command.to_string(),
            })
    }

    fn detect_scope(lower: &str, signals: &mut Vec<String>, score: &mut f64) -> Scope {
        if lower.contains("this file") || lower.contains("single file") || lower.contains("one file") {
            *score -= 1.0;
            signals.push("scope: single file".to_string());
            Scope::SingleFile
        } else if lower.contains("throughout")
            || lower.contains("across")
            || lower.contains("packages")
            || lower.contains("codebase")
        {
            *score += 3.0;
            signals.push("scope: cross-package".to_string());
            Scope::CrossPackage
        } else {
            Scope::FewFiles
        }
    }

    fn apply_metrics(&self, signals: &mut Vec<String>, score: &mut f64) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        if metrics.file_count > 200 {
            *score += 1.0;
            signals.push(format!("metrics: {} files", metrics.file_count));
        }
        if metrics.total_lines > 50_000 {
            *score += 1.0;
            signals.push(format!("metrics: {} lines", metrics.total_lines));
        }
        if metrics.function_count > 1_000 {
            *score += 1.0;
            signals.push(format!("metrics: {} functions", metrics.function_count));
        }
        if metrics.unhealthy_files > 0 {
            let bump = (metrics.unhealthy_files as f64).min(3.0);
            *score += bump;
            signals.push(format!("metrics: {} unhealthy files", metrics.unhealthy_files));
        }
        if metrics.git_hotspots > 0 {
            *score += 1.0;
            signals.push(format!("metrics: {} git hotspots", metrics.git_hotspots));
        }
        if metrics.bug_prone_files > 0 {
            *score += 2.0;
            signals.push(format!("metrics: {} bug-prone files", metrics.bug_prone_files));
        }
    }

    fn level_from_score(score: f64) -> ComplexityLevel {
        if score <= -2.0 {
            ComplexityLevel::Trivial
        } else if score <= 0.0 {
            ComplexityLevel::Simple
        } else if score <= 3.0 {
            ComplexityLevel::Standard
        } else if score < 10.0 {
            ComplexityLevel::Complex
        } else {
            ComplexityLevel::Critical
        }
    }
}

/// Walk a directory and gather the quantitative metrics
///
/// Line-count based health heuristics only; git history analysis is fed in
/// separately when available.
pub fn scan_metrics(root: impl AsRef<Path>) -> CodebaseMetrics {
    const SOURCE_EXTENSIONS: &[&str] = &["rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "rb"];
    const UNHEALTHY_LINES: usize = 800;

    let mut metrics = CodebaseMetrics::default();

    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(name == ".git" || name == "node_modules" || name == "target")
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or("");
        if !SOURCE_EXTENSIONS.contains(&ext) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        let lines = content.lines().count();
        metrics.file_count += 1;
        metrics.total_lines += lines;
        metrics.function_count += content.matches("fn ").count() + content.matches("function ").count();
        if lines > UNHEALTHY_LINES {
            metrics.unhealthy_files += 1;
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assess(objective: &str) -> Assessment {
        ComplexityAssessor::new().assess(objective)
    }

    #[test]
    fn test_local_tool_shortcut() {
        let a = assess("run format");
        assert_eq!(a.level, ComplexityLevel::Trivial);
        assert_eq!(a.local_tool, Some(LocalTool { command: "pnpm format".to_string() }));
        assert!(!a.needs_review);
        assert!(!a.team.needs_planning);

        let a = assess("typecheck");
        assert_eq!(a.local_tool.unwrap().command, "pnpm typecheck");
    }

    #[test]
    fn test_local_tool_requires_bare_objective() {
        // A sentence mentioning "format" is not a local-tool objective
        let a = assess("reformat the date handling in the parser");
        assert!(a.local_tool.is_none());
    }

    #[test]
    fn test_security_is_critical() {
        let a = assess("fix security vulnerability");
        assert_eq!(a.level, ComplexityLevel::Critical);
        assert_eq!(a.model, ModelTier::Top);
        assert!(a.needs_review);
        assert!(a.team.multi_angle_review);
        assert_eq!(a.team.validator_count, 5);
    }

    #[test]
    fn test_typo_is_trivial() {
        let a = assess("fix a small typo in the readme");
        assert_eq!(a.level, ComplexityLevel::Trivial);
        assert_eq!(a.model, ModelTier::Low);
        assert!(!a.team.needs_planning);
    }

    #[test]
    fn test_plain_objective_is_simple() {
        let a = assess("fix the login bug");
        assert_eq!(a.level, ComplexityLevel::Simple);
        assert!(!a.needs_review);
        assert_eq!(a.team.validator_count, 1);
    }

    #[test]
    fn test_migration_is_complex() {
        let a = assess("migrate the user table to the new schema");
        assert_eq!(a.level, ComplexityLevel::Complex);
        assert!(a.use_full_chain);
        assert!(a.team.needs_planning);
    }

    #[test]
    fn test_auth_refactor_is_critical() {
        let a = assess("refactor the auth middleware");
        assert_eq!(a.level, ComplexityLevel::Critical);
    }

    #[test]
    fn test_scope_detection() {
        assert_eq!(assess("update the header in this file").estimated_scope, Scope::SingleFile);
        assert_eq!(
            assess("apply the naming convention throughout the codebase").estimated_scope,
            Scope::CrossPackage
        );
        assert_eq!(assess("fix the login bug").estimated_scope, Scope::FewFiles);
    }

    #[test]
    fn test_deterministic() {
        let a = assess("migrate the billing pipeline");
        let b = assess("migrate the billing pipeline");
        assert_eq!(a.level, b.level);
        assert_eq!(a.score, b.score);
        assert_eq!(a.signals, b.signals);
    }

    #[test]
    fn test_confidence_monotone_in_signals() {
        let few = assess("fix the login bug");
        let many = assess("migrate and refactor the security layer across packages");
        assert!(many.signals.len() > few.signals.len());
        assert!(many.confidence >= few.confidence);
        assert!(many.confidence <= 0.95);
    }

    #[test]
    fn test_metrics_raise_score() {
        let plain = ComplexityAssessor::new().assess("update the parser");
        let with_metrics = ComplexityAssessor::with_metrics(CodebaseMetrics {
            file_count: 500,
            total_lines: 100_000,
            function_count: 2_000,
            unhealthy_files: 5,
            git_hotspots: 2,
            bug_prone_files: 3,
        })
        .assess("update the parser");

        assert!(with_metrics.score > plain.score);
        assert!(with_metrics.level >= plain.level);
    }

    #[test]
    fn test_scan_metrics_counts_files() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("a.rs"), "fn main() {}\nfn helper() {}\n").unwrap();
        std::fs::write(temp.path().join("b.txt"), "not source\n").unwrap();

        let metrics = scan_metrics(temp.path());
        assert_eq!(metrics.file_count, 1);
        assert_eq!(metrics.function_count, 2);
        assert_eq!(metrics.total_lines, 2);
    }
}
