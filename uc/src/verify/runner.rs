//! Verifier - runs external typecheck and test commands
//!
//! Verification is exit-code driven: the agent's claims never count, only
//! the configured commands do. Failures map onto the fixed taxonomy;
//! transient network noise is marked retry-eligible.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::VerifyConfig;
use crate::domain::ErrorCategory;

/// Result of one verification run
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub passed: bool,
    /// Raw feedback for the next attempt
    pub feedback: String,
    /// Individual issue lines extracted from the output
    pub issues: Vec<String>,
    /// Files changed in the working tree
    pub files_changed: Vec<String>,
    pub has_warnings: bool,
    /// Failure category when not passed
    pub category: Option<ErrorCategory>,
}

impl VerificationResult {
    fn passed(files_changed: Vec<String>, has_warnings: bool) -> Self {
        Self {
            passed: true,
            feedback: String::new(),
            issues: Vec::new(),
            files_changed,
            has_warnings,
            category: None,
        }
    }
}

/// Map raw failure output onto the taxonomy
pub fn classify_failure_text(output: &str) -> ErrorCategory {
    let lower = output.to_lowercase();
    if is_transient_error(output) {
        ErrorCategory::NetworkTransient
    } else if lower.contains("type error") || lower.contains("typecheck") || lower.contains("error ts") {
        ErrorCategory::Typecheck
    } else if lower.contains("test") && (lower.contains("fail") || lower.contains("assert")) {
        ErrorCategory::Test
    } else if lower.contains("lint") {
        ErrorCategory::Lint
    } else if lower.contains("build") || lower.contains("compile") {
        ErrorCategory::Build
    } else {
        ErrorCategory::Unknown
    }
}

/// Transient network errors are retry-eligible, everything else is not
pub fn is_transient_error(output: &str) -> bool {
    const NETWORK_CODES: &[&str] = &[
        "ECONNREFUSED",
        "ETIMEDOUT",
        "ENOTFOUND",
        "ECONNRESET",
        "EPIPE",
        "EHOSTUNREACH",
    ];
    if NETWORK_CODES.iter().any(|code| output.contains(code)) {
        return true;
    }

    // HTTP 5xx or 429 status mentions
    let Ok(re) = regex::Regex::new(r"\b(5\d{2}|429)\b") else {
        return false;
    };
    re.is_match(output) && (output.contains("HTTP") || output.contains("status") || output.contains("http"))
}

/// Runs the configured verification commands in a working directory
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifyConfig,
    skip_typecheck: bool,
}

struct CommandOutcome {
    success: bool,
    output: String,
    timed_out: bool,
}

impl Verifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            config,
            skip_typecheck: false,
        }
    }

    /// Skip the typecheck half (the `--no-typecheck` flag)
    pub fn without_typecheck(mut self) -> Self {
        self.skip_typecheck = true;
        self
    }

    /// Run typecheck then tests in `dir`
    pub async fn run(&self, dir: &Path) -> eyre::Result<VerificationResult> {
        let files_changed = changed_files(dir).await;
        let mut has_warnings = false;

        if !self.skip_typecheck
            && let Some(command) = &self.config.typecheck_command
        {
            debug!(%command, "Running typecheck");
            let outcome = self.run_command(command, dir).await?;
            has_warnings |= outcome.output.to_lowercase().contains("warning");
            if let Some(result) =
                self.failure_result(&outcome, ErrorCategory::Typecheck, "Typecheck", &files_changed, has_warnings)
            {
                return Ok(result);
            }
        }

        if let Some(command) = &self.config.test_command {
            debug!(%command, "Running tests");
            let outcome = self.run_command(command, dir).await?;
            has_warnings |= outcome.output.to_lowercase().contains("warning");
            if let Some(result) =
                self.failure_result(&outcome, ErrorCategory::Test, "Tests", &files_changed, has_warnings)
            {
                return Ok(result);
            }
        }

        info!(files = files_changed.len(), "Verification passed");
        Ok(VerificationResult::passed(files_changed, has_warnings))
    }

    fn failure_result(
        &self,
        outcome: &CommandOutcome,
        default_category: ErrorCategory,
        label: &str,
        files_changed: &[String],
        has_warnings: bool,
    ) -> Option<VerificationResult> {
        if outcome.success {
            return None;
        }

        let category = if outcome.timed_out {
            ErrorCategory::Timeout
        } else {
            let classified = classify_failure_text(&outcome.output);
            if classified == ErrorCategory::Unknown {
                default_category
            } else {
                classified
            }
        };

        let issues = extract_issues(&outcome.output);
        warn!(%category, issues = issues.len(), "{} failed", label);

        Some(VerificationResult {
            passed: false,
            feedback: format!("{} failed:\n{}", label, tail(&outcome.output, 4000)),
            issues,
            files_changed: files_changed.to_vec(),
            has_warnings,
            category: Some(category),
        })
    }

    async fn run_command(&self, command: &str, dir: &Path) -> eyre::Result<CommandOutcome> {
        let timeout = Duration::from_millis(self.config.timeout_ms);

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(CommandOutcome {
                    success: output.status.success(),
                    output: text,
                    timed_out: false,
                })
            }
            Err(_) => Ok(CommandOutcome {
                success: false,
                output: format!("command timed out after {:?}", timeout),
                timed_out: true,
            }),
        }
    }
}

/// Changed files from `git status --porcelain`; empty outside a repo
async fn changed_files(dir: &Path) -> Vec<String> {
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.get(3..).map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Pull out the lines that look like actual issues
fn extract_issues(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("error") || lower.contains("failed") || lower.contains("assert")
        })
        .take(50)
        .map(String::from)
        .collect()
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    // Back off to a char boundary
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(typecheck: Option<&str>, test: Option<&str>) -> Verifier {
        Verifier::new(VerifyConfig {
            typecheck_command: typecheck.map(String::from),
            test_command: test.map(String::from),
            timeout_ms: 10_000,
        })
    }

    #[tokio::test]
    async fn test_passing_commands() {
        let temp = tempfile::tempdir().unwrap();
        let v = verifier(Some("true"), Some("true"));

        let result = v.run(temp.path()).await.unwrap();
        assert!(result.passed);
        assert!(result.issues.is_empty());
        assert!(result.category.is_none());
    }

    #[tokio::test]
    async fn test_failing_typecheck() {
        let temp = tempfile::tempdir().unwrap();
        let v = verifier(Some("echo 'error TS2345: type mismatch'; false"), Some("true"));

        let result = v.run(temp.path()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.category, Some(ErrorCategory::Typecheck));
        assert!(result.feedback.contains("TS2345"));
        assert_eq!(result.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_tests() {
        let temp = tempfile::tempdir().unwrap();
        let v = verifier(Some("true"), Some("echo '2 tests failed'; false"));

        let result = v.run(temp.path()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.category, Some(ErrorCategory::Test));
    }

    #[tokio::test]
    async fn test_no_typecheck_skips_it() {
        let temp = tempfile::tempdir().unwrap();
        let v = verifier(Some("false"), Some("true")).without_typecheck();

        let result = v.run(temp.path()).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_command_timeout_is_timeout_category() {
        let temp = tempfile::tempdir().unwrap();
        let v = Verifier::new(VerifyConfig {
            typecheck_command: Some("sleep 10".to_string()),
            test_command: None,
            timeout_ms: 100,
        });

        let result = v.run(temp.path()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.category, Some(ErrorCategory::Timeout));
    }

    #[tokio::test]
    async fn test_warnings_detected() {
        let temp = tempfile::tempdir().unwrap();
        let v = verifier(Some("echo 'warning: unused variable'"), Some("true"));

        let result = v.run(temp.path()).await.unwrap();
        assert!(result.passed);
        assert!(result.has_warnings);
    }

    #[test]
    fn test_classify_failure_text() {
        assert_eq!(classify_failure_text("error TS2345 somewhere"), ErrorCategory::Typecheck);
        assert_eq!(classify_failure_text("3 tests failed"), ErrorCategory::Test);
        assert_eq!(classify_failure_text("lint: unused import"), ErrorCategory::Lint);
        assert_eq!(classify_failure_text("build failed: cannot compile"), ErrorCategory::Build);
        assert_eq!(classify_failure_text("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_is_transient_error() {
        assert!(is_transient_error("connect ECONNREFUSED 127.0.0.1:443"));
        assert!(is_transient_error("getaddrinfo ENOTFOUND registry.npmjs.org"));
        assert!(is_transient_error("request failed with HTTP status 503"));
        assert!(is_transient_error("HTTP 429 from registry"));
        assert!(!is_transient_error("type error in src/main.ts"));
        assert!(!is_transient_error("assertion failed: left == right"));
    }
}
