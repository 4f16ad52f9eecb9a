//! Undercity configuration types and loading
//!
//! Defaults < `.undercityrc` (JSON, repo root) < CLI flags. An invalid
//! config is a distinct failure (exit code 2), so validation errors get
//! their own type.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::ModelTier;

/// Main Undercity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Grind loop configuration
    pub grind: GrindConfig,

    /// Rate-limit budgets and thresholds
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,

    /// Verification commands
    pub verify: VerifyConfig,

    /// Merge queue configuration
    pub merge: MergeConfig,

    /// External agent configuration
    pub agent: AgentConfig,

    /// Control daemon configuration
    pub control: ControlConfig,

    /// State directory (default .undercity)
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            grind: GrindConfig::default(),
            rate_limit: RateLimitConfig::default(),
            verify: VerifyConfig::default(),
            merge: MergeConfig::default(),
            agent: AgentConfig::default(),
            control: ControlConfig::default(),
            state_dir: PathBuf::from(".undercity"),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?
        } else {
            Self::load_default_chain()
        };

        if config.state_dir.as_os_str().is_empty() {
            config.state_dir = PathBuf::from(".undercity");
        }
        Ok(config)
    }

    fn load_default_chain() -> Self {
        // Repo-local .undercityrc wins over the user config
        let local = PathBuf::from(".undercityrc");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("undercity").join("config.json");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Self::default()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_json::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate the configuration; failures here mean exit code 2
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(1..=5).contains(&self.grind.max_concurrent) {
            return Err(format!(
                "grind.max-concurrent must be 1..=5, got {}",
                self.grind.max_concurrent
            ));
        }
        if self.grind.max_attempts == 0 {
            return Err("grind.max-attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.rate_limit.pause_threshold) {
            return Err(format!(
                "rate-limit.pause-threshold must be in [0, 1], got {}",
                self.rate_limit.pause_threshold
            ));
        }
        if self.rate_limit.warning_threshold > self.rate_limit.pause_threshold {
            return Err("rate-limit.warning-threshold must not exceed pause-threshold".to_string());
        }
        if self.control.port == 0 {
            return Err("control.port must be non-zero".to_string());
        }
        Ok(())
    }

    /// The state directory helper for this config
    pub fn state(&self) -> StateDir {
        StateDir::new(&self.state_dir)
    }

    /// Write the default config to a path (for `config --init` / `setup`)
    pub fn write_default(path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&Self::default())?;
        fs::write(path.as_ref(), json).context("Failed to write config file")?;
        Ok(())
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Environment variable containing the API key (optional; OAuth is the
    /// default path when unset)
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Model ID overrides per tier
    #[serde(rename = "model-low")]
    pub model_low: Option<String>,
    #[serde(rename = "model-mid")]
    pub model_mid: Option<String>,
    #[serde(rename = "model-top")]
    pub model_top: Option<String>,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    /// Concrete model ID for a tier
    pub fn model_id(&self, tier: ModelTier) -> String {
        let override_id = match tier {
            ModelTier::Low => &self.model_low,
            ModelTier::Mid => &self.model_mid,
            ModelTier::Top => &self.model_top,
        };
        override_id.clone().unwrap_or_else(|| tier.model_id().to_string())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            model_low: None,
            model_mid: None,
            model_top: None,
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Grind loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrindConfig {
    /// Parallel workers (1..=5)
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: u32,

    /// Global attempt cap per task
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Same-tier retries before escalating
    #[serde(rename = "max-retries-per-tier")]
    pub max_retries_per_tier: u32,

    /// Model tier override (forces the starting tier)
    #[serde(rename = "model-override")]
    pub model_override: Option<ModelTier>,

    /// Highest tier escalation may reach
    #[serde(rename = "max-tier")]
    pub max_tier: ModelTier,

    /// Review passes enabled
    pub review: bool,

    /// Skip committing results
    #[serde(rename = "no-commit")]
    pub no_commit: bool,

    /// Skip the typecheck half of verification
    #[serde(rename = "no-typecheck")]
    pub no_typecheck: bool,

    /// Consecutive no-op agent runs before declaring already-complete
    #[serde(rename = "no-op-threshold")]
    pub no_op_threshold: u32,
}

impl Default for GrindConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_attempts: 6,
            max_retries_per_tier: 2,
            model_override: None,
            max_tier: ModelTier::Top,
            review: true,
            no_commit: false,
            no_typecheck: false,
            no_op_threshold: 3,
        }
    }
}

/// Rate-limit budgets and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sonnet-equivalent token budget for the 5-hour window
    #[serde(rename = "five-hour-budget")]
    pub five_hour_budget: f64,

    /// Sonnet-equivalent token budget for the weekly window
    #[serde(rename = "weekly-budget")]
    pub weekly_budget: f64,

    /// Usage fraction that pauses new work
    #[serde(rename = "pause-threshold")]
    pub pause_threshold: f64,

    /// Usage fraction that fires a warning
    #[serde(rename = "warning-threshold")]
    pub warning_threshold: f64,

    /// Auto-pause when the pause threshold is crossed
    #[serde(rename = "auto-pause")]
    pub auto_pause: bool,

    /// Back-off when a 429 carries no retry-after header (milliseconds)
    #[serde(rename = "default-backoff-ms")]
    pub default_backoff_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            five_hour_budget: 5_000_000.0,
            weekly_budget: 50_000_000.0,
            pause_threshold: 0.95,
            warning_threshold: 0.80,
            auto_pause: true,
            default_backoff_ms: 60_000,
        }
    }
}

/// Verification commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Typecheck shell command
    #[serde(rename = "typecheck-command")]
    pub typecheck_command: Option<String>,

    /// Test shell command
    #[serde(rename = "test-command")]
    pub test_command: Option<String>,

    /// Per-command timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            typecheck_command: Some("pnpm typecheck".to_string()),
            test_command: Some("pnpm test".to_string()),
            timeout_ms: 600_000,
        }
    }
}

/// Merge strategy when auto-merge conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Default,
    Ours,
    Theirs,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ours => "ours",
            Self::Theirs => "theirs",
        }
    }
}

/// Merge queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub enabled: bool,

    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: i64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: i64,

    pub strategy: MergeStrategy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            strategy: MergeStrategy::Default,
        }
    }
}

/// External agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Shell command for the coding agent; receives the brief as JSON on
    /// stdin and emits JSON-lines events on stdout
    pub command: String,

    /// Soft timeout per agent call (milliseconds)
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "undercity-agent".to_string(),
            timeout_ms: 1_800_000,
        }
    }
}

/// Control daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { port: 7331 }
    }
}

/// State directory layout (default `.undercity/`)
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree if missing
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.logs_dir()).context("Failed to create state directory")?;
        fs::create_dir_all(self.visualizations_dir()).context("Failed to create visualizations directory")?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("undercity.db")
    }

    pub fn rate_limit_path(&self) -> PathBuf {
        self.root.join("rate-limit-state.json")
    }

    pub fn live_metrics_path(&self) -> PathBuf {
        self.root.join("live-metrics.json")
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.root.join("daemon.json")
    }

    pub fn orchestrator_lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn current_log_path(&self) -> PathBuf {
        self.logs_dir().join("current.log")
    }

    pub fn visualizations_dir(&self) -> PathBuf {
        self.root.join("visualizations")
    }

    /// Legacy JSON side-files migrated into the database on first run
    pub fn legacy_paths(&self) -> Vec<PathBuf> {
        ["decisions.json", "task-file-patterns.json", "error-fix-patterns.json", "knowledge.json"]
            .iter()
            .map(|name| self.root.join(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::load(None).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.control.port, 7331);
        assert_eq!(config.grind.max_attempts, 6);
    }

    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "llm": { "model-mid": "claude-sonnet-4-5", "max-tokens": 8192 },
            "grind": { "max-concurrent": 4, "review": false },
            "rate-limit": { "pause-threshold": 0.9 },
            "merge": { "strategy": "theirs", "max-retries": 5 }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.llm.max_tokens, 8192);
        assert_eq!(config.grind.max_concurrent, 4);
        assert!(!config.grind.review);
        assert_eq!(config.rate_limit.pause_threshold, 0.9);
        assert_eq!(config.merge.strategy, MergeStrategy::Theirs);
        assert_eq!(config.merge.max_retries, 5);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "grind": { "max-concurrent": 1 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.grind.max_concurrent, 1);
        assert_eq!(config.grind.max_attempts, 6);
        assert_eq!(config.llm.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.merge.base_delay_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_concurrency() {
        let mut config = Config::default();
        config.grind.max_concurrent = 9;
        assert!(config.validate().is_err());

        config.grind.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.rate_limit.pause_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.warning_threshold = 0.99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_id_override() {
        let mut llm = LlmConfig::default();
        assert_eq!(llm.model_id(ModelTier::Mid), ModelTier::Mid.model_id());

        llm.model_mid = Some("my-custom-model".to_string());
        assert_eq!(llm.model_id(ModelTier::Mid), "my-custom-model");
    }

    #[test]
    fn test_state_dir_layout() {
        let state = StateDir::new("/tmp/uc-test/.undercity");
        assert!(state.db_path().ends_with("undercity.db"));
        assert!(state.rate_limit_path().ends_with("rate-limit-state.json"));
        assert!(state.daemon_lock_path().ends_with("daemon.json"));
        assert!(state.current_log_path().ends_with("logs/current.log"));
        assert_eq!(state.legacy_paths().len(), 4);
    }
}
