//! Configuration for cutover.
//!
//! Settings are read from `.cutover/cutover.toml`, then overridden by
//! `CUTOVER_*` environment variables (a `.env` file is honoured), then by CLI
//! flags. A plan's `settings` block overrides `[execution]` and `[health]`
//! for that one Execution.
//!
//! # Configuration File Format
//!
//! ```toml
//! [execution]
//! max_parallel = 4
//! progress_weighting = "phase_equal"      # or "step_count"
//! rollback_trigger = "manual"             # or "automatic"
//! issue_policy = "continue_with_warning"  # or "fail_fast"
//!
//! [steps]
//! timeout_secs = 300
//! retries = 2
//! backoff_initial_ms = 500
//! backoff_multiplier = 2.0
//! backoff_max_ms = 30000
//!
//! [health]
//! interval_ms = 5000
//! timeout_ms = 2000
//! retries = 3
//! history_len = 60
//! fatal_on_unhealthy = false
//! max_error_rate = 5.0
//! max_cpu_percent = 90.0
//! max_memory_percent = 90.0
//! max_response_time_ms = 2000.0
//! min_success_rate = 95.0
//!
//! [store]
//! path = ".cutover/cutover.db"
//!
//! [logging]
//! level = "info"
//! format = "pretty"   # or "json"
//! dir = ".cutover/logs"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plan::PlanSettings;

/// How overall Execution progress is aggregated from phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressWeighting {
    /// Every phase weighs the same regardless of size
    #[default]
    PhaseEqual,
    /// Every step weighs the same
    StepCount,
}

impl std::fmt::Display for ProgressWeighting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressWeighting::PhaseEqual => write!(f, "phase_equal"),
            ProgressWeighting::StepCount => write!(f, "step_count"),
        }
    }
}

impl std::str::FromStr for ProgressWeighting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "phase_equal" => Ok(ProgressWeighting::PhaseEqual),
            "step_count" => Ok(ProgressWeighting::StepCount),
            _ => anyhow::bail!(
                "Invalid progress weighting '{}'. Valid values: phase_equal, step_count",
                s
            ),
        }
    }
}

/// What happens when an Execution ends in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Surface the failure and wait for an explicit rollback request
    #[default]
    Manual,
    /// Start the attached rollback plan as soon as the Execution fails
    Automatic,
}

impl std::fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackTrigger::Manual => write!(f, "manual"),
            RollbackTrigger::Automatic => write!(f, "automatic"),
        }
    }
}

impl std::str::FromStr for RollbackTrigger {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(RollbackTrigger::Manual),
            "automatic" | "auto" => Ok(RollbackTrigger::Automatic),
            _ => anyhow::bail!(
                "Invalid rollback trigger '{}'. Valid values: manual, automatic",
                s
            ),
        }
    }
}

/// What an open critical Issue does to a running Execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuePolicy {
    /// Log it and keep going
    #[default]
    ContinueWithWarning,
    /// Stop dispatching steps and fail the Execution once in-flight steps drain
    FailFast,
}

impl std::fmt::Display for IssuePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssuePolicy::ContinueWithWarning => write!(f, "continue_with_warning"),
            IssuePolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

impl std::str::FromStr for IssuePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue_with_warning" | "continue" => Ok(IssuePolicy::ContinueWithWarning),
            "fail_fast" => Ok(IssuePolicy::FailFast),
            _ => anyhow::bail!(
                "Invalid issue policy '{}'. Valid values: continue_with_warning, fail_fast",
                s
            ),
        }
    }
}

/// `[execution]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Maximum number of phases running at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub progress_weighting: ProgressWeighting,
    #[serde(default)]
    pub rollback_trigger: RollbackTrigger,
    #[serde(default)]
    pub issue_policy: IssuePolicy,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            progress_weighting: ProgressWeighting::default(),
            rollback_trigger: RollbackTrigger::default(),
            issue_policy: IssuePolicy::default(),
        }
    }
}

/// `[steps]` section: defaults for steps that don't set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepsSection {
    /// Per-attempt timeout
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt
    #[serde(default = "default_step_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_step_retries() -> u32 {
    2
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for StepsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_step_timeout_secs(),
            retries: default_step_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl StepsSection {
    /// Delay before retry number `retry` (1-based): `initial * multiplier^(retry-1)`, capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = self.backoff_initial_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms as f64) as u64)
    }
}

/// `[health]` section: sampling cadence, classification and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Per-sample timeout; a timed-out sample counts as one failure
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failed samples before `unhealthy`
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    /// Metrics snapshots retained for trend display
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Fail the Execution when health reaches `unhealthy`
    #[serde(default)]
    pub fatal_on_unhealthy: bool,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: Option<f64>,
    #[serde(default = "default_max_utilisation")]
    pub max_cpu_percent: Option<f64>,
    #[serde(default = "default_max_utilisation")]
    pub max_memory_percent: Option<f64>,
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: Option<f64>,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: Option<f64>,
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_health_retries() -> u32 {
    3
}

fn default_history_len() -> usize {
    60
}

fn default_max_error_rate() -> Option<f64> {
    Some(5.0)
}

fn default_max_utilisation() -> Option<f64> {
    Some(90.0)
}

fn default_max_response_time_ms() -> Option<f64> {
    Some(2_000.0)
}

fn default_min_success_rate() -> Option<f64> {
    Some(95.0)
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            retries: default_health_retries(),
            history_len: default_history_len(),
            fatal_on_unhealthy: false,
            max_error_rate: default_max_error_rate(),
            max_cpu_percent: default_max_utilisation(),
            max_memory_percent: default_max_utilisation(),
            max_response_time_ms: default_max_response_time_ms(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

impl HealthSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// SQLite database path, relative to the project directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Process log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive when RUST_LOG/CUTOVER_LOG are unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily-rolling log file; stderr only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Settings resolved for one Execution: config file, environment and plan overrides applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub max_parallel: usize,
    pub progress_weighting: ProgressWeighting,
    pub rollback_trigger: RollbackTrigger,
    pub issue_policy: IssuePolicy,
    pub steps: StepsSection,
    pub health: HealthSection,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        CutoverToml::default().execution_settings(&PlanSettings::default())
    }
}

impl ExecutionSettings {
    pub fn step_timeout(&self, override_secs: Option<u64>) -> Duration {
        Duration::from_secs(override_secs.unwrap_or(self.steps.timeout_secs).max(1))
    }

    pub fn step_retries(&self, override_retries: Option<u32>) -> u32 {
        override_retries.unwrap_or(self.steps.retries)
    }
}

/// Contents of `cutover.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CutoverToml {
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub steps: StepsSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl CutoverToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cutover.toml")
    }

    /// Load `cutover.toml` from the given directory, or defaults if it doesn't exist.
    pub fn load_or_default(cutover_dir: &Path) -> Result<Self> {
        let config_path = cutover_dir.join("cutover.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cutover.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CUTOVER_*` environment overrides. Unparseable values are reported, not ignored.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("CUTOVER_MAX_PARALLEL") {
            self.execution.max_parallel = val
                .parse()
                .with_context(|| format!("Invalid CUTOVER_MAX_PARALLEL '{}'", val))?;
        }
        if let Ok(val) = std::env::var("CUTOVER_ROLLBACK_TRIGGER") {
            self.execution.rollback_trigger = val.parse()?;
        }
        if let Ok(val) = std::env::var("CUTOVER_ISSUE_POLICY") {
            self.execution.issue_policy = val.parse()?;
        }
        if let Ok(val) = std::env::var("CUTOVER_DB") {
            self.store.path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("CUTOVER_LOG_FORMAT") {
            self.logging.format = val.parse()?;
        }
        if let Ok(val) = std::env::var("CUTOVER_PORT") {
            self.server.port = val
                .parse()
                .with_context(|| format!("Invalid CUTOVER_PORT '{}'", val))?;
        }
        Ok(())
    }

    /// Resolve the settings for one Execution, applying the plan's overrides.
    pub fn execution_settings(&self, overrides: &PlanSettings) -> ExecutionSettings {
        ExecutionSettings {
            max_parallel: overrides
                .max_parallel
                .unwrap_or(self.execution.max_parallel)
                .max(1),
            progress_weighting: overrides
                .progress_weighting
                .unwrap_or(self.execution.progress_weighting),
            rollback_trigger: overrides
                .rollback_trigger
                .unwrap_or(self.execution.rollback_trigger),
            issue_policy: overrides.issue_policy.unwrap_or(self.execution.issue_policy),
            steps: self.steps.clone(),
            health: overrides
                .health
                .clone()
                .unwrap_or_else(|| self.health.clone()),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.max_parallel == 0 {
            warnings.push("max_parallel = 0 is treated as 1".to_string());
        }
        if self.steps.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "backoff_multiplier {} is below 1.0; retries will not back off",
                self.steps.backoff_multiplier
            ));
        }
        if self.health.retries == 0 {
            warnings.push(
                "health retries = 0: the first failed sample marks the system unhealthy"
                    .to_string(),
            );
        }
        if self.health.timeout_ms >= self.health.interval_ms {
            warnings.push(format!(
                "health timeout_ms ({}) is not below interval_ms ({})",
                self.health.timeout_ms, self.health.interval_ms
            ));
        }

        warnings
    }
}

/// Configuration combining `cutover.toml`, the environment and CLI flags.
#[derive(Debug, Clone)]
pub struct CutoverConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .cutover directory
    pub cutover_dir: PathBuf,
    /// Parsed and env-overridden cutover.toml
    pub toml: CutoverToml,
    /// CLI override: verbose mode
    pub verbose: bool,
}

impl CutoverConfig {
    /// Create a new CutoverConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let cutover_dir = project_dir.join(".cutover");
        let mut toml = CutoverToml::load_or_default(&cutover_dir)?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            cutover_dir,
            toml,
            verbose: false,
        })
    }

    /// Create CutoverConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_parallel: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(n) = max_parallel {
            config.toml.execution.max_parallel = n;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.cutover_dir.join("cutover.toml")
    }

    /// SQLite path (config/env → `.cutover/cutover.db`), resolved against the project directory.
    pub fn store_path(&self) -> PathBuf {
        match &self.toml.store.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.project_dir.join(path),
            None => self.cutover_dir.join("cutover.db"),
        }
    }

    /// Log file directory, if file logging is configured.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            }
        })
    }

    pub fn execution_settings(&self, overrides: &PlanSettings) -> ExecutionSettings {
        self.toml.execution_settings(overrides)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = CutoverToml::parse("").unwrap();
        assert_eq!(config.execution.max_parallel, 4);
        assert_eq!(config.execution.rollback_trigger, RollbackTrigger::Manual);
        assert_eq!(config.execution.issue_policy, IssuePolicy::ContinueWithWarning);
        assert_eq!(config.steps.retries, 2);
        assert_eq!(config.health.retries, 3);
        assert_eq!(config.health.max_error_rate, Some(5.0));
        assert_eq!(config.server.port, 3141);
    }

    #[test]
    fn test_parse_sections() {
        let config = CutoverToml::parse(
            r#"
[execution]
max_parallel = 2
progress_weighting = "step_count"
rollback_trigger = "automatic"
issue_policy = "fail_fast"

[steps]
timeout_secs = 30

[health]
interval_ms = 1000
fatal_on_unhealthy = true

[logging]
format = "json"
"#,
        )
        .unwrap();

        assert_eq!(config.execution.max_parallel, 2);
        assert_eq!(config.execution.progress_weighting, ProgressWeighting::StepCount);
        assert_eq!(config.execution.rollback_trigger, RollbackTrigger::Automatic);
        assert_eq!(config.execution.issue_policy, IssuePolicy::FailFast);
        assert_eq!(config.steps.timeout_secs, 30);
        assert_eq!(config.steps.retries, 2);
        assert!(config.health.fatal_on_unhealthy);
        assert_eq!(config.health.timeout_ms, 2000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_invalid_enum() {
        let err = CutoverToml::parse("[execution]\nissue_policy = \"panic\"\n").unwrap_err();
        assert!(err.to_string().contains("cutover.toml"));
    }

    #[test]
    fn test_enum_from_str() {
        assert_eq!(
            "automatic".parse::<RollbackTrigger>().unwrap(),
            RollbackTrigger::Automatic
        );
        assert_eq!("FAIL_FAST".parse::<IssuePolicy>().unwrap(), IssuePolicy::FailFast);
        assert!("sometimes".parse::<RollbackTrigger>().is_err());
        assert_eq!(ProgressWeighting::StepCount.to_string(), "step_count");
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let steps = StepsSection {
            backoff_initial_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 500,
            ..Default::default()
        };
        assert_eq!(steps.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(steps.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(steps.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(steps.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(steps.backoff_delay(100), Duration::from_millis(500));
    }

    #[test]
    fn test_plan_overrides_win() {
        let config = CutoverToml::default();
        let overrides = PlanSettings {
            max_parallel: Some(1),
            issue_policy: Some(IssuePolicy::FailFast),
            ..Default::default()
        };
        let settings = config.execution_settings(&overrides);
        assert_eq!(settings.max_parallel, 1);
        assert_eq!(settings.issue_policy, IssuePolicy::FailFast);
        assert_eq!(settings.rollback_trigger, RollbackTrigger::Manual);
    }

    #[test]
    fn test_zero_parallel_clamped() {
        let mut config = CutoverToml::default();
        config.execution.max_parallel = 0;
        assert_eq!(config.execution_settings(&PlanSettings::default()).max_parallel, 1);
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_step_overrides() {
        let settings = ExecutionSettings::default();
        assert_eq!(settings.step_timeout(None), Duration::from_secs(300));
        assert_eq!(settings.step_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(settings.step_retries(Some(0)), 0);
        assert_eq!(settings.step_retries(None), 2);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cutover.toml");
        let mut config = CutoverToml::default();
        config.execution.max_parallel = 7;
        config.save(&path).unwrap();

        let loaded = CutoverToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.execution.max_parallel, 7);
    }

    #[test]
    fn test_load_or_default_missing() {
        let dir = tempdir().unwrap();
        let config = CutoverToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.execution.max_parallel, 4);
    }

    #[test]
    fn test_store_path_resolution() {
        let dir = tempdir().unwrap();
        let mut config = CutoverConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.store.path = None;
        assert!(config.store_path().ends_with(".cutover/cutover.db"));
        config.toml.store.path = Some(PathBuf::from("data/x.db"));
        assert_eq!(config.store_path(), config.project_dir.join("data/x.db"));
    }
}
