// Configuration File Support
//
// This module provides configuration file parsing for the chaos orchestrator.
// Supports TOML format with environment variable overrides.
// The binary reads the file named on its command line (default: ./chaos.toml).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::experiment::{parse_duration, ExperimentDefinition, ExperimentSpec};
use crate::fault::LitmusConfig;
use crate::load::K6Config;
use crate::orchestrator::OrchestratorConfig;
use crate::report::VerdictPolicy;
use crate::sandbox::{CommandValidator, RunnerConfig};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "chaos.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// The experiment to run
    pub experiment: ExperimentDefinition,

    /// Pass/fail thresholds
    pub verdict: VerdictConfig,

    /// Recovery monitoring
    pub recovery: RecoveryConfig,

    /// Phase time budgets
    pub timeouts: TimeoutConfig,

    /// Command execution (kubectl, k6)
    pub sandbox: SandboxConfig,

    /// Chaos backend (Litmus)
    pub chaos: ChaosConfig,

    /// Report artifact
    pub report: ReportConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Verdict thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerdictConfig {
    /// Maximum error-rate increase over baseline (percentage points)
    pub max_error_rate_delta: f64,

    /// Maximum p99 increase over baseline in milliseconds
    pub max_p99_delta_ms: Option<f64>,

    /// Maximum error rate when no baseline was measured
    pub absolute_max_error_rate: f64,

    /// Maximum p99 when no baseline was measured
    pub absolute_max_p99_ms: Option<f64>,

    /// Longest acceptable recovery (e.g. "5m")
    pub max_recovery: String,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        let policy = VerdictPolicy::default();
        Self {
            max_error_rate_delta: policy.max_error_rate_delta,
            max_p99_delta_ms: policy.max_p99_delta_ms,
            absolute_max_error_rate: policy.absolute_max_error_rate,
            absolute_max_p99_ms: policy.absolute_max_p99_ms,
            max_recovery: "300s".to_string(),
        }
    }
}

/// Recovery monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long to wait for steady state
    pub timeout: String,

    /// Interval between readiness polls
    pub poll_interval: String,

    /// Consecutive healthy polls required
    pub consecutive_polls: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout: "300s".to_string(),
            poll_interval: "5s".to_string(),
            consecutive_polls: 2,
        }
    }
}

/// Phase time budgets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub preflight: String,
    pub load_grace: String,
    pub fault_start: String,
    pub fault_stop: String,
    pub cleanup: String,

    /// Added to the summed budgets to form the run deadline
    pub deadline_slack: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            preflight: "60s".to_string(),
            load_grace: "90s".to_string(),
            fault_start: "120s".to_string(),
            fault_stop: "120s".to_string(),
            cleanup: "120s".to_string(),
            deadline_slack: "60s".to_string(),
        }
    }
}

/// Command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// kubectl binary (name on PATH or absolute path)
    pub kubectl: String,

    /// k6 binary (name on PATH or absolute path)
    pub k6: String,

    /// k6 load script
    pub k6_script: PathBuf,

    /// Default per-command timeout
    pub command_timeout: String,

    /// Working directory for commands
    pub working_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            k6: "k6".to_string(),
            k6_script: PathBuf::from("manifests/k6/test.js"),
            command_timeout: "60s".to_string(),
            working_dir: None,
        }
    }
}

/// Chaos backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChaosConfig {
    /// Directory for per-run manifests and load summaries
    pub work_dir: PathBuf,

    /// Service account the Litmus runner uses
    pub service_account: String,

    /// Pod label key matching the deployment name
    pub app_label_key: String,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        let litmus = LitmusConfig::default();
        Self {
            work_dir: litmus.manifest_dir,
            service_account: litmus.service_account,
            app_label_key: litmus.app_label_key,
        }
    }
}

/// Report artifact configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    /// Where to write the JSON report; not written when unset
    pub path: Option<PathBuf>,
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus textfile written after the run; not written when unset
    pub textfile: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns the
    /// default configuration with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - CHAOS_LOG_LEVEL
    /// - CHAOS_LOG_FORMAT
    /// - CHAOS_NAMESPACE
    /// - CHAOS_DEPLOYMENT
    /// - CHAOS_TYPE
    /// - CHAOS_DURATION
    /// - CHAOS_LOAD_DURATION
    /// - CHAOS_LOAD_VUS
    /// - CHAOS_REPORT_PATH
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Logging overrides
        if let Some(level) = lookup("CHAOS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CHAOS_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Experiment overrides
        if let Some(namespace) = lookup("CHAOS_NAMESPACE").filter(|v| !v.is_empty()) {
            self.experiment.namespace = namespace;
        }
        if let Some(deployment) = lookup("CHAOS_DEPLOYMENT").filter(|v| !v.is_empty()) {
            self.experiment.deployment = deployment;
        }
        if let Some(chaos_type) = lookup("CHAOS_TYPE").filter(|v| !v.is_empty()) {
            self.experiment.chaos_type = chaos_type;
        }
        if let Some(duration) = lookup("CHAOS_DURATION") {
            if parse_duration(&duration).is_ok() {
                self.experiment.chaos_duration = duration;
            }
        }
        if let Some(duration) = lookup("CHAOS_LOAD_DURATION") {
            if parse_duration(&duration).is_ok() {
                self.experiment.load_duration = duration;
            }
        }
        if let Some(vus) = lookup("CHAOS_LOAD_VUS") {
            if let Ok(vus) = vus.parse::<u32>() {
                if vus > 0 {
                    self.experiment.load_vus = vus;
                }
            }
        }

        // Report overrides
        if let Some(path) = lookup("CHAOS_REPORT_PATH").filter(|v| !v.is_empty()) {
            self.report.path = Some(PathBuf::from(path));
        }

        self
    }

    /// Validate the configuration
    ///
    /// The experiment itself is checked when it is turned into an
    /// `ExperimentSpec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate thresholds
        self.verdict_policy()?;

        // Validate recovery configuration
        if self.recovery.consecutive_polls == 0 {
            anyhow::bail!("Recovery consecutive polls must be > 0");
        }
        if duration(&self.recovery.poll_interval, "recovery.poll_interval")?.is_zero() {
            anyhow::bail!("Recovery poll interval must be > 0");
        }
        duration(&self.recovery.timeout, "recovery.timeout")?;

        // Validate phase budgets
        for (name, value) in [
            ("timeouts.preflight", &self.timeouts.preflight),
            ("timeouts.load_grace", &self.timeouts.load_grace),
            ("timeouts.fault_start", &self.timeouts.fault_start),
            ("timeouts.fault_stop", &self.timeouts.fault_stop),
            ("timeouts.cleanup", &self.timeouts.cleanup),
            ("timeouts.deadline_slack", &self.timeouts.deadline_slack),
        ] {
            duration(value, name)?;
        }

        // Validate sandbox configuration
        if self.sandbox.kubectl.is_empty() {
            anyhow::bail!("sandbox.kubectl must not be empty");
        }
        if self.sandbox.k6.is_empty() {
            anyhow::bail!("sandbox.k6 must not be empty");
        }
        if duration(&self.sandbox.command_timeout, "sandbox.command_timeout")?.is_zero() {
            anyhow::bail!("sandbox.command_timeout must be > 0");
        }

        if self.chaos.service_account.is_empty() {
            anyhow::bail!("chaos.service_account must not be empty");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Build the validated experiment spec from the `[experiment]` section
    pub fn experiment_spec(&self) -> Result<ExperimentSpec> {
        ExperimentSpec::try_from(&self.experiment).context("Invalid [experiment] section")
    }

    pub fn verdict_policy(&self) -> Result<VerdictPolicy> {
        let v = &self.verdict;
        for (name, value) in [
            ("verdict.max_error_rate_delta", Some(v.max_error_rate_delta)),
            ("verdict.max_p99_delta_ms", v.max_p99_delta_ms),
            ("verdict.absolute_max_error_rate", Some(v.absolute_max_error_rate)),
            ("verdict.absolute_max_p99_ms", v.absolute_max_p99_ms),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    anyhow::bail!("{} must be a non-negative number, got {}", name, value);
                }
            }
        }

        Ok(VerdictPolicy {
            max_error_rate_delta: v.max_error_rate_delta,
            max_p99_delta_ms: v.max_p99_delta_ms,
            absolute_max_error_rate: v.absolute_max_error_rate,
            absolute_max_p99_ms: v.absolute_max_p99_ms,
            max_recovery: duration(&v.max_recovery, "verdict.max_recovery")?,
        })
    }

    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let t = &self.timeouts;
        Ok(OrchestratorConfig {
            preflight_timeout: duration(&t.preflight, "timeouts.preflight")?,
            load_grace: duration(&t.load_grace, "timeouts.load_grace")?,
            fault_start_timeout: duration(&t.fault_start, "timeouts.fault_start")?,
            fault_stop_timeout: duration(&t.fault_stop, "timeouts.fault_stop")?,
            recovery_timeout: duration(&self.recovery.timeout, "recovery.timeout")?,
            poll_interval: duration(&self.recovery.poll_interval, "recovery.poll_interval")?,
            consecutive_polls: self.recovery.consecutive_polls,
            deadline_slack: duration(&t.deadline_slack, "timeouts.deadline_slack")?,
            cleanup_timeout: duration(&t.cleanup, "timeouts.cleanup")?,
            verdict: self.verdict_policy()?,
            report_path: self.report.path.clone(),
        })
    }

    pub fn runner_config(&self) -> Result<RunnerConfig> {
        let timeout = duration(&self.sandbox.command_timeout, "sandbox.command_timeout")?;
        Ok(RunnerConfig {
            working_dir: self.sandbox.working_dir.clone(),
            ..RunnerConfig::with_timeout(timeout)
        })
    }

    /// Whitelist with the configured binaries added
    pub fn command_validator(&self) -> CommandValidator {
        let mut validator = CommandValidator::with_default_whitelist();
        validator.allow_command(self.sandbox.kubectl.clone());
        validator.allow_command(self.sandbox.k6.clone());
        validator
    }

    pub fn k6_config(&self) -> Result<K6Config> {
        Ok(K6Config {
            binary: self.sandbox.k6.clone(),
            script: self.sandbox.k6_script.clone(),
            summary_dir: self.chaos.work_dir.clone(),
            grace: duration(&self.timeouts.load_grace, "timeouts.load_grace")?,
        })
    }

    pub fn litmus_config(&self) -> Result<LitmusConfig> {
        Ok(LitmusConfig {
            kubectl: self.sandbox.kubectl.clone(),
            manifest_dir: self.chaos.work_dir.clone(),
            service_account: self.chaos.service_account.clone(),
            app_label_key: self.chaos.app_label_key.clone(),
            command_timeout: duration(&self.sandbox.command_timeout, "sandbox.command_timeout")?,
        })
    }
}

fn duration(value: &str, field: &str) -> Result<Duration> {
    parse_duration(value).with_context(|| format!("Invalid duration for {}", field))
}
