//! Layered configuration for rollout.
//!
//! Settings are read from `.rollout/rollout.toml`, then overridden by
//! environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_parallel = 4
//! run_timeout_secs = 1800
//! build_timeout_secs = 600
//!
//! [retry]
//! max_retries = 2
//! base_delay_ms = 500
//! retryable_exit_codes = [75]
//!
//! [platform]
//! host = "127.0.0.1"
//! base_port = 10000
//! startup_grace_ms = 1500
//!
//! [services.overrides."api-*"]
//! build_timeout_secs = 1200
//! max_retries = 3
//! ```

use crate::retry::{RetryPolicy, default_network_error_patterns};
use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ROLLOUT_DIR: &str = ".rollout";
pub const CONFIG_FILE: &str = "rollout.toml";

/// Scheduling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Maximum services building at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Budget for the whole run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Budget for one service's build, retries included
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_build_timeout_secs() -> u64 {
    600
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            run_timeout_secs: default_run_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

/// Retry policy for transient build failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retryable_exit_codes")]
    pub retryable_exit_codes: Vec<i32>,
    #[serde(default = "default_network_error_patterns")]
    pub network_error_patterns: Vec<String>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_retryable_exit_codes() -> Vec<i32> {
    vec![crate::retry::EX_TEMPFAIL]
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            retryable_exit_codes: default_retryable_exit_codes(),
            network_error_patterns: default_network_error_patterns(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            retryable_exit_codes: self.retryable_exit_codes.clone(),
            network_error_patterns: self.network_error_patterns.clone(),
        }
    }
}

/// Settings for the local deploy platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    /// Host that process services bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// First port handed out to process services
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// How long a started process must stay up to count as deployed
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    10000
}

fn default_startup_grace_ms() -> u64 {
    1500
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

/// Per-service override settings, selected by glob over the service name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceOverride {
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesSection {
    /// Pattern-based overrides (e.g. "api-*" -> ServiceOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, ServiceOverride>,
}

/// The complete rollout.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub services: ServicesSection,
}

impl RolloutToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse rollout.toml")
    }

    /// Load `rollout.toml` from the given directory, or defaults if absent.
    pub fn load_or_default(rollout_dir: &Path) -> Result<Self> {
        let config_path = rollout_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize rollout.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_parallel == 0 {
            warnings.push("engine.max_parallel is 0; it will be raised to 1".to_string());
        }
        if self.engine.run_timeout_secs == 0 {
            warnings.push("engine.run_timeout_secs is 0; every run will time out".to_string());
        }
        if self.engine.build_timeout_secs == 0 {
            warnings.push("engine.build_timeout_secs is 0; every build will time out".to_string());
        }
        for pattern in self.services.overrides.keys() {
            if let Err(e) = Pattern::new(pattern) {
                warnings.push(format!("Invalid override pattern '{}': {}", pattern, e));
            }
        }

        warnings
    }
}

/// Build settings resolved for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub build_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Everything the executor needs to schedule a run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel: usize,
    pub run_timeout: Duration,
    pub build_timeout: Duration,
    pub retry: RetryPolicy,
    pub overrides: Vec<(String, ServiceOverride)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            run_timeout: Duration::from_secs(default_run_timeout_secs()),
            build_timeout: Duration::from_secs(default_build_timeout_secs()),
            retry: RetryPolicy::default(),
            overrides: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_override(mut self, pattern: &str, override_cfg: ServiceOverride) -> Self {
        self.overrides.push((pattern.to_string(), override_cfg));
        self
    }

    /// Settings for a service, applying every matching override in order.
    pub fn settings_for(&self, service: &str) -> ServiceSettings {
        let mut settings = ServiceSettings {
            build_timeout: self.build_timeout,
            retry: self.retry.clone(),
        };
        for (pattern, override_cfg) in &self.overrides {
            let matches = Pattern::new(pattern).is_ok_and(|p| p.matches(service));
            if !matches {
                continue;
            }
            if let Some(secs) = override_cfg.build_timeout_secs {
                settings.build_timeout = Duration::from_secs(secs);
            }
            if let Some(retries) = override_cfg.max_retries {
                settings.retry.max_retries = retries;
            }
        }
        settings
    }
}

/// Runtime configuration: rollout.toml merged with environment and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub rollout_dir: PathBuf,
    pub toml: RolloutToml,
    /// CLI override for engine.max_parallel
    pub cli_max_parallel: Option<usize>,
    /// CLI override for engine.run_timeout_secs
    pub cli_run_timeout_secs: Option<u64>,
}

impl Config {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let rollout_dir = project_dir.join(ROLLOUT_DIR);
        let toml = RolloutToml::load_or_default(&rollout_dir)?;
        Ok(Self {
            project_dir,
            rollout_dir,
            toml,
            cli_max_parallel: None,
            cli_run_timeout_secs: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        max_parallel: Option<usize>,
        run_timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_max_parallel = max_parallel;
        config.cli_run_timeout_secs = run_timeout_secs;
        Ok(config)
    }

    /// CLI → ROLLOUT_MAX_PARALLEL → file → default.
    pub fn max_parallel(&self) -> usize {
        self.cli_max_parallel
            .or_else(|| env_parse("ROLLOUT_MAX_PARALLEL"))
            .unwrap_or(self.toml.engine.max_parallel)
            .max(1)
    }

    /// CLI → ROLLOUT_RUN_TIMEOUT_SECS → file → default.
    pub fn run_timeout(&self) -> Duration {
        let secs = self
            .cli_run_timeout_secs
            .or_else(|| env_parse("ROLLOUT_RUN_TIMEOUT_SECS"))
            .unwrap_or(self.toml.engine.run_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_parallel: self.max_parallel(),
            run_timeout: self.run_timeout(),
            build_timeout: Duration::from_secs(self.toml.engine.build_timeout_secs),
            retry: self.toml.retry.to_policy(),
            overrides: self
                .toml
                .services
                .overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.rollout_dir.join(CONFIG_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.rollout_dir.join("state.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.rollout_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.rollout_dir).context("Failed to create .rollout directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
