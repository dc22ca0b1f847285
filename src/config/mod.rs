//! Configuration system (layered: defaults < TOML file < env < code).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::models::ModelCatalog;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const CONFIG_FILE_NAME: &str = "config.toml";

const ENV_MODEL: &str = "TURNLOOP_MODEL";
const ENV_COMPACTION_FRACTION: &str = "TURNLOOP_COMPACTION_FRACTION";
const ENV_KEEP_RECENT_OUTPUTS: &str = "TURNLOOP_KEEP_RECENT_OUTPUTS";
const ENV_MAX_ITERATIONS: &str = "TURNLOOP_MAX_ITERATIONS";
const ENV_SESSION_DIR: &str = "TURNLOOP_SESSION_DIR";
const ENV_PERMISSION_TIMEOUT_SECS: &str = "TURNLOOP_PERMISSION_TIMEOUT_SECS";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub default_model: String,
    /// Model responses allowed in a single `run`. Retried calls do not count.
    pub max_iterations: usize,
    /// Milliseconds without a stream event before the call is abandoned. 0 disables.
    pub stream_idle_timeout_ms: u64,
    pub compaction: CompactionConfig,
    pub output: OutputConfig,
    pub retry: RetryConfig,
    pub permissions: PermissionConfig,
    pub questions: QuestionConfig,
    pub subagents: SubAgentConfig,
    /// Model-id prefix to context window, merged over the built-in table.
    pub context_windows: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            max_iterations: 50,
            stream_idle_timeout_ms: 120_000,
            compaction: CompactionConfig::default(),
            output: OutputConfig::default(),
            retry: RetryConfig::default(),
            permissions: PermissionConfig::default(),
            questions: QuestionConfig::default(),
            subagents: SubAgentConfig::default(),
            context_windows: BTreeMap::new(),
            session_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Fraction of the context window at which compaction triggers.
    pub fraction: f64,
    /// Session memory is used only while its footprint stays under this
    /// fraction of the threshold.
    pub session_memory_max_fraction: f64,
    /// Most recent messages handed to the summarizer.
    pub summary_message_count: usize,
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fraction: 0.8,
            session_memory_max_fraction: 0.5,
            summary_message_count: 40,
            summary_max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub persist_threshold_bytes: usize,
    pub preview_bytes: usize,
    pub keep_recent_persisted: usize,
    /// Hard cap applied by the dispatcher before formatting.
    pub max_raw_output_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            persist_threshold_bytes: 200_000,
            preview_bytes: 2_000,
            keep_recent_persisted: 3,
            max_raw_output_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_network_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_network_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub request_timeout_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
        }
    }
}

impl PermissionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionConfig {
    pub timeout_secs: u64,
}

impl Default for QuestionConfig {
    fn default() -> Self {
        Self { timeout_secs: 600 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgentConfig {
    pub enabled: bool,
    pub max_depth: usize,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 2,
        }
    }
}

impl RuntimeConfig {
    /// Default config file location, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "turnloop", "turnloop")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load defaults, the default config file and the process environment.
    pub fn load() -> Result<Self, RuntimeError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = match Self::default_path() {
            Some(path) => Self::from_file_or_default(&path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file_or_default(path: &Path) -> Result<Self, RuntimeError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, RuntimeError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `TURNLOOP_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = non_empty(lookup(ENV_MODEL)) {
            self.default_model = model;
        }
        if let Some(raw) = non_empty(lookup(ENV_COMPACTION_FRACTION)) {
            self.compaction.fraction = parse_env(ENV_COMPACTION_FRACTION, &raw)?;
        }
        if let Some(raw) = non_empty(lookup(ENV_KEEP_RECENT_OUTPUTS)) {
            self.output.keep_recent_persisted = parse_env(ENV_KEEP_RECENT_OUTPUTS, &raw)?;
        }
        if let Some(raw) = non_empty(lookup(ENV_MAX_ITERATIONS)) {
            self.max_iterations = parse_env(ENV_MAX_ITERATIONS, &raw)?;
        }
        if let Some(dir) = non_empty(lookup(ENV_SESSION_DIR)) {
            self.session_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = non_empty(lookup(ENV_PERMISSION_TIMEOUT_SECS)) {
            self.permissions.request_timeout_secs = parse_env(ENV_PERMISSION_TIMEOUT_SECS, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        check_fraction("compaction.fraction", self.compaction.fraction)?;
        check_fraction(
            "compaction.session_memory_max_fraction",
            self.compaction.session_memory_max_fraction,
        )?;
        if self.max_iterations == 0 {
            return Err(RuntimeError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.output.preview_bytes == 0 {
            return Err(RuntimeError::Configuration(
                "output.preview_bytes must be greater than 0".to_string(),
            ));
        }
        if self.output.preview_bytes > self.output.persist_threshold_bytes {
            return Err(RuntimeError::Configuration(format!(
                "output.preview_bytes ({}) exceeds output.persist_threshold_bytes ({})",
                self.output.preview_bytes, self.output.persist_threshold_bytes
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(RuntimeError::Configuration(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Context-window catalog with this config's overrides applied.
    pub fn model_catalog(&self) -> ModelCatalog {
        ModelCatalog::with_overrides(&self.context_windows)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, RuntimeError> {
    raw.parse::<T>()
        .map_err(|_| RuntimeError::Configuration(format!("invalid value for {key}: {raw:?}")))
}

fn check_fraction(name: &str, value: f64) -> Result<(), RuntimeError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(RuntimeError::Configuration(format!(
            "{name} must be in (0, 1], got {value}"
        )))
    }
}
