//! Configuration loading, validation, and management for Sandcastle.
//!
//! Loads configuration from `~/.sandcastle/config.toml` with environment
//! variable overrides, and the per-project [`Policy`] document.

pub mod policy;

pub use policy::{Operation, Policy, PolicyLimits};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.sandcastle/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Project the agent works in. Defaults to the current directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,

    /// Where command logs and run records go. Defaults to `<project>/.sandcastle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Policy document location. Defaults to `<project>/.sandcastle/policy.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<PathBuf>,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Process runner settings
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on steps; the policy's `maxStepsPerRun` may lower it further.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_steps() -> u32 {
    50
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.2
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            model: default_model(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Timeout applied when a command does not ask for one
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Hard ceiling on any requested timeout
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_max_timeout_secs() -> u64 {
    1800
}
fn default_kill_grace_secs() -> u64 {
    5
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.sandcastle/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `SANDCASTLE_PROJECT_ROOT`
    /// - `SANDCASTLE_DATA_DIR`
    /// - `SANDCASTLE_MAX_STEPS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(root) = std::env::var("SANDCASTLE_PROJECT_ROOT") {
            config.project_root = Some(PathBuf::from(root));
        }

        if let Ok(dir) = std::env::var("SANDCASTLE_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Ok(steps) = std::env::var("SANDCASTLE_MAX_STEPS") {
            config.agent.max_steps = steps.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "SANDCASTLE_MAX_STEPS must be a positive integer, got '{steps}'"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".sandcastle")
    }

    /// The project root, falling back to the current directory.
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory for logs and run records.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.project_root().join(".sandcastle"))
    }

    /// Location of the policy document.
    pub fn policy_path(&self) -> PathBuf {
        self.policy_path
            .clone()
            .unwrap_or_else(|| self.project_root().join(".sandcastle").join("policy.json"))
    }

    /// Load the policy this configuration points at.
    pub fn load_policy(&self) -> Result<Policy, ConfigError> {
        Policy::load_from(&self.policy_path())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.temperature < 0.0 || self.agent.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be greater than 0".into(),
            ));
        }

        if self.runner.default_timeout_secs == 0
            || self.runner.default_timeout_secs > self.runner.max_timeout_secs
        {
            return Err(ConfigError::ValidationError(
                "runner.default_timeout_secs must be in 1..=runner.max_timeout_secs".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to write {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.max_steps, 50);
        assert_eq!(config.runner.kill_grace_secs, 5);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig {
            project_root: Some(PathBuf::from("/work/app")),
            ..AppConfig::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.project_root, config.project_root);
        assert_eq!(parsed.runner.default_timeout_secs, 120);
    }

    #[test]
    fn derived_paths_follow_project_root() {
        let config = AppConfig {
            project_root: Some(PathBuf::from("/work/app")),
            ..AppConfig::default()
        };
        assert_eq!(config.data_dir(), PathBuf::from("/work/app/.sandcastle"));
        assert_eq!(
            config.policy_path(),
            PathBuf::from("/work/app/.sandcastle/policy.json")
        );
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.agent.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_above_ceiling_rejected() {
        let mut config = AppConfig::default();
        config.runner.default_timeout_secs = config.runner.max_timeout_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.agent.max_steps, 50);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "project_root = \"/srv/repo\"\n[runner]\nkill_grace_secs = 2\n",
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.project_root, Some(PathBuf::from("/srv/repo")));
        assert_eq!(config.runner.kill_grace_secs, 2);
        assert_eq!(config.runner.default_timeout_secs, 120);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("max_steps"));
        assert!(toml_str.contains("kill_grace_secs"));
    }
}
