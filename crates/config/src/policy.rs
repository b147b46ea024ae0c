//! The policy document: what an agent run may touch.
//!
//! Persisted as JSON (`<project>/.sandcastle/policy.json`) with camelCase
//! field names. Loaded once per task execution and never mutated mid-run.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// A filesystem operation that can be granted by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Create,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Numeric resource limits for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyLimits {
    #[serde(default = "default_max_steps")]
    pub max_steps_per_run: u32,

    #[serde(default = "default_max_files")]
    pub max_files_per_run: usize,

    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines_per_run: usize,

    #[serde(default = "default_max_runtime_minutes")]
    pub max_runtime_minutes: u64,
}

fn default_max_steps() -> u32 {
    25
}
fn default_max_files() -> usize {
    20
}
fn default_max_diff_lines() -> usize {
    2000
}
fn default_max_runtime_minutes() -> u64 {
    30
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            max_steps_per_run: default_max_steps(),
            max_files_per_run: default_max_files(),
            max_diff_lines_per_run: default_max_diff_lines(),
            max_runtime_minutes: default_max_runtime_minutes(),
        }
    }
}

/// The declarative policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Path globs the agent may read and write. Empty = whole project.
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Path globs that are always off limits (ancestors are checked too).
    #[serde(default = "default_denied_paths")]
    pub denied_paths: Vec<String>,

    /// File name patterns for secrets and keys. Always win.
    #[serde(default = "default_denied_patterns")]
    pub denied_patterns: Vec<String>,

    #[serde(default = "default_allowed_operations")]
    pub allowed_operations: Vec<Operation>,

    /// Maximum size in bytes of a single written file.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// First tokens a shell command may start with. Empty = no commands.
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Substrings that reject a command anywhere they appear (case-insensitive).
    #[serde(default = "default_denied_commands")]
    pub denied_commands: Vec<String>,

    #[serde(default)]
    pub limits: PolicyLimits,
}

fn default_denied_paths() -> Vec<String> {
    vec![".git/**".into(), "node_modules/**".into(), ".sandcastle/**".into()]
}

fn default_denied_patterns() -> Vec<String> {
    vec![
        ".env".into(),
        ".env.*".into(),
        "*.pem".into(),
        "*.key".into(),
        "*.p12".into(),
        "*.pfx".into(),
        "id_rsa*".into(),
        "id_ed25519*".into(),
        "*secret*".into(),
        "*credential*".into(),
        ".npmrc".into(),
        ".netrc".into(),
    ]
}

fn default_allowed_operations() -> Vec<Operation> {
    vec![Operation::Read, Operation::Write, Operation::Create]
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}

fn default_allowed_commands() -> Vec<String> {
    [
        "npm", "npx", "yarn", "pnpm", "node", "tsc", "jest", "vitest", "eslint", "prettier",
        "cargo", "rustc", "python", "python3", "pytest", "pip", "go", "make", "git", "ls", "cat",
        "head", "tail", "wc", "grep", "find", "echo", "pwd",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_denied_commands() -> Vec<String> {
    [
        "rm -rf",
        "sudo",
        "curl",
        "wget",
        "chmod 777",
        "mkfs",
        "dd if=",
        "git push",
        "npm publish",
        "shutdown",
        "reboot",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            denied_paths: default_denied_paths(),
            denied_patterns: default_denied_patterns(),
            allowed_operations: default_allowed_operations(),
            max_file_size: default_max_file_size(),
            allowed_commands: default_allowed_commands(),
            denied_commands: default_denied_commands(),
            limits: PolicyLimits::default(),
        }
    }
}

impl Policy {
    /// Load a policy document. A missing file yields the default policy.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No policy found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let policy: Self = serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        policy.validate()?;
        Ok(policy)
    }

    /// Write the policy as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| write_err(e.to_string()))
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "maxFileSize must be greater than 0".into(),
            ));
        }
        if self.limits.max_steps_per_run == 0 {
            return Err(ConfigError::ValidationError(
                "limits.maxStepsPerRun must be greater than 0".into(),
            ));
        }
        if self.limits.max_runtime_minutes == 0 {
            return Err(ConfigError::ValidationError(
                "limits.maxRuntimeMinutes must be greater than 0".into(),
            ));
        }
        if let Some(empty) = self
            .allowed_paths
            .iter()
            .chain(&self.denied_paths)
            .chain(&self.denied_patterns)
            .find(|p| p.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(format!(
                "path patterns must not be empty (found {empty:?})"
            )));
        }
        Ok(())
    }

    pub fn allows(&self, op: Operation) -> bool {
        self.allowed_operations.contains(&op)
    }
}
