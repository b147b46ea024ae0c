//! Subcommand implementations.

pub mod check;
pub mod exec;
pub mod init;
pub mod policy;
pub mod redact;
pub mod run;
pub mod tail;

use std::path::PathBuf;
use std::sync::Arc;

use sandcastle_config::AppConfig;
use sandcastle_security::PolicyEngine;

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Load config and apply the `--project` override.
pub fn load_config(project: Option<PathBuf>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if project.is_some() {
        config.project_root = project;
    }
    Ok(config)
}

/// Build the policy engine for the configured project.
pub fn load_engine(config: &AppConfig) -> Result<Arc<PolicyEngine>, Box<dyn std::error::Error>> {
    let policy = config
        .load_policy()
        .map_err(|e| format!("Failed to load policy: {e}"))?;
    let engine = PolicyEngine::new(config.project_root(), policy)
        .map_err(|e| format!("Invalid policy: {e}"))?;
    Ok(Arc::new(engine))
}

/// Default location of the task board.
pub fn default_tasks_path(config: &AppConfig) -> PathBuf {
    config.project_root().join(".sandcastle").join("tasks.json")
}
