//! `sandcastle policy`: Print the effective policy.

use std::path::PathBuf;

use super::CmdResult;

pub async fn run(project: Option<PathBuf>) -> CmdResult {
    let config = super::load_config(project)?;
    let path = config.policy_path();
    let policy = config
        .load_policy()
        .map_err(|e| format!("Failed to load policy: {e}"))?;

    if path.exists() {
        eprintln!("# {}", path.display());
    } else {
        eprintln!("# {} not found, showing defaults", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&policy)?);
    Ok(())
}
