//! `sandcastle init`: Write default config, policy, and task board.

use std::path::PathBuf;

use sandcastle_config::{AppConfig, Policy};

use super::CmdResult;

pub async fn run(project: Option<PathBuf>) -> CmdResult {
    let config = super::load_config(project)?;
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("🏰 Sandcastle — Project Setup");
    println!("============================\n");
    println!("  Project root: {}", config.project_root().display());

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    }
    if config_path.exists() {
        println!("  Config exists: {}", config_path.display());
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config.toml at: {}", config_path.display());
    }

    let data_dir = config.data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        println!("✅ Created data directory: {}", data_dir.display());
    }

    let policy_path = config.policy_path();
    if policy_path.exists() {
        println!("  Policy exists: {}", policy_path.display());
    } else {
        Policy::default().save_to(&policy_path)?;
        println!("✅ Created policy.json at: {}", policy_path.display());
    }

    let tasks_path = super::default_tasks_path(&config);
    if tasks_path.exists() {
        println!("  Task board exists: {}", tasks_path.display());
    } else {
        if let Some(parent) = tasks_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tasks_path, "[]\n")?;
        println!("✅ Created empty task board: {}", tasks_path.display());
    }

    println!("\n📝 Next steps:");
    println!("   1. Review {} (allowed paths and commands)", policy_path.display());
    println!("   2. Add tasks with acceptance criteria to {}", tasks_path.display());
    println!("   3. Run: sandcastle run --task <id> --script <responses.json>\n");

    Ok(())
}
