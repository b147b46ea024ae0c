//! `sandcastle check`: Ask the policy about a path or a command.

use std::path::PathBuf;

use super::CmdResult;

pub async fn path(project: Option<PathBuf>, path: &str, write: bool) -> CmdResult {
    let config = super::load_config(project)?;
    let engine = super::load_engine(&config)?;

    let op = if write { "write" } else { "read" };
    let checked = if write {
        engine.check_write(path, None)
    } else {
        engine.check_read(path)
    };
    match checked {
        Ok(resolved) => {
            println!("✅ {op} allowed: {}", resolved.absolute.display());
            Ok(())
        }
        Err(violation) => {
            println!("❌ {op} denied ({:?}): {}", violation.kind, violation.reason);
            Err(format!("'{path}' is not allowed").into())
        }
    }
}

pub async fn command(project: Option<PathBuf>, cmd: &str) -> CmdResult {
    let config = super::load_config(project)?;
    let engine = super::load_engine(&config)?;

    match engine.check_command(cmd) {
        Ok(()) => {
            println!("✅ command allowed: {cmd}");
            Ok(())
        }
        Err(violation) => {
            println!("❌ command denied: {}", violation.reason);
            Err("command is not allowed".into())
        }
    }
}
