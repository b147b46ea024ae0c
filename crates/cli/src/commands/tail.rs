//! `sandcastle tail`: Show the end of a command log.

use std::path::PathBuf;

use sandcastle_security::redact_secrets;
use sandcastle_tools::ProcessRunner;

use super::CmdResult;

pub async fn run(project: Option<PathBuf>, task: &str, run: &str, n: usize) -> CmdResult {
    let config = super::load_config(project)?;
    let engine = super::load_engine(&config)?;
    let runner = ProcessRunner::new(engine, config.data_dir(), config.runner.clone());

    if let Ok(meta) = runner.read_run_metadata(task, run).await {
        let status = if meta.timed_out {
            "timed out".to_string()
        } else {
            match meta.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "no exit code".to_string(),
            }
        };
        println!("# {} ({status}, finished {})", meta.command, meta.completed_at.to_rfc3339());
    }

    let tail = runner.tail_run_log(task, run, n).await?;
    println!("{}", redact_secrets(&tail));
    Ok(())
}
