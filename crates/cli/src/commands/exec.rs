//! `sandcastle exec`: Run one command through the supervised runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sandcastle_security::redact_secrets;
use sandcastle_tools::{CommandRequest, ProcessRunner};

use super::CmdResult;

pub async fn run(
    project: Option<PathBuf>,
    cmd: String,
    cwd: Option<String>,
    timeout: Option<u64>,
    task: String,
) -> CmdResult {
    let config = super::load_config(project)?;
    let engine = super::load_engine(&config)?;
    let runner = Arc::new(ProcessRunner::new(
        engine,
        config.data_dir(),
        config.runner.clone(),
    ));

    let canceller = runner.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            canceller.cancel_all();
        }
    });

    let mut request = CommandRequest::new(cmd, task.as_str());
    if let Some(cwd) = cwd {
        request = request.with_cwd(cwd);
    }
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    let result = runner.run(request).await;
    ctrl_c.abort();
    let result = result?;

    println!("{}", redact_secrets(&result.summary()));
    println!("\n  sandcastle tail --task {task} --run {}", result.run_id);

    if result.success {
        Ok(())
    } else {
        Err(format!("command did not succeed (run {})", result.run_id).into())
    }
}
