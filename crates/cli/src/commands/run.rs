//! `sandcastle run`: Execute a task, replaying provider responses from a script.

use std::path::PathBuf;
use std::sync::Arc;

use sandcastle_agent::{AgentOrchestrator, JsonTaskStore, ScriptedProvider};
use sandcastle_core::{DomainEvent, EventBus};
use sandcastle_security::{AuditLog, TracingSink};
use sandcastle_tools::ProcessRunner;
use tokio::sync::broadcast::error::RecvError;

use super::CmdResult;

pub async fn run(
    project: Option<PathBuf>,
    task_id: String,
    tasks: Option<PathBuf>,
    script: PathBuf,
) -> CmdResult {
    let config = super::load_config(project)?;
    let engine = super::load_engine(&config)?;
    let data_dir = config.data_dir();
    let tasks_path = tasks.unwrap_or_else(|| super::default_tasks_path(&config));

    let provider = ScriptedProvider::from_file(&script)
        .map_err(|e| format!("Failed to load script {}: {e}", script.display()))?;
    tracing::debug!(script = %script.display(), "Loaded provider script");
    let store = JsonTaskStore::new(&tasks_path);
    let audit = AuditLog::new()
        .with_sinks(vec![Box::new(TracingSink)])
        .with_persistence(&data_dir);
    let events = Arc::new(EventBus::default());
    let runner = ProcessRunner::new(engine.clone(), &data_dir, config.runner.clone())
        .with_events(events.clone());

    let orchestrator = Arc::new(
        AgentOrchestrator::new(
            Arc::new(provider),
            Arc::new(store),
            Arc::new(audit),
            engine,
            Arc::new(runner),
        )
        .with_config(&config.agent)
        .with_events(events.clone()),
    );

    println!("🏰 Running task {task_id}");
    println!("   Tasks:  {}", tasks_path.display());
    println!("   Script: {}", script.display());
    println!("   Steps:  {}\n", orchestrator.effective_max_steps());

    let mut rx = events.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let canceller = orchestrator.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling run...");
            canceller.cancel();
        }
    });

    let result = orchestrator.execute(&task_id).await;
    ctrl_c.abort();
    progress.abort();
    let result = result.map_err(|e| format!("Run refused: {e}"))?;

    println!();
    println!("   Run:     {}", result.run.run_id);
    println!("   Status:  {}", result.status);
    println!("   Entries: {}", result.run.entries.len());
    if let Some(summary) = &result.run.summary {
        println!("   Summary: {summary}");
    }
    if let Ok(record) = AuditLog::run_record_path(&data_dir, &result.task.id, &result.run.run_id) {
        println!("   Record:  {}", record.display());
    }

    if result.success {
        println!("\n✅ Task {} is done", result.task.id);
        Ok(())
    } else {
        let reason = result.error.unwrap_or_else(|| result.status.to_string());
        println!("\n❌ {reason}");
        Err(format!("run ended as {}", result.status).into())
    }
}

fn print_event(event: &DomainEvent) {
    match event {
        DomainEvent::StepStarted { step, .. } => println!("── step {step}"),
        DomainEvent::ToolExecuted {
            tool_name,
            success,
            duration_ms,
            ..
        } => {
            let mark = if *success { "✓" } else { "✗" };
            println!("   {mark} {tool_name} ({duration_ms} ms)");
        }
        DomainEvent::CommandFinished {
            command_run_id,
            exit_code,
            timed_out,
            ..
        } => {
            let status = match (timed_out, exit_code) {
                (true, _) => "timed out".to_string(),
                (false, Some(code)) => format!("exit {code}"),
                (false, None) => "killed".to_string(),
            };
            println!("     command {command_run_id}: {status}");
        }
        DomainEvent::RunStarted { .. } | DomainEvent::RunFinalized { .. } => {}
    }
}
