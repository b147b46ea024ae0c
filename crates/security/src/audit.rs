//! Audit trail: the run record behind every agent execution.
//!
//! [`AuditLog`] implements [`AuditRecorder`]: it owns the current [`Run`],
//! appends entries in execution order, forwards a flat [`AuditEntry`] to each
//! configured [`AuditSink`], and optionally persists finalized runs as JSON
//! under `<data_dir>/runs/<task_id>/<run_id>.run.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sandcastle_core::error::{Error, FatalError, Result};
use sandcastle_core::run::{CommandRecord, PatchRecord, RunEntry, ToolCallRecord};
use sandcastle_core::{AuditRecorder, Run, RunFinalization, RunStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::policy::is_path_segment;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub task_id: String,
    pub event: AuditEvent,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    RunStarted,
    ToolCall { tool: String },
    Patch { path: String },
    Command { command: String },
    RunFinalized { status: RunStatus },
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

/// Where audit entries are forwarded.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            run_id = %entry.run_id,
            task_id = %entry.task_id,
            event = ?entry.event,
            outcome = ?entry.outcome,
            details = ?entry.details,
            "AUDIT"
        );
    }
}

#[derive(Default)]
struct State {
    current: Option<Run>,
    history: Vec<Run>,
}

/// In-process audit recorder.
pub struct AuditLog {
    state: Mutex<State>,
    sinks: Vec<Box<dyn AuditSink>>,
    persist_dir: Option<PathBuf>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("sink_count", &self.sinks.len())
            .field("persist_dir", &self.persist_dir)
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// In-memory only, no sinks.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            sinks: Vec::new(),
            persist_dir: None,
        }
    }

    pub fn with_sinks(mut self, sinks: Vec<Box<dyn AuditSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    /// Persist finalized runs below `data_dir`.
    pub fn with_persistence(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(data_dir.into());
        self
    }

    /// Every run finalized by this recorder, oldest first.
    pub async fn history(&self) -> Vec<Run> {
        self.state.lock().await.history.clone()
    }

    /// Location of a persisted run record. Both ids must be single path
    /// segments so the record stays below `data_dir`.
    pub fn run_record_path(data_dir: &Path, task_id: &str, run_id: &str) -> Result<PathBuf> {
        for (what, id) in [("task id", task_id), ("run id", run_id)] {
            if !is_path_segment(id) {
                return Err(Error::Fatal(FatalError::Audit(format!("invalid {what}: {id:?}"))));
            }
        }
        Ok(data_dir
            .join("runs")
            .join(task_id)
            .join(format!("{run_id}.run.json")))
    }

    /// Read a run record written by [`AuditLog::with_persistence`].
    pub fn load_run(data_dir: &Path, task_id: &str, run_id: &str) -> Result<Run> {
        let path = Self::run_record_path(data_dir, task_id, run_id)?;
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn emit(&self, run: &Run, event: AuditEvent, outcome: AuditOutcome, details: Option<String>) {
        if self.sinks.is_empty() {
            return;
        }
        let entry = AuditEntry {
            timestamp: Utc::now(),
            run_id: run.run_id.clone(),
            task_id: run.task_id.clone(),
            event,
            outcome,
            details,
        };
        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    async fn append(&self, entry: RunEntry, event: AuditEvent, outcome: AuditOutcome) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state
            .current
            .as_mut()
            .ok_or_else(|| FatalError::Audit("no run has been started".into()))?;
        run.push(entry)?;
        self.emit(run, event, outcome, None);
        Ok(())
    }

    async fn close(&self, finalization: RunFinalization) -> Result<Run> {
        let mut state = self.state.lock().await;
        let run = state
            .current
            .as_mut()
            .ok_or_else(|| FatalError::Audit("no run has been started".into()))?;
        let outcome = if finalization.success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let details = finalization.error.clone();
        run.finalize(finalization)?;
        let finished = run.clone();
        state.history.push(finished.clone());
        drop(state);

        self.emit(
            &finished,
            AuditEvent::RunFinalized {
                status: finished.status,
            },
            outcome,
            details,
        );
        // The run is already terminal in memory; a failed write must not undo that.
        if let Err(e) = self.persist(&finished) {
            tracing::warn!(run_id = %finished.run_id, error = %e, "Failed to persist run record");
        }
        Ok(finished)
    }

    fn persist(&self, run: &Run) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let path = Self::run_record_path(dir, &run.task_id, &run.run_id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(run)?)?;
        tracing::debug!(path = %path.display(), "Persisted run record");
        Ok(())
    }
}

#[async_trait]
impl AuditRecorder for AuditLog {
    async fn start(&self, task_id: &str, mode: &str) -> Result<Run> {
        let mut state = self.state.lock().await;
        if let Some(run) = &state.current
            && !run.status.is_terminal()
        {
            return Err(Error::Fatal(FatalError::Audit(format!(
                "run {} is still running",
                run.run_id
            ))));
        }
        let run = Run::start(task_id, mode);
        state.current = Some(run.clone());
        drop(state);

        self.emit(&run, AuditEvent::RunStarted, AuditOutcome::Success, None);
        Ok(run)
    }

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<()> {
        let event = AuditEvent::ToolCall {
            tool: record.tool.clone(),
        };
        let outcome = if record.success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let entry = RunEntry::ToolCall {
            at: Utc::now(),
            record,
        };
        self.append(entry, event, outcome).await
    }

    async fn record_patch(&self, record: PatchRecord) -> Result<()> {
        let event = AuditEvent::Patch {
            path: record.path.clone(),
        };
        let entry = RunEntry::Patch {
            at: Utc::now(),
            record,
        };
        self.append(entry, event, AuditOutcome::Success).await
    }

    async fn record_command(&self, record: CommandRecord) -> Result<()> {
        let event = AuditEvent::Command {
            command: record.command.clone(),
        };
        let outcome = if record.success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let entry = RunEntry::Command {
            at: Utc::now(),
            record,
        };
        self.append(entry, event, outcome).await
    }

    async fn finalize(&self, finalization: RunFinalization) -> Result<Run> {
        self.close(finalization).await
    }

    async fn cancel(&self, reason: &str) -> Result<Option<Run>> {
        let running = {
            let state = self.state.lock().await;
            state
                .current
                .as_ref()
                .is_some_and(|run| !run.status.is_terminal())
        };
        if !running {
            return Ok(None);
        }
        let run = self
            .close(RunFinalization {
                status: RunStatus::Cancelled,
                success: false,
                summary: format!("Cancelled: {reason}"),
                error: Some(reason.to_string()),
                acceptance_report: None,
            })
            .await?;
        Ok(Some(run))
    }

    async fn current_run(&self) -> Option<Run> {
        self.state.lock().await.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tool_record(step: u32, tool: &str, success: bool) -> ToolCallRecord {
        ToolCallRecord {
            step,
            tool: tool.into(),
            arguments: serde_json::json!({}),
            success,
            output_preview: String::new(),
            duration_ms: 1,
        }
    }

    fn complete() -> RunFinalization {
        RunFinalization {
            status: RunStatus::Complete,
            success: true,
            summary: "done".into(),
            error: None,
            acceptance_report: None,
        }
    }

    #[tokio::test]
    async fn entries_are_kept_in_order() {
        let log = AuditLog::new();
        log.start("T-1", "agent").await.unwrap();
        log.record_tool_call(tool_record(1, "read_file", true)).await.unwrap();
        log.record_patch(PatchRecord {
            path: "src/a.rs".into(),
            lines_added: 2,
            lines_removed: 1,
            backup_path: None,
        })
        .await
        .unwrap();
        log.record_tool_call(tool_record(2, "write_file", true)).await.unwrap();

        let run = log.finalize(complete()).await.unwrap();
        assert_eq!(run.entries.len(), 3);
        assert!(matches!(run.entries[0], RunEntry::ToolCall { .. }));
        assert!(matches!(run.entries[1], RunEntry::Patch { .. }));
        assert_eq!(run.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn recording_without_a_run_fails() {
        let log = AuditLog::new();
        assert!(log.record_tool_call(tool_record(1, "x", true)).await.is_err());
        assert!(log.finalize(complete()).await.is_err());
    }

    #[tokio::test]
    async fn finalize_twice_is_rejected() {
        let log = AuditLog::new();
        log.start("T-1", "agent").await.unwrap();
        log.finalize(complete()).await.unwrap();
        assert!(log.finalize(complete()).await.is_err());
        assert_eq!(log.history().await.len(), 1);
    }

    #[tokio::test]
    async fn cannot_start_while_running() {
        let log = AuditLog::new();
        log.start("T-1", "agent").await.unwrap();
        assert!(log.start("T-2", "agent").await.is_err());
        log.finalize(complete()).await.unwrap();
        assert!(log.start("T-2", "agent").await.is_ok());
    }

    #[tokio::test]
    async fn cancel_finalizes_running_run() {
        let log = AuditLog::new();
        log.start("T-1", "agent").await.unwrap();
        let run = log.cancel("user request").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.error.as_deref(), Some("user request"));

        assert!(log.cancel("again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persisted_run_can_be_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new().with_persistence(dir.path());
        let started = log.start("T-9", "agent").await.unwrap();
        log.record_tool_call(tool_record(1, "list_files", true)).await.unwrap();
        log.finalize(complete()).await.unwrap();

        let loaded = AuditLog::load_run(dir.path(), "T-9", &started.run_id).unwrap();
        assert_eq!(loaded.run_id, started.run_id);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn persistence_failure_still_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let log = AuditLog::new().with_persistence(&blocker);
        log.start("T-1", "agent").await.unwrap();

        let run = log.finalize(complete()).await.unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(log.history().await.len(), 1);
    }

    #[tokio::test]
    async fn run_records_stay_inside_the_data_dir() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        assert!(AuditLog::run_record_path(&data, "../../x", "r").is_err());
        assert!(AuditLog::run_record_path(&data, "T-1", "..").is_err());
        assert!(AuditLog::load_run(&data, "a/b", "r").is_err());

        let log = AuditLog::new().with_persistence(&data);
        log.start("../escape", "agent").await.unwrap();
        let run = log.finalize(complete()).await.unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        assert!(!root.path().join("escape").exists());
        assert!(!data.join("escape").exists());
    }

    #[tokio::test]
    async fn sinks_receive_every_event() {
        struct Collect(Arc<std::sync::Mutex<Vec<AuditEvent>>>);
        impl AuditSink for Collect {
            fn record(&self, entry: &AuditEntry) {
                self.0.lock().unwrap().push(entry.event.clone());
            }
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = AuditLog::new().with_sinks(vec![Box::new(Collect(seen.clone())), Box::new(TracingSink)]);
        log.start("T-1", "agent").await.unwrap();
        log.record_command(CommandRecord {
            command_run_id: "c1".into(),
            command: "npm test".into(),
            cwd: ".".into(),
            exit_code: Some(1),
            timed_out: false,
            success: false,
            log_path: "c1.log".into(),
            duration_ms: 5,
        })
        .await
        .unwrap();
        log.finalize(complete()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], AuditEvent::RunStarted);
        assert_eq!(
            seen[1],
            AuditEvent::Command {
                command: "npm test".into()
            }
        );
        assert_eq!(
            seen[2],
            AuditEvent::RunFinalized {
                status: RunStatus::Complete
            }
        );
    }
}
