//! Run records and the AuditRecorder trait.
//!
//! A [`Run`] is one bounded execution attempt of a task. It is created when
//! the orchestrator starts, receives one entry per tool call / patch /
//! command in execution order, and is finalized exactly once. A finalized run
//! is never resumed; a retry starts a new run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tool::AcceptanceResult;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Blocked,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One tool call as it was executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub step: u32,
    pub tool: String,
    /// Arguments with secrets redacted
    pub arguments: serde_json::Value,
    pub success: bool,
    /// First part of the tool output (redacted)
    pub output_preview: String,
    pub duration_ms: u64,
}

/// A file mutation produced by `write_file` or `apply_patch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    pub path: String,
    pub lines_added: usize,
    pub lines_removed: usize,
    /// Backup of the previous content, if one was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

/// An external command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_run_id: String,
    pub command: String,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub success: bool,
    pub log_path: String,
    pub duration_ms: u64,
}

/// An ordered entry in a run's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEntry {
    ToolCall {
        at: DateTime<Utc>,
        #[serde(flatten)]
        record: ToolCallRecord,
    },
    Patch {
        at: DateTime<Utc>,
        #[serde(flatten)]
        record: PatchRecord,
    },
    Command {
        at: DateTime<Utc>,
        #[serde(flatten)]
        record: CommandRecord,
    },
}

/// The terminal payload handed to [`AuditRecorder::finalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinalization {
    pub status: RunStatus,
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_report: Option<Vec<AcceptanceResult>>,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub task_id: String,
    pub mode: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<RunEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_report: Option<Vec<AcceptanceResult>>,
}

impl Run {
    /// Start a new run in the `running` state.
    pub fn start(task_id: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            mode: mode.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            entries: Vec::new(),
            summary: None,
            error: None,
            acceptance_report: None,
        }
    }

    /// Append an entry. Finalized runs are immutable.
    pub fn push(&mut self, entry: RunEntry) -> Result<()> {
        self.ensure_running()?;
        self.entries.push(entry);
        Ok(())
    }

    /// Apply the terminal payload. Fails if the run was already finalized.
    pub fn finalize(&mut self, finalization: RunFinalization) -> Result<()> {
        self.ensure_running()?;
        if !finalization.status.is_terminal() {
            return Err(Error::Internal(format!(
                "run {} cannot be finalized as 'running'",
                self.run_id
            )));
        }
        self.status = finalization.status;
        self.finished_at = Some(Utc::now());
        self.summary = Some(finalization.summary);
        self.error = finalization.error;
        self.acceptance_report = finalization.acceptance_report;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Internal(format!(
                "run {} is already {}",
                self.run_id, self.status
            )));
        }
        Ok(())
    }

    /// Log paths of every command executed during this run.
    pub fn command_logs(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                RunEntry::Command { record, .. } => Some(record.log_path.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// The external audit trail.
///
/// One recorder tracks one current run at a time.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    /// Create and return a new running run.
    async fn start(&self, task_id: &str, mode: &str) -> Result<Run>;

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<()>;

    async fn record_patch(&self, record: PatchRecord) -> Result<()>;

    async fn record_command(&self, record: CommandRecord) -> Result<()>;

    /// Finalize the current run and return its final state.
    async fn finalize(&self, finalization: RunFinalization) -> Result<Run>;

    /// Mark the current run cancelled. `None` if there is no running run.
    async fn cancel(&self, reason: &str) -> Result<Option<Run>>;

    /// Snapshot of the current (or last finalized) run.
    async fn current_run(&self) -> Option<Run>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalization(status: RunStatus) -> RunFinalization {
        RunFinalization {
            status,
            success: status == RunStatus::Complete,
            summary: "done".into(),
            error: None,
            acceptance_report: None,
        }
    }

    #[test]
    fn run_finalizes_exactly_once() {
        let mut run = Run::start("T-1", "agent");
        assert_eq!(run.status, RunStatus::Running);

        run.finalize(finalization(RunStatus::Complete)).unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        assert!(run.finished_at.is_some());

        let err = run.finalize(finalization(RunStatus::Failed)).unwrap_err();
        assert!(err.to_string().contains("already complete"));
        assert_eq!(run.status, RunStatus::Complete);
    }

    #[test]
    fn finalized_run_rejects_entries() {
        let mut run = Run::start("T-1", "agent");
        run.finalize(finalization(RunStatus::Blocked)).unwrap();
        let entry = RunEntry::Patch {
            at: Utc::now(),
            record: PatchRecord {
                path: "src/a.rs".into(),
                lines_added: 1,
                lines_removed: 0,
                backup_path: None,
            },
        };
        assert!(run.push(entry).is_err());
    }

    #[test]
    fn cannot_finalize_as_running() {
        let mut run = Run::start("T-1", "agent");
        assert!(run.finalize(finalization(RunStatus::Running)).is_err());
    }

    #[test]
    fn entries_serialize_with_type_tag() {
        let entry = RunEntry::Command {
            at: Utc::now(),
            record: CommandRecord {
                command_run_id: "r1".into(),
                command: "npm test".into(),
                cwd: ".".into(),
                exit_code: Some(0),
                timed_out: false,
                success: true,
                log_path: "/tmp/r1.log".into(),
                duration_ms: 12,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["command"], "npm test");
        assert_eq!(json["exitCode"], 0);
    }

    #[test]
    fn command_logs_in_order() {
        let mut run = Run::start("T-1", "agent");
        for (i, path) in ["a.log", "b.log"].iter().enumerate() {
            run.push(RunEntry::Command {
                at: Utc::now(),
                record: CommandRecord {
                    command_run_id: format!("r{i}"),
                    command: "ls".into(),
                    cwd: ".".into(),
                    exit_code: Some(0),
                    timed_out: false,
                    success: true,
                    log_path: (*path).into(),
                    duration_ms: 1,
                },
            })
            .unwrap();
        }
        assert_eq!(run.command_logs(), vec!["a.log", "b.log"]);
    }
}
