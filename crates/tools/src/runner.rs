//! Process runner: supervised shell commands with logs, timeouts, and
//! cancellation.
//!
//! Each invocation moves `Pending → Running → {Completed | TimedOut | Errored
//! | Cancelled}`. Output is streamed line by line into
//! `<data_dir>/runs/<task_id>/<run_id>.log` and a metadata record is written
//! next to it as `<run_id>.json`. On timeout or cancellation the child's
//! process group gets SIGTERM, then SIGKILL once the grace period runs out.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sandcastle_config::RunnerConfig;
use sandcastle_core::{DomainEvent, EventBus, ToolError};
use sandcastle_security::{PolicyEngine, is_path_segment, redact_secrets};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lines of combined output kept in memory for the caller.
const OUTPUT_TAIL_LINES: usize = 200;

/// How long to wait for output pipes to drain once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A command to execute.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub cmd: String,
    /// Working directory relative to the project root
    pub cwd: Option<String>,
    /// Requested timeout; clamped to the configured maximum
    pub timeout: Option<Duration>,
    pub task_id: String,
    /// Identifier for logs and cancellation; generated when absent
    pub run_id: Option<String>,
    /// Parent token; cancelling it cancels this command
    pub cancel: Option<CancellationToken>,
}

impl CommandRequest {
    pub fn new(cmd: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
            timeout: None,
            task_id: task_id.into(),
            run_id: None,
            cancel: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of one command execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub run_id: String,
    pub command: String,
    pub cwd: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub log_path: PathBuf,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last lines of combined output, stderr prefixed
    pub output: String,
}

impl CommandResult {
    /// Text handed back to the model.
    pub fn summary(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_string()
        } else if self.cancelled {
            "cancelled".to_string()
        } else if let Some(err) = &self.error {
            format!("error: {err}")
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        let mut out = format!(
            "$ {}\n[{status}, {} ms, log: {}]",
            self.command,
            self.duration_ms,
            self.log_path.display()
        );
        if !self.output.is_empty() {
            out.push('\n');
            out.push_str(&self.output);
        }
        out
    }
}

/// Persisted per-command metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    pub run_id: String,
    pub task_id: String,
    pub command: String,
    pub cwd: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub log_path: PathBuf,
}

enum Exit {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Spawns and supervises commands for one project.
///
/// Owns the table of in-flight processes; share it with `Arc`.
pub struct ProcessRunner {
    engine: Arc<PolicyEngine>,
    data_dir: PathBuf,
    config: RunnerConfig,
    processes: Mutex<HashMap<String, CancellationToken>>,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("data_dir", &self.data_dir)
            .field("in_flight", &self.table().len())
            .finish()
    }
}

impl ProcessRunner {
    pub fn new(engine: Arc<PolicyEngine>, data_dir: impl Into<PathBuf>, config: RunnerConfig) -> Self {
        Self {
            engine,
            data_dir: data_dir.into(),
            config,
            processes: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of commands currently running.
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    pub fn log_path(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(task_id).join(format!("{run_id}.log"))
    }

    pub fn metadata_path(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(task_id).join(format!("{run_id}.json"))
    }

    fn run_dir(&self, task_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(task_id)
    }

    /// Validate, spawn, and supervise a command until it finishes.
    ///
    /// Policy rejections are errors and nothing is spawned. Failures after
    /// validation (spawn errors, wait errors) come back as an unsuccessful
    /// [`CommandResult`] with `error` set.
    pub async fn run(&self, request: CommandRequest) -> Result<CommandResult, ToolError> {
        self.engine
            .check_command(&request.cmd)
            .map_err(|v| ToolError::PolicyViolation(v.reason))?;
        check_id("task id", &request.task_id)?;

        let cwd = self
            .engine
            .check_path(request.cwd.as_deref().unwrap_or(""))
            .map_err(|v| ToolError::PolicyViolation(v.reason))?
            .absolute;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        check_id("run id", &run_id)?;

        let max = Duration::from_secs(self.config.max_timeout_secs);
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs))
            .min(max);

        let log_path = self.log_path(&request.task_id, &run_id);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(parent.display().to_string(), &e))?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| ToolError::io(log_path.display().to_string(), &e))?;

        let started_at = Utc::now();
        let started = Instant::now();
        let header = format!(
            "=== sandcastle command ===\ncommand: {}\ncwd: {}\nstarted: {}\ntimeout: {}s\n===========================\n",
            request.cmd,
            cwd.display(),
            started_at.to_rfc3339(),
            timeout.as_secs()
        );
        let header = redact_secrets(&header);
        write_log(&mut log, &header).await;

        let token = match &request.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        self.table().insert(run_id.clone(), token.clone());

        info!(run_id = %run_id, task_id = %request.task_id, command = %request.cmd, "Running command");

        let outcome = self
            .supervise(&request.cmd, &cwd, timeout, &token, log)
            .await;
        self.table().remove(&run_id);

        let duration_ms = started.elapsed().as_millis() as u64;
        let (exit_code, timed_out, cancelled, error, output, mut log) = match outcome {
            Supervised::Finished {
                exit,
                output,
                log,
            } => match exit {
                Exit::Exited(status) => (status.code(), false, false, None, output, log),
                Exit::TimedOut => (None, true, false, None, output, log),
                Exit::Cancelled => (None, false, true, None, output, log),
                Exit::WaitFailed(e) => (None, false, false, Some(e.to_string()), output, log),
            },
            Supervised::SpawnFailed { reason, log } => {
                (None, false, false, Some(reason), String::new(), Some(log))
            }
        };

        let footer = format!(
            "===========================\nexit code: {}\nduration: {duration_ms}ms\ntimed out: {timed_out}\ncancelled: {cancelled}\n{}",
            exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
            error
                .as_ref()
                .map(|e| format!("error: {e}\n"))
                .unwrap_or_default()
        );
        match log.as_mut() {
            Some(file) => {
                write_log(file, &footer).await;
                let _ = file.flush().await;
            }
            None => {
                // The writer task did not hand the file back
                if let Ok(mut file) = OpenOptions::new().append(true).open(&log_path).await {
                    write_log(&mut file, &footer).await;
                }
            }
        }

        let metadata = CommandMetadata {
            run_id: run_id.clone(),
            task_id: request.task_id.clone(),
            command: redact_secrets(&request.cmd),
            cwd: cwd.display().to_string(),
            started_at,
            completed_at: Utc::now(),
            exit_code,
            timed_out,
            log_path: log_path.clone(),
        };
        self.write_metadata(&metadata).await;

        let success = exit_code == Some(0) && !timed_out && !cancelled && error.is_none();
        if success {
            info!(run_id = %run_id, duration_ms, "Command finished");
        } else {
            warn!(
                run_id = %run_id,
                exit_code = ?exit_code,
                timed_out,
                cancelled,
                error = ?error,
                "Command did not succeed"
            );
        }

        if let Some(events) = &self.events {
            events.publish(DomainEvent::CommandFinished {
                command_run_id: run_id.clone(),
                exit_code,
                timed_out,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        Ok(CommandResult {
            run_id,
            command: request.cmd,
            cwd: metadata.cwd,
            success,
            exit_code,
            timed_out,
            cancelled,
            log_path,
            duration_ms,
            error,
            output,
        })
    }

    async fn supervise(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        token: &CancellationToken,
        mut log: File,
    ) -> Supervised {
        let mut child = match spawn_shell(cmd, cwd) {
            Ok(child) => child,
            Err(e) => {
                return Supervised::SpawnFailed {
                    reason: format!("Failed to spawn '{cmd}': {e}"),
                    log,
                };
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "", tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "[stderr] ", tx.clone()));
        }
        drop(tx);

        let writer = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
            while let Some(line) = rx.recv().await {
                write_log(&mut log, &line).await;
                write_log(&mut log, "\n").await;
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            (log, tail)
        });

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Exit::Exited(status),
                Err(e) => Exit::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Exit::TimedOut,
            _ = token.cancelled() => Exit::Cancelled,
        };

        if matches!(exit, Exit::TimedOut | Exit::Cancelled) {
            terminate(&mut child, Duration::from_secs(self.config.kill_grace_secs)).await;
        }

        let (log, output) = match tokio::time::timeout(DRAIN_TIMEOUT, writer).await {
            Ok(Ok((log, tail))) => (Some(log), Vec::from(tail).join("\n")),
            _ => {
                debug!("Output pipes did not close in time");
                (None, String::new())
            }
        };

        Supervised::Finished { exit, output, log }
    }

    /// Cancel one in-flight command. Returns whether it was running.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.table().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight command.
    pub fn cancel_all(&self) -> usize {
        let table = self.table();
        for token in table.values() {
            token.cancel();
        }
        table.len()
    }

    /// Last `n` lines of a command log.
    pub async fn tail_run_log(&self, task_id: &str, run_id: &str, n: usize) -> Result<String, ToolError> {
        check_id("task id", task_id)?;
        check_id("run id", run_id)?;
        let path = self.log_path(task_id, run_id);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound {
                    path: path.display().to_string(),
                }
            } else {
                ToolError::io(path.display().to_string(), &e)
            }
        })?;
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].join("\n"))
    }

    pub async fn read_run_metadata(&self, task_id: &str, run_id: &str) -> Result<CommandMetadata, ToolError> {
        check_id("task id", task_id)?;
        check_id("run id", run_id)?;
        let path = self.metadata_path(task_id, run_id);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound {
                    path: path.display().to_string(),
                }
            } else {
                ToolError::io(path.display().to_string(), &e)
            }
        })?;
        serde_json::from_str(&content).map_err(|e| ToolError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn write_metadata(&self, metadata: &CommandMetadata) {
        let path = self.metadata_path(&metadata.task_id, &metadata.run_id);
        let result = match serde_json::to_string_pretty(metadata) {
            Ok(json) => tokio::fs::write(&path, json).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to write command metadata");
        }
    }
}

enum Supervised {
    Finished {
        exit: Exit,
        output: String,
        log: Option<File>,
    },
    SpawnFailed {
        reason: String,
        log: File,
    },
}

/// Identifiers become path components, so they must be a single plain segment.
fn check_id(what: &str, id: &str) -> Result<(), ToolError> {
    if is_path_segment(id) {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(format!("invalid {what}: {id:?}")))
    }
}

fn spawn_shell(cmd: &str, cwd: &Path) -> std::io::Result<Child> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("/bin/sh");
        c.args(["-c", cmd]);
        c
    };
    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    command.spawn()
}

async fn forward_lines<R>(reader: R, prefix: &'static str, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut in_private_key = false;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                // Key blocks span lines, so they are dropped here rather than by the
                // single-line patterns.
                let text = if in_private_key {
                    in_private_key = !is_key_boundary(line, "END");
                    continue;
                } else if is_key_boundary(line, "BEGIN") && !is_key_boundary(line, "END") {
                    in_private_key = true;
                    format!("{prefix}[REDACTED PRIVATE KEY]")
                } else {
                    redact_secrets(&format!("{prefix}{line}"))
                };
                if tx.send(text).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

fn is_key_boundary(line: &str, edge: &str) -> bool {
    line.contains(&format!("-----{edge} ")) && line.contains("PRIVATE KEY-----")
}

async fn write_log(file: &mut File, text: &str) {
    if let Err(e) = file.write_all(text.as_bytes()).await {
        debug!(error = %e, "Failed to write command log");
    }
}

/// SIGTERM the process group, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            return;
        };
        let Ok(group) = libc::pid_t::try_from(pid) else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return;
        };
        signal_group(group, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        signal_group(group, libc::SIGKILL);
        let _ = child.wait().await;
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// The child was spawned with `process_group(0)`, so its pid is the group id.
#[cfg(unix)]
fn signal_group(group: libc::pid_t, signal: libc::c_int) {
    // SAFETY: killpg takes plain integers and touches no memory we own.
    #[allow(unsafe_code)]
    let result = unsafe { libc::killpg(group, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group already exited.
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(group, signal, error = %err, "Failed to signal process group");
        }
    }
}
