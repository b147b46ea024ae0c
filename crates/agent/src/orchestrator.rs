//! The agent orchestrator: a bounded step loop around one task.
//!
//! ```text
//! Idle ──execute──▶ Running ──┬──▶ Complete   (task_complete, every criterion passed)
//!                             ├──▶ Blocked    (task_blocked)
//!                             ├──▶ Failed     (task_failed, fatal error, limits, unmet criteria)
//!                             └──▶ Cancelled  (cancel())
//! ```
//!
//! Each step asks the provider for the next action, dispatches the requested
//! tool calls in order, and feeds the (redacted) results back into the
//! transcript. Every terminal outcome finalizes the run exactly once and
//! posts exactly one comment on the task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use sandcastle_config::AgentConfig;
use sandcastle_core::run::{CommandRecord, PatchRecord, ToolCallRecord};
use sandcastle_core::tool::tool_definitions;
use sandcastle_core::{
    AcceptanceResult, AuditRecorder, DomainEvent, EventBus, FatalError, FinishReason, Message,
    MessageToolCall, Provider, ProviderRequest, Run, RunFinalization, RunStatus, StopSignal, Task,
    TaskComment, TaskStatus, TaskStore, ToolCall, Transcript,
};
use sandcastle_security::{PolicyEngine, RuntimeStats, redact_secrets};
use sandcastle_tools::{ProcessRunner, SandboxedFileOps};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatched, ToolDispatcher};
use crate::prompt;

/// Author name on task comments.
pub const COMMENT_AUTHOR: &str = "sandcastle";

const RUN_MODE: &str = "agent";
const OUTPUT_PREVIEW_CHARS: usize = 500;

const COMPLETION_NUDGE: &str = "You have not called a tool. If the task is finished, call \
task_complete with one acceptance result per criterion; otherwise continue working or call \
task_blocked / task_failed.";

/// Why `execute` refused to start a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} is marked human-only and cannot be run by the agent")]
    HumanOnly(String),

    #[error("Task {0} has no acceptance criteria")]
    NoAcceptanceCriteria(String),

    #[error("Task store error: {0}")]
    TaskStore(#[source] sandcastle_core::Error),

    #[error("Audit recorder error: {0}")]
    Audit(#[source] sandcastle_core::Error),
}

/// The result of one finished run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub status: RunStatus,
    pub run: Run,
    /// The task as it stands after the run's comment and status update
    pub task: Task,
    pub error: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone)]
enum Outcome {
    Complete {
        summary: String,
        acceptance: Vec<AcceptanceResult>,
    },
    Blocked {
        reason: String,
        question: String,
    },
    Failed {
        reason: String,
        next_steps: Option<String>,
        acceptance: Option<Vec<AcceptanceResult>>,
    },
    Cancelled {
        reason: String,
    },
}

impl Outcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            next_steps: None,
            acceptance: None,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled {
            reason: "cancellation requested".into(),
        }
    }

    fn status(&self) -> RunStatus {
        match self {
            Self::Complete { .. } => RunStatus::Complete,
            Self::Blocked { .. } => RunStatus::Blocked,
            Self::Failed { .. } => RunStatus::Failed,
            Self::Cancelled { .. } => RunStatus::Cancelled,
        }
    }

    /// Terminal signals become outcomes; completion goes through the acceptance gate.
    fn from_signal(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Complete {
                summary,
                acceptance_results,
            } => acceptance_gate(summary, acceptance_results),
            StopSignal::Blocked { reason, question } => Self::Blocked { reason, question },
            StopSignal::Failed { reason, next_steps } => Self::Failed {
                reason,
                next_steps,
                acceptance: None,
            },
        }
    }
}

/// A completion claim passes only with at least one result and no failures.
fn acceptance_gate(summary: String, acceptance: Vec<AcceptanceResult>) -> Outcome {
    if acceptance.is_empty() {
        return Outcome::Failed {
            reason: "task_complete was called without acceptance results".into(),
            next_steps: Some("Report one acceptance result per criterion, with evidence".into()),
            acceptance: Some(acceptance),
        };
    }
    let unmet: Vec<&str> = acceptance
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.criterion.as_str())
        .collect();
    if !unmet.is_empty() {
        return Outcome::Failed {
            reason: format!("Acceptance criteria not met: {}", unmet.join("; ")),
            next_steps: None,
            acceptance: Some(acceptance),
        };
    }
    Outcome::Complete {
        summary,
        acceptance,
    }
}

/// What one step produced.
enum StepOutcome {
    Continue,
    Finished(Outcome),
}

/// Per-run state. Owned by exactly one `execute` call.
struct RunContext {
    task: Task,
    run_id: String,
    started: Instant,
    transcript: Transcript,
    file_ops: SandboxedFileOps,
    token: CancellationToken,
    command_logs: Vec<String>,
}

/// Drives a provider through the tool surface until the task reaches a
/// terminal state.
pub struct AgentOrchestrator {
    provider: Arc<dyn Provider>,
    tasks: Arc<dyn TaskStore>,
    audit: Arc<dyn AuditRecorder>,
    engine: Arc<PolicyEngine>,
    runner: Arc<ProcessRunner>,
    events: Option<Arc<EventBus>>,
    model: String,
    temperature: f32,
    max_steps: u32,
    cancel: Mutex<CancellationToken>,
}

impl AgentOrchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        tasks: Arc<dyn TaskStore>,
        audit: Arc<dyn AuditRecorder>,
        engine: Arc<PolicyEngine>,
        runner: Arc<ProcessRunner>,
    ) -> Self {
        let defaults = AgentConfig::default();
        Self {
            provider,
            tasks,
            audit,
            engine,
            runner,
            events: None,
            model: defaults.model,
            temperature: defaults.temperature,
            max_steps: defaults.max_steps,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Apply model, temperature, and step settings from config.
    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.model = config.model.clone();
        self.temperature = config.temperature;
        self.max_steps = config.max_steps;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// The step budget actually enforced: the configured maximum, capped by
    /// the policy's `maxStepsPerRun`.
    pub fn effective_max_steps(&self) -> u32 {
        self.max_steps
            .min(self.engine.policy().limits.max_steps_per_run)
    }

    /// Cancel the current run and every command it has in flight.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.token().cancel();
        let killed = self.runner.cancel_all();
        if killed > 0 {
            debug!(processes = killed, "Signalled in-flight commands");
        }
    }

    /// The token of the current (or most recent) run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token().clone()
    }

    fn token(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Run one task to a terminal state.
    ///
    /// Returns `Err` only when the run was refused before it started; every
    /// outcome after that, including failures, is an `Ok(RunResult)`.
    pub async fn execute(&self, task_id: &str) -> Result<RunResult, OrchestratorError> {
        // Installed first so a cancel() during the checks below is not lost.
        let token = CancellationToken::new();
        *self.token() = token.clone();

        let task = self
            .tasks
            .get_task(task_id)
            .await
            .map_err(OrchestratorError::TaskStore)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if task.human_only {
            warn!(task_id, "Refusing human-only task");
            return Err(OrchestratorError::HumanOnly(task.id));
        }
        if task.acceptance_criteria.is_empty() {
            warn!(task_id, "Refusing task without acceptance criteria");
            return Err(OrchestratorError::NoAcceptanceCriteria(task.id));
        }

        let run = self
            .audit
            .start(&task.id, RUN_MODE)
            .await
            .map_err(OrchestratorError::Audit)?;

        info!(
            task_id = %task.id,
            run_id = %run.run_id,
            provider = self.provider.name(),
            max_steps = self.effective_max_steps(),
            "Run started"
        );
        self.publish(DomainEvent::RunStarted {
            task_id: task.id.clone(),
            run_id: run.run_id.clone(),
            timestamp: Utc::now(),
        });

        if let Err(e) = self.tasks.set_status(&task.id, TaskStatus::InProgress).await {
            warn!(task_id = %task.id, error = %e, "Failed to mark task in progress");
        }

        let mut transcript = Transcript::new();
        transcript.push(prompt::system_message());
        transcript.push(prompt::task_message(&task));

        let mut ctx = RunContext {
            task,
            run_id: run.run_id,
            started: Instant::now(),
            transcript,
            file_ops: SandboxedFileOps::new(self.engine.clone()),
            token,
            command_logs: Vec::new(),
        };

        let outcome = match self.drive(&mut ctx).await {
            Ok(outcome) => outcome,
            Err(fatal) => {
                warn!(run_id = %ctx.run_id, error = %fatal, "Run failed");
                Outcome::failed(fatal.to_string())
            }
        };

        self.finish(ctx, outcome).await
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<Outcome, FatalError> {
        let max_steps = self.effective_max_steps();
        for step in 1..=max_steps {
            if ctx.token.is_cancelled() {
                return Ok(Outcome::cancelled());
            }
            match self.step(ctx, step).await? {
                StepOutcome::Continue => {}
                StepOutcome::Finished(outcome) => return Ok(outcome),
            }
        }
        Err(FatalError::StepLimitExceeded(max_steps))
    }

    async fn step(&self, ctx: &mut RunContext, step: u32) -> Result<StepOutcome, FatalError> {
        let stats = RuntimeStats {
            elapsed: ctx.started.elapsed(),
            steps_executed: step - 1,
            files_touched: ctx.file_ops.touched_files().len(),
        };
        self.engine
            .check_runtime_limits(&stats)
            .map_err(|v| FatalError::RuntimeLimitExceeded(v.reason))?;

        debug!(run_id = %ctx.run_id, step, "Step started");
        self.publish(DomainEvent::StepStarted {
            run_id: ctx.run_id.clone(),
            step,
            timestamp: Utc::now(),
        });

        let request = ProviderRequest {
            model: self.model.clone(),
            messages: ctx.transcript.messages.clone(),
            temperature: self.temperature,
            tools: tool_definitions(),
        };
        let response = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Ok(StepOutcome::Finished(Outcome::cancelled())),
            response = self.provider.complete(request) => response?,
        };

        let finish_reason = response.finish_reason;
        let message = response.message;
        ctx.transcript.push(message.clone());

        match finish_reason {
            FinishReason::Length => return Err(FatalError::ResponseTooLong),
            FinishReason::Error => {
                return Ok(StepOutcome::Finished(Outcome::failed(format!(
                    "Provider reported an error: {}",
                    message.content.trim()
                ))));
            }
            FinishReason::Stop | FinishReason::ToolCalls => {}
        }

        if message.tool_calls.is_empty() {
            if finish_reason == FinishReason::Stop && !claims_completion(&message.content) {
                return Ok(StepOutcome::Finished(Outcome::failed(
                    "Model stopped without completing the task",
                )));
            }
            debug!(run_id = %ctx.run_id, step, "No tool call; nudging model");
            ctx.transcript.push(Message::user(COMPLETION_NUDGE));
            return Ok(StepOutcome::Continue);
        }

        for call in &message.tool_calls {
            if ctx.token.is_cancelled() {
                return Ok(StepOutcome::Finished(Outcome::cancelled()));
            }
            if let Some(outcome) = self.execute_call(ctx, step, call).await? {
                return Ok(StepOutcome::Finished(outcome));
            }
        }
        Ok(StepOutcome::Continue)
    }

    /// Parse, dispatch, and record one tool call.
    async fn execute_call(
        &self,
        ctx: &mut RunContext,
        step: u32,
        call: &MessageToolCall,
    ) -> Result<Option<Outcome>, FatalError> {
        let started = Instant::now();
        let dispatcher = ToolDispatcher {
            file_ops: &ctx.file_ops,
            runner: &self.runner,
            task_id: &ctx.task.id,
            cancel: &ctx.token,
        };
        let (arguments, dispatched) = match ToolCall::from_message(call) {
            Ok(parsed) => {
                let dispatched = match parsed.parse() {
                    Ok(invocation) => dispatcher.dispatch(invocation).await,
                    Err(e) => Dispatched::error(&e),
                };
                (parsed.arguments, dispatched)
            }
            Err(e) => (
                serde_json::Value::String(call.arguments.clone()),
                Dispatched::error(&e),
            ),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let output = redact_secrets(&dispatched.result.output);

        info!(
            run_id = %ctx.run_id,
            step,
            tool = %call.name,
            success = dispatched.success,
            duration_ms,
            "Tool executed"
        );

        self.audit
            .record_tool_call(ToolCallRecord {
                step,
                tool: call.name.clone(),
                arguments: redact_arguments(&arguments),
                success: dispatched.success,
                output_preview: preview(&output),
                duration_ms,
            })
            .await
            .map_err(|e| FatalError::Audit(e.to_string()))?;

        if let Some(change) = &dispatched.change {
            self.audit
                .record_patch(PatchRecord {
                    path: change.path.clone(),
                    lines_added: change.lines_added,
                    lines_removed: change.lines_removed,
                    backup_path: change.backup_path.clone(),
                })
                .await
                .map_err(|e| FatalError::Audit(e.to_string()))?;
        }

        if let Some(command) = &dispatched.command {
            let log_path = command.log_path.display().to_string();
            self.audit
                .record_command(CommandRecord {
                    command_run_id: command.run_id.clone(),
                    command: redact_secrets(&command.command),
                    cwd: command.cwd.clone(),
                    exit_code: command.exit_code,
                    timed_out: command.timed_out,
                    success: command.success,
                    log_path: log_path.clone(),
                    duration_ms: command.duration_ms,
                })
                .await
                .map_err(|e| FatalError::Audit(e.to_string()))?;
            ctx.command_logs.push(log_path);
        }

        ctx.transcript.push(Message::tool_result(&call.id, output));
        self.publish(DomainEvent::ToolExecuted {
            run_id: ctx.run_id.clone(),
            tool_name: call.name.clone(),
            success: dispatched.success,
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(dispatched.result.stop.map(Outcome::from_signal))
    }

    /// Finalize the run, comment on the task, and update its status.
    async fn finish(
        &self,
        ctx: RunContext,
        outcome: Outcome,
    ) -> Result<RunResult, OrchestratorError> {
        let status = outcome.status();
        let success = status == RunStatus::Complete;
        let error = match &outcome {
            Outcome::Failed { reason, .. } | Outcome::Cancelled { reason } => Some(reason.clone()),
            Outcome::Blocked { reason, .. } => Some(format!("Blocked: {reason}")),
            Outcome::Complete { .. } => None,
        };

        let finalized = match &outcome {
            Outcome::Cancelled { reason } => self.audit.cancel(reason).await,
            _ => self
                .audit
                .finalize(finalization(&outcome))
                .await
                .map(Some),
        };
        let finalized = match finalized {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "Failed to finalize run");
                None
            }
        };

        // The comment goes out whatever happened to the audit record.
        let body = redact_secrets(&comment_body(&ctx.run_id, &outcome, &ctx.command_logs));
        if let Err(e) = self
            .tasks
            .add_comment(&ctx.task.id, TaskComment::new(COMMENT_AUTHOR, body))
            .await
        {
            warn!(task_id = %ctx.task.id, error = %e, "Failed to post run comment");
        }
        if success {
            if let Err(e) = self.tasks.set_status(&ctx.task.id, TaskStatus::Done).await {
                warn!(task_id = %ctx.task.id, error = %e, "Failed to mark task done");
            }
        }

        let run = match finalized {
            Some(run) => run,
            None => self.audit.current_run().await.ok_or_else(|| {
                OrchestratorError::Audit(sandcastle_core::Error::Internal(format!(
                    "run {} disappeared before it was finalized",
                    ctx.run_id
                )))
            })?,
        };

        info!(
            task_id = %ctx.task.id,
            run_id = %ctx.run_id,
            status = %status,
            elapsed_ms = ctx.started.elapsed().as_millis() as u64,
            "Run finalized"
        );
        self.publish(DomainEvent::RunFinalized {
            task_id: ctx.task.id.clone(),
            run_id: ctx.run_id.clone(),
            status,
            timestamp: Utc::now(),
        });

        let task = match self.tasks.get_task(&ctx.task.id).await {
            Ok(Some(task)) => task,
            _ => ctx.task,
        };
        Ok(RunResult {
            success,
            status,
            run,
            task,
            error,
        })
    }
}

fn finalization(outcome: &Outcome) -> RunFinalization {
    match outcome {
        Outcome::Complete {
            summary,
            acceptance,
        } => RunFinalization {
            status: RunStatus::Complete,
            success: true,
            summary: summary.clone(),
            error: None,
            acceptance_report: Some(acceptance.clone()),
        },
        Outcome::Blocked { reason, .. } => RunFinalization {
            status: RunStatus::Blocked,
            success: false,
            summary: format!("Blocked: {reason}"),
            error: None,
            acceptance_report: None,
        },
        Outcome::Failed {
            reason, acceptance, ..
        } => RunFinalization {
            status: RunStatus::Failed,
            success: false,
            summary: format!("Failed: {reason}"),
            error: Some(reason.clone()),
            acceptance_report: acceptance.clone(),
        },
        Outcome::Cancelled { reason } => RunFinalization {
            status: RunStatus::Cancelled,
            success: false,
            summary: format!("Cancelled: {reason}"),
            error: Some(reason.clone()),
            acceptance_report: None,
        },
    }
}

fn comment_body(run_id: &str, outcome: &Outcome, command_logs: &[String]) -> String {
    let mut body = match outcome {
        Outcome::Complete {
            summary,
            acceptance,
        } => format!(
            "Run {run_id} completed.\n\n{}\n\nAcceptance criteria:\n{}",
            summary.trim(),
            acceptance_lines(acceptance)
        ),
        Outcome::Blocked { reason, question } => {
            let mut body = format!("Run {run_id} is blocked: {reason}");
            if !question.trim().is_empty() {
                body.push_str(&format!("\n\nQuestion: {}", question.trim()));
            }
            body
        }
        Outcome::Failed {
            reason,
            next_steps,
            acceptance,
        } => {
            let mut body = format!("Run {run_id} failed: {reason}");
            if let Some(acceptance) = acceptance.as_ref().filter(|a| !a.is_empty()) {
                body.push_str("\n\nAcceptance criteria:\n");
                body.push_str(&acceptance_lines(acceptance));
            }
            if let Some(next) = next_steps {
                body.push_str(&format!("\n\nNext steps:\n{}", next.trim()));
            }
            body
        }
        Outcome::Cancelled { reason } => format!("Run {run_id} was cancelled: {reason}"),
    };
    if !command_logs.is_empty() {
        body.push_str("\n\nCommand logs:");
        for path in command_logs {
            body.push_str(&format!("\n- {path}"));
        }
    }
    body
}

fn acceptance_lines(results: &[AcceptanceResult]) -> String {
    results
        .iter()
        .map(|r| {
            let mark = if r.passed { "x" } else { " " };
            match r.evidence.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
                Some(evidence) => format!("- [{mark}] {}: {evidence}", r.criterion),
                None => format!("- [{mark}] {}", r.criterion),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether free text claims the task is done.
fn claims_completion(content: &str) -> bool {
    let lower = content.to_lowercase();
    ["task_complete", "task complete", "task is complete"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn redact_arguments(arguments: &serde_json::Value) -> serde_json::Value {
    let redacted = redact_secrets(&arguments.to_string());
    serde_json::from_str(&redacted).unwrap_or(serde_json::Value::String(redacted))
}

fn preview(output: &str) -> String {
    match output.char_indices().nth(OUTPUT_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &output[..cut]),
        None => output.to_string(),
    }
}
