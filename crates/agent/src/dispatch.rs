//! Tool dispatch: one typed invocation in, one tool result out.
//!
//! Tool errors never escape from here. They become an `Error: ...` result
//! string so the model can read the reason and adapt.

use std::time::Duration;

use sandcastle_core::tool::{
    ApplyPatchArgs, ListFilesArgs, RunCommandArgs, SearchArgs, TaskBlockedArgs, TaskCompleteArgs,
    TaskFailedArgs, WriteFileArgs,
};
use sandcastle_core::{StopSignal, ToolError, ToolExecutionResult, ToolInvocation};
use sandcastle_tools::file_ops::{DEFAULT_LIST_LIMIT, DEFAULT_SEARCH_LIMIT};
use sandcastle_tools::{CommandRequest, CommandResult, FileChange, ProcessRunner, SandboxedFileOps};
use tokio_util::sync::CancellationToken;

/// The outcome of one dispatched call, with the side effects the
/// orchestrator needs to record.
#[derive(Debug)]
pub struct Dispatched {
    pub result: ToolExecutionResult,
    pub success: bool,
    pub change: Option<FileChange>,
    pub command: Option<CommandResult>,
}

impl Dispatched {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            result: ToolExecutionResult::output(output),
            success: true,
            change: None,
            command: None,
        }
    }

    fn stop(output: impl Into<String>, signal: StopSignal) -> Self {
        Self {
            result: ToolExecutionResult::stop(output, signal),
            success: true,
            change: None,
            command: None,
        }
    }

    pub fn error(err: &ToolError) -> Self {
        Self {
            result: ToolExecutionResult::output(format!("Error: {err}")),
            success: false,
            change: None,
            command: None,
        }
    }
}

/// Executes tool invocations for one run.
pub struct ToolDispatcher<'a> {
    pub file_ops: &'a SandboxedFileOps,
    pub runner: &'a ProcessRunner,
    pub task_id: &'a str,
    pub cancel: &'a CancellationToken,
}

impl ToolDispatcher<'_> {
    pub async fn dispatch(&self, invocation: ToolInvocation) -> Dispatched {
        let outcome = match invocation {
            ToolInvocation::ListFiles(args) => self.list_files(args).await,
            ToolInvocation::ReadFile(args) => self
                .file_ops
                .read_file(&args.path)
                .await
                .map(Dispatched::ok),
            ToolInvocation::Search(args) => self.search(args).await,
            ToolInvocation::WriteFile(args) => self.write_file(args).await,
            ToolInvocation::ApplyPatch(args) => self.apply_patch(args).await,
            ToolInvocation::RunCommand(args) => self.run_command(args).await,
            ToolInvocation::TaskComplete(args) => Ok(task_complete(args)),
            ToolInvocation::TaskBlocked(args) => Ok(task_blocked(args)),
            ToolInvocation::TaskFailed(args) => Ok(task_failed(args)),
        };
        outcome.unwrap_or_else(|e| Dispatched::error(&e))
    }

    async fn list_files(&self, args: ListFilesArgs) -> Result<Dispatched, ToolError> {
        let limit = args.max_results.unwrap_or(DEFAULT_LIST_LIMIT);
        let files = self.file_ops.list_files(&args.glob, limit).await?;
        if files.is_empty() {
            return Ok(Dispatched::ok(format!("No files matched '{}'", args.glob)));
        }
        let mut out = files.join("\n");
        if files.len() >= limit {
            out.push_str(&format!("\n(truncated at {limit} results)"));
        }
        Ok(Dispatched::ok(out))
    }

    async fn search(&self, args: SearchArgs) -> Result<Dispatched, ToolError> {
        let limit = args.max_results.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let matches = self
            .file_ops
            .search(
                &args.query,
                args.glob.as_deref(),
                limit,
                args.case_sensitive.unwrap_or(false),
            )
            .await?;
        if matches.is_empty() {
            return Ok(Dispatched::ok(format!("No matches for '{}'", args.query)));
        }
        let lines: Vec<String> = matches
            .iter()
            .map(|m| format!("{}:{}: {}", m.path, m.line, m.content))
            .collect();
        Ok(Dispatched::ok(lines.join("\n")))
    }

    async fn write_file(&self, args: WriteFileArgs) -> Result<Dispatched, ToolError> {
        let change = self.file_ops.write_file(&args.path, &args.content, true).await?;
        let verb = if change.created { "Created" } else { "Wrote" };
        Ok(Dispatched {
            result: ToolExecutionResult::output(format!(
                "{verb} {} ({} bytes, +{} -{})",
                change.path, change.bytes_written, change.lines_added, change.lines_removed
            )),
            success: true,
            change: Some(change),
            command: None,
        })
    }

    async fn apply_patch(&self, args: ApplyPatchArgs) -> Result<Dispatched, ToolError> {
        let change = self.file_ops.apply_patch(&args.path, &args.unified_diff).await?;
        Ok(Dispatched {
            result: ToolExecutionResult::output(format!(
                "Patched {} (+{} -{})",
                change.path, change.lines_added, change.lines_removed
            )),
            success: true,
            change: Some(change),
            command: None,
        })
    }

    async fn run_command(&self, args: RunCommandArgs) -> Result<Dispatched, ToolError> {
        let mut request =
            CommandRequest::new(args.cmd, self.task_id).with_cancel(self.cancel.clone());
        if let Some(cwd) = args.cwd {
            request = request.with_cwd(cwd);
        }
        if let Some(secs) = args.timeout_sec {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        let result = self.runner.run(request).await?;
        Ok(Dispatched {
            result: ToolExecutionResult::output(result.summary()),
            success: result.success,
            change: None,
            command: Some(result),
        })
    }
}

fn task_complete(args: TaskCompleteArgs) -> Dispatched {
    let passed = args.acceptance_results.iter().filter(|r| r.passed).count();
    let output = format!(
        "Completion requested: {passed}/{} acceptance criteria reported as passed",
        args.acceptance_results.len()
    );
    Dispatched::stop(
        output,
        StopSignal::Complete {
            summary: args.summary,
            acceptance_results: args.acceptance_results,
        },
    )
}

fn task_blocked(args: TaskBlockedArgs) -> Dispatched {
    Dispatched::stop(
        format!("Task blocked: {}", args.reason),
        StopSignal::Blocked {
            reason: args.reason,
            question: args.question,
        },
    )
}

fn task_failed(args: TaskFailedArgs) -> Dispatched {
    Dispatched::stop(
        format!("Task failed: {}", args.reason),
        StopSignal::Failed {
            reason: args.reason,
            next_steps: args.next_steps,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_config::{Policy, RunnerConfig};
    use sandcastle_core::AcceptanceResult;
    use sandcastle_security::PolicyEngine;
    use std::sync::Arc;

    struct Fixture {
        _project: tempfile::TempDir,
        _data: tempfile::TempDir,
        file_ops: SandboxedFileOps,
        runner: ProcessRunner,
        token: CancellationToken,
    }

    fn fixture() -> Fixture {
        let project = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        let engine = Arc::new(PolicyEngine::new(project.path(), Policy::default()).unwrap());
        Fixture {
            file_ops: SandboxedFileOps::new(engine.clone()),
            runner: ProcessRunner::new(engine, data.path(), RunnerConfig::default()),
            token: CancellationToken::new(),
            _project: project,
            _data: data,
        }
    }

    impl Fixture {
        fn dispatcher(&self) -> ToolDispatcher<'_> {
            ToolDispatcher {
                file_ops: &self.file_ops,
                runner: &self.runner,
                task_id: "T-1",
                cancel: &self.token,
            }
        }
    }

    #[tokio::test]
    async fn read_and_list() {
        let fx = fixture();
        let listed = fx
            .dispatcher()
            .dispatch(ToolInvocation::ListFiles(ListFilesArgs {
                glob: "src/**".into(),
                max_results: None,
            }))
            .await;
        assert!(listed.success);
        assert_eq!(listed.result.output, "src/main.rs");

        let read = fx
            .dispatcher()
            .dispatch(ToolInvocation::parse("read_file", &serde_json::json!({"path": "src/main.rs"})).unwrap())
            .await;
        assert_eq!(read.result.output, "fn main() {}\n");
        assert!(!read.result.should_stop());
    }

    #[tokio::test]
    async fn policy_violation_becomes_error_output() {
        let fx = fixture();
        let out = fx
            .dispatcher()
            .dispatch(ToolInvocation::WriteFile(WriteFileArgs {
                path: ".env".into(),
                content: "KEY=1".into(),
            }))
            .await;
        assert!(!out.success);
        assert!(out.result.output.starts_with("Error: Policy violation"));
        assert!(out.change.is_none());
    }

    #[tokio::test]
    async fn write_reports_change() {
        let fx = fixture();
        let out = fx
            .dispatcher()
            .dispatch(ToolInvocation::WriteFile(WriteFileArgs {
                path: "src/lib.rs".into(),
                content: "pub fn a() {}\n".into(),
            }))
            .await;
        assert!(out.success);
        assert!(out.result.output.starts_with("Created src/lib.rs"));
        assert_eq!(out.change.unwrap().lines_added, 1);
    }

    #[tokio::test]
    async fn terminal_tools_stop() {
        let fx = fixture();
        let complete = fx
            .dispatcher()
            .dispatch(ToolInvocation::TaskComplete(TaskCompleteArgs {
                summary: "done".into(),
                acceptance_results: vec![AcceptanceResult {
                    criterion: "works".into(),
                    passed: true,
                    evidence: None,
                }],
            }))
            .await;
        assert!(matches!(complete.result.stop, Some(StopSignal::Complete { .. })));
        assert!(complete.result.output.contains("1/1"));

        let blocked = fx
            .dispatcher()
            .dispatch(ToolInvocation::TaskBlocked(TaskBlockedArgs {
                reason: "need creds".into(),
                question: "Which account?".into(),
            }))
            .await;
        assert!(matches!(blocked.result.stop, Some(StopSignal::Blocked { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commands_report_exit_status() {
        let fx = fixture();
        let out = fx
            .dispatcher()
            .dispatch(ToolInvocation::RunCommand(RunCommandArgs {
                cmd: "echo hi".into(),
                cwd: None,
                timeout_sec: Some(10),
            }))
            .await;
        assert!(out.success);
        assert!(out.result.output.starts_with("$ echo hi\n[exit code 0"));
        assert!(out.command.unwrap().log_path.exists());

        let denied = fx
            .dispatcher()
            .dispatch(ToolInvocation::RunCommand(RunCommandArgs {
                cmd: "ls | wc -l".into(),
                cwd: None,
                timeout_sec: None,
            }))
            .await;
        assert!(!denied.success);
        assert!(denied.command.is_none());
        assert!(denied.result.output.contains("metacharacter"));
    }
}
