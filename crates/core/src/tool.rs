//! The tool vocabulary: the only actions the model may request.
//!
//! Raw [`ToolCall`]s arrive from the provider as a name plus a loosely-typed
//! JSON argument bag. They are parsed once into a [`ToolInvocation`], a
//! tagged union with one strongly-typed argument struct per tool, and every
//! consumer matches on that enum exhaustively.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ToolError;
use crate::message::MessageToolCall;
use crate::provider::ToolDefinition;

/// A request to execute a tool, as issued by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Decode a tool call embedded in an assistant message.
    ///
    /// An empty argument string is treated as `{}`.
    pub fn from_message(call: &MessageToolCall) -> Result<Self, ToolError> {
        let raw = call.arguments.trim();
        let arguments = if raw.is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(raw).map_err(|e| {
                ToolError::InvalidArguments(format!(
                    "arguments for '{}' are not valid JSON: {e}",
                    call.name
                ))
            })?
        };
        Ok(Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        })
    }

    /// Parse into a typed invocation.
    pub fn parse(&self) -> Result<ToolInvocation, ToolError> {
        ToolInvocation::parse(&self.name, &self.arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesArgs {
    #[serde(default = "default_glob")]
    pub glob: String,
    #[serde(default, alias = "max_results", deserialize_with = "lenient_opt_usize")]
    pub max_results: Option<usize>,
}

fn default_glob() -> String {
    "**/*".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchArgs {
    pub query: String,
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default, alias = "max_results", deserialize_with = "lenient_opt_usize")]
    pub max_results: Option<usize>,
    #[serde(default, alias = "case_sensitive")]
    pub case_sensitive: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPatchArgs {
    pub path: String,
    #[serde(alias = "unified_diff", alias = "diff", alias = "patch")]
    pub unified_diff: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommandArgs {
    #[serde(alias = "command")]
    pub cmd: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "timeout_sec", deserialize_with = "lenient_opt_u64")]
    pub timeout_sec: Option<u64>,
}

/// One entry of the model's self-assessment against the task's criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleteArgs {
    pub summary: String,
    #[serde(default, alias = "acceptance_results")]
    pub acceptance_results: Vec<AcceptanceResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBlockedArgs {
    pub reason: String,
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedArgs {
    pub reason: String,
    #[serde(default, alias = "next_steps", deserialize_with = "string_or_list")]
    pub next_steps: Option<String>,
}

/// A parsed, strongly-typed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolInvocation {
    ListFiles(ListFilesArgs),
    ReadFile(ReadFileArgs),
    Search(SearchArgs),
    WriteFile(WriteFileArgs),
    ApplyPatch(ApplyPatchArgs),
    RunCommand(RunCommandArgs),
    TaskComplete(TaskCompleteArgs),
    TaskBlocked(TaskBlockedArgs),
    TaskFailed(TaskFailedArgs),
}

impl ToolInvocation {
    /// Every tool name the provider may use.
    pub const NAMES: [&'static str; 9] = [
        "list_files",
        "read_file",
        "search",
        "write_file",
        "apply_patch",
        "run_command",
        "task_complete",
        "task_blocked",
        "task_failed",
    ];

    /// Parse a tool name and its argument bag.
    pub fn parse(name: &str, arguments: &serde_json::Value) -> Result<Self, ToolError> {
        if !Self::NAMES.contains(&name) {
            return Err(ToolError::InvalidArguments(format!(
                "Unknown tool '{name}'. Available tools: {}",
                Self::NAMES.join(", ")
            )));
        }
        let arguments = if arguments.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            arguments.clone()
        };
        let tagged = serde_json::json!({ "name": name, "arguments": arguments });
        serde_json::from_value(tagged)
            .map_err(|e| ToolError::InvalidArguments(format!("{name}: {e}")))
    }

    /// The wire name of this tool.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListFiles(_) => "list_files",
            Self::ReadFile(_) => "read_file",
            Self::Search(_) => "search",
            Self::WriteFile(_) => "write_file",
            Self::ApplyPatch(_) => "apply_patch",
            Self::RunCommand(_) => "run_command",
            Self::TaskComplete(_) => "task_complete",
            Self::TaskBlocked(_) => "task_blocked",
            Self::TaskFailed(_) => "task_failed",
        }
    }

    /// Whether this tool ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskComplete(_) | Self::TaskBlocked(_) | Self::TaskFailed(_)
        )
    }
}

/// A terminal signal raised by one of the `task_*` tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopSignal {
    Complete {
        summary: String,
        acceptance_results: Vec<AcceptanceResult>,
    },
    Blocked {
        reason: String,
        question: String,
    },
    Failed {
        reason: String,
        next_steps: Option<String>,
    },
}

/// Coarse classification of a [`StopSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    Blocked,
    Failed,
}

impl StopSignal {
    pub fn reason(&self) -> StopReason {
        match self {
            Self::Complete { .. } => StopReason::Complete,
            Self::Blocked { .. } => StopReason::Blocked,
            Self::Failed { .. } => StopReason::Failed,
        }
    }
}

/// What a tool handler hands back to the orchestrator.
///
/// `stop` carries both "should stop" and "why", so a stop without a reason
/// cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    /// Text appended to the transcript for the model
    pub output: String,

    /// Terminal signal, if this call ends the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSignal>,
}

impl ToolExecutionResult {
    /// A non-terminal result.
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            stop: None,
        }
    }

    /// A terminal result.
    pub fn stop(output: impl Into<String>, signal: StopSignal) -> Self {
        Self {
            output: output.into(),
            stop: Some(signal),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop.as_ref().map(StopSignal::reason)
    }
}

/// JSON schemas for the whole tool surface, in the order the provider sees them.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    use serde_json::json;

    let def = |name: &str, description: &str, parameters: serde_json::Value| ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    };

    vec![
        def(
            "list_files",
            "List project files matching a glob (supports *, ** and ?).",
            json!({
                "type": "object",
                "properties": {
                    "glob": { "type": "string", "description": "Glob relative to the project root, e.g. src/**/*.ts" },
                    "maxResults": { "type": "integer", "description": "Maximum number of paths to return" }
                },
                "required": ["glob"]
            }),
        ),
        def(
            "read_file",
            "Read the full contents of a project file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the project root" }
                },
                "required": ["path"]
            }),
        ),
        def(
            "search",
            "Search project files with a regular expression and return matching lines.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Regular expression" },
                    "glob": { "type": "string", "description": "Restrict the search to files matching this glob" },
                    "maxResults": { "type": "integer", "description": "Maximum number of matching lines" },
                    "caseSensitive": { "type": "boolean" }
                },
                "required": ["query"]
            }),
        ),
        def(
            "write_file",
            "Create or overwrite a project file. The previous version is kept as <path>.bak.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        ),
        def(
            "apply_patch",
            "Apply a unified diff to a single project file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "unifiedDiff": { "type": "string", "description": "Unified diff with @@ hunk headers" }
                },
                "required": ["path", "unifiedDiff"]
            }),
        ),
        def(
            "run_command",
            "Run an allow-listed shell command inside the project. Pipes, redirection, chaining and substitution are rejected.",
            json!({
                "type": "object",
                "properties": {
                    "cmd": { "type": "string" },
                    "cwd": { "type": "string", "description": "Working directory relative to the project root" },
                    "timeoutSec": { "type": "integer" }
                },
                "required": ["cmd"]
            }),
        ),
        def(
            "task_complete",
            "Finish the task. Every acceptance criterion must be reported with evidence.",
            json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string" },
                    "acceptanceResults": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "criterion": { "type": "string" },
                                "passed": { "type": "boolean" },
                                "evidence": { "type": "string" }
                            },
                            "required": ["criterion", "passed"]
                        }
                    }
                },
                "required": ["summary", "acceptanceResults"]
            }),
        ),
        def(
            "task_blocked",
            "Stop because human input is required.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" },
                    "question": { "type": "string" }
                },
                "required": ["reason", "question"]
            }),
        ),
        def(
            "task_failed",
            "Give up on the task and explain why.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" },
                    "nextSteps": { "type": "string" }
                },
                "required": ["reason"]
            }),
        ),
    ]
}

// ── Lenient argument coercion ─────────────────────────────────────────────

fn lenient_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected a non-negative number, got {n}"))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected a number, got '{s}'"))),
        Some(other) => Err(D::Error::custom(format!("expected a number, got {other}"))),
    }
}

fn lenient_opt_usize<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_opt_u64(deserializer).map(|v| v.map(|n| usize::try_from(n).unwrap_or(usize::MAX)))
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => format!("- {s}"),
                    other => format!("- {other}"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Some(other) => Some(other.to_string()),
    })
}
