//! A provider that replays recorded responses.
//!
//! Used by the `run` command to drive the orchestrator offline and by tests.
//! Each call to `complete` returns the next response in order; running past
//! the end is a [`ProviderError::Exhausted`].

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use sandcastle_core::error::ProviderError;
use sandcastle_core::provider::Usage;
use sandcastle_core::{
    FinishReason, Message, MessageToolCall, Provider, ProviderRequest, ProviderResponse,
};
use serde::Deserialize;

/// One recorded response in a script file.
///
/// ```json
/// { "content": "Looking around", "toolCalls": [{ "name": "list_files", "arguments": { "glob": "src/**" } }] }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptedResponse {
    #[serde(default)]
    pub content: String,
    /// Defaults to `tool_calls` when calls are present, `stop` otherwise
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub tool_calls: Vec<ScriptedToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ScriptedResponse {
    fn into_response(self, index: usize) -> ProviderResponse {
        let tool_calls: Vec<MessageToolCall> = self
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, call)| MessageToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}_{i}")),
                name: call.name,
                arguments: if call.arguments.is_null() {
                    "{}".into()
                } else {
                    call.arguments.to_string()
                },
            })
            .collect();
        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        ProviderResponse {
            message: Message::assistant(self.content).with_tool_calls(tool_calls),
            finish_reason,
            usage: Some(Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            }),
        }
    }
}

/// Replays a fixed list of responses.
pub struct ScriptedProvider {
    responses: Vec<ProviderResponse>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_script(script: Vec<ScriptedResponse>) -> Self {
        Self::new(
            script
                .into_iter()
                .enumerate()
                .map(|(i, r)| r.into_response(i))
                .collect(),
        )
    }

    /// Parse a JSON array of [`ScriptedResponse`]s.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_script(serde_json::from_str(json)?))
    }

    pub fn from_file(path: &Path) -> sandcastle_core::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }

    /// Number of `complete` calls so far, including ones past the end.
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let index = {
            let mut requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            requests.push(request);
            requests.len() - 1
        };
        self.responses
            .get(index)
            .cloned()
            .ok_or(ProviderError::Exhausted(self.responses.len()))
    }
}

/// A plain text response.
pub fn text_response(text: &str) -> ProviderResponse {
    ScriptedResponse {
        content: text.into(),
        finish_reason: None,
        tool_calls: Vec::new(),
    }
    .into_response(0)
}

/// A response requesting one tool call.
pub fn tool_response(id: &str, name: &str, arguments: serde_json::Value) -> ProviderResponse {
    ScriptedResponse {
        content: String::new(),
        finish_reason: None,
        tool_calls: vec![ScriptedToolCall {
            id: Some(id.into()),
            name: name.into(),
            arguments,
        }],
    }
    .into_response(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: String::new(),
            messages: vec![Message::user("go")],
            temperature: 0.0,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_exhausts() {
        let provider = ScriptedProvider::new(vec![text_response("one"), text_response("two")]);
        assert_eq!(provider.complete(request()).await.unwrap().message.content, "one");
        assert_eq!(provider.complete(request()).await.unwrap().message.content, "two");
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted(2)));
        assert_eq!(provider.call_count(), 3);
    }

    #[test]
    fn parses_script_json() {
        let json = r#"[
            {"content": "looking", "toolCalls": [{"name": "list_files", "arguments": {"glob": "src/**"}}]},
            {"content": "too long", "finishReason": "length"},
            {"content": "done"}
        ]"#;
        let provider = ScriptedProvider::from_json(json).unwrap();
        assert_eq!(provider.responses.len(), 3);

        let first = &provider.responses[0];
        assert_eq!(first.finish_reason, FinishReason::ToolCalls);
        assert_eq!(first.message.tool_calls[0].id, "call_0_0");
        assert_eq!(first.message.tool_calls[0].name, "list_files");
        assert!(first.message.tool_calls[0].arguments.contains("src/**"));

        assert_eq!(provider.responses[1].finish_reason, FinishReason::Length);
        assert_eq!(provider.responses[2].finish_reason, FinishReason::Stop);
    }

    #[test]
    fn tool_response_helper() {
        let response = tool_response("c1", "read_file", serde_json::json!({"path": "a.txt"}));
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.message.tool_calls[0].id, "c1");
    }
}
