//! Task model and the TaskStore trait.
//!
//! Tasks are owned by an external board (Kanban store). Sandcastle only reads
//! them, posts one comment per finished run, and moves a task to `done` when
//! a run succeeds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Where a task sits on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// A unit of work the agent may be asked to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Conditions that must be evidenced before the task may be completed
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    /// Tasks that must never be handed to the agent
    #[serde(default)]
    pub human_only: bool,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub comments: Vec<TaskComment>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            human_only: false,
            status: TaskStatus::Todo,
            comments: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn human_only(mut self) -> Self {
        self.human_only = true;
        self
    }
}

/// A comment posted on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl TaskComment {
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

/// The external task board.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Look up a task. `Ok(None)` means it does not exist.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Move a task to a new status.
    async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;

    /// Append a comment to a task.
    async fn add_comment(&self, task_id: &str, comment: TaskComment) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_json_uses_camel_case() {
        let task = Task::new("T-1", "Add login")
            .with_criteria(["form renders"])
            .human_only();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["humanOnly"], true);
        assert_eq!(json["acceptanceCriteria"][0], "form renders");
        assert_eq!(json["status"], "todo");
    }

    #[test]
    fn missing_fields_default() {
        let task: Task = serde_json::from_str(r#"{"id":"T-2","title":"Bare"}"#).unwrap();
        assert!(!task.human_only);
        assert!(task.acceptance_criteria.is_empty());
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[test]
    fn status_display() {
        assert_eq!(TaskStatus::Done.to_string(), "done");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }
}
