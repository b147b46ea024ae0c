//! Task board implementations.
//!
//! [`InMemoryTaskStore`] backs tests and embedding hosts; [`JsonTaskStore`]
//! keeps the board in a single JSON file (`.sandcastle/tasks.json`) so the
//! CLI can run tasks without an external Kanban service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandcastle_core::error::{Error, Result};
use sandcastle_core::{Task, TaskComment, TaskStatus, TaskStore};
use tokio::sync::{Mutex, RwLock};

/// A task board held in memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    pub async fn insert(&self, task: Task) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or_else(|| missing(task_id))?;
        task.status = status;
        Ok(())
    }

    async fn add_comment(&self, task_id: &str, comment: TaskComment) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or_else(|| missing(task_id))?;
        task.comments.push(comment);
        Ok(())
    }
}

/// A task board persisted as a JSON array of tasks.
///
/// The file is re-read on every call so edits made by hand between runs are
/// picked up. Writes go through a temp file and a rename.
pub struct JsonTaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All tasks on the board. A missing file is an empty board.
    pub async fn list(&self) -> Result<Vec<Task>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Add or replace a task.
    pub async fn upsert(&self, task: Task) -> Result<()> {
        self.update(|tasks| {
            match tasks.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task,
                None => tasks.push(task),
            }
            Ok(())
        })
        .await
    }

    async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Task>) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut tasks = self.list().await?;
        f(&mut tasks)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&tasks)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.list().await?.into_iter().find(|t| t.id == task_id))
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.update(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| missing(task_id))?;
            task.status = status;
            Ok(())
        })
        .await
    }

    async fn add_comment(&self, task_id: &str, comment: TaskComment) -> Result<()> {
        self.update(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| missing(task_id))?;
            task.comments.push(comment);
            Ok(())
        })
        .await
    }
}

fn missing(task_id: &str) -> Error {
    Error::Internal(format!("task '{task_id}' does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_updates_tasks() {
        let store = InMemoryTaskStore::with_tasks([Task::new("T-1", "First")]);
        store.set_status("T-1", TaskStatus::InProgress).await.unwrap();
        store
            .add_comment("T-1", TaskComment::new("sandcastle", "hello"))
            .await
            .unwrap();

        let task = store.get_task("T-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.comments.len(), 1);
        assert!(store.get_task("T-2").await.unwrap().is_none());
        assert!(store.set_status("T-2", TaskStatus::Done).await.is_err());
    }

    #[tokio::test]
    async fn json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sandcastle/tasks.json");
        let store = JsonTaskStore::new(&path);
        assert!(store.list().await.unwrap().is_empty());

        store
            .upsert(Task::new("T-1", "Fix login").with_criteria(["tests pass"]))
            .await
            .unwrap();
        store.set_status("T-1", TaskStatus::Done).await.unwrap();
        store
            .add_comment("T-1", TaskComment::new("sandcastle", "done"))
            .await
            .unwrap();

        let reopened = JsonTaskStore::new(&path);
        let task = reopened.get_task("T-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.acceptance_criteria, vec!["tests pass"]);
        assert_eq!(task.comments[0].body, "done");
    }

    #[tokio::test]
    async fn json_store_reads_hand_written_boards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id": "T-9", "title": "Docs", "acceptanceCriteria": ["README updated"], "humanOnly": true}]"#,
        )
        .unwrap();

        let task = JsonTaskStore::new(&path).get_task("T-9").await.unwrap().unwrap();
        assert!(task.human_only);
        assert_eq!(task.status, TaskStatus::Todo);
    }
}
