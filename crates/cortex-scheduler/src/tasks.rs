//! Scheduled-task CRUD over the atomic file store.

use std::path::PathBuf;

use tracing::info;

use cortex_core::files::{load_json, locked_update};
use cortex_core::ids::short_id;

use crate::error::{Result, SchedulerError};
use crate::types::{ScheduledTask, TaskType};

/// Task timestamps are naive local wall time, matching what the tick loop
/// compares against.
fn local_now_string() -> String {
    chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Fields that may change on an existing task. `Some(None)` clears an
/// optional field.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub silent: Option<bool>,
    pub active: Option<bool>,
    pub schedule: Option<String>,
    pub prompt: Option<String>,
    pub room_id: Option<Option<String>>,
    pub project: Option<Option<String>>,
}

pub struct TaskStore {
    file: PathBuf,
}

impl TaskStore {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    pub fn add(
        &self,
        prompt: &str,
        schedule: &str,
        task_type: TaskType,
        agent: Option<String>,
        silent: bool,
        room_id: Option<String>,
        project: Option<String>,
    ) -> Result<ScheduledTask> {
        let task = ScheduledTask {
            id: short_id(),
            prompt: prompt.to_string(),
            schedule: schedule.to_string(),
            task_type,
            agent,
            silent,
            active: true,
            room_id,
            project,
            created_at: local_now_string(),
            last_run: Some(local_now_string()),
            last_error: None,
        };
        let stored = task.clone();
        locked_update(&self.file, Vec::<ScheduledTask>::new(), move |mut tasks| {
            tasks.push(stored);
            (tasks, ())
        })?;
        info!(task = %task.id, schedule = %task.schedule, "task scheduled");
        Ok(task)
    }

    pub fn remove(&self, task_id: &str) -> Result<()> {
        let id = task_id.to_string();
        let removed = locked_update(&self.file, Vec::<ScheduledTask>::new(), move |mut tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            let removed = before != tasks.len();
            (tasks, removed)
        })?;
        if !removed {
            return Err(SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            });
        }
        info!(task = task_id, "task removed");
        Ok(())
    }

    pub fn update(&self, task_id: &str, patch: TaskPatch) -> Result<ScheduledTask> {
        let id = task_id.to_string();
        let updated = locked_update(&self.file, Vec::<ScheduledTask>::new(), move |mut tasks| {
            let result = tasks.iter_mut().find(|t| t.id == id).map(|task| {
                if let Some(silent) = patch.silent {
                    task.silent = silent;
                }
                if let Some(active) = patch.active {
                    task.active = active;
                }
                if let Some(schedule) = &patch.schedule {
                    task.schedule = schedule.clone();
                    task.last_error = None;
                }
                if let Some(prompt) = &patch.prompt {
                    task.prompt = prompt.clone();
                }
                if let Some(room_id) = &patch.room_id {
                    task.room_id = room_id.clone();
                }
                if let Some(project) = &patch.project {
                    task.project = project.clone();
                }
                task.clone()
            });
            (tasks, result)
        })?;
        updated.ok_or_else(|| SchedulerError::TaskNotFound {
            id: task_id.to_string(),
        })
    }

    pub fn list(&self, include_inactive: bool) -> Vec<ScheduledTask> {
        let tasks: Vec<ScheduledTask> = load_json(&self.file, Vec::new());
        tasks
            .into_iter()
            .filter(|t| include_inactive || t.active)
            .collect()
    }

    /// Apply a closure to the full task list under one lock (the tick
    /// loop's read-modify-write).
    pub fn with_tasks<R>(&self, f: impl FnOnce(&mut Vec<ScheduledTask>) -> R) -> Result<R> {
        locked_update(&self.file, Vec::<ScheduledTask>::new(), move |mut tasks| {
            let out = f(&mut tasks);
            (tasks, out)
        })
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path) -> TaskStore {
        TaskStore::new(dir.join("scheduled_tasks.json"))
    }

    #[test]
    fn add_update_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let task = s
            .add(
                "water the plants",
                "daily at 9:00",
                TaskType::Prompt,
                None,
                false,
                None,
                None,
            )
            .unwrap();
        assert_eq!(s.list(false).len(), 1);

        let updated = s
            .update(
                &task.id,
                TaskPatch {
                    silent: Some(true),
                    room_id: Some(Some("room-1".into())),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert!(updated.silent);
        assert_eq!(updated.room_id.as_deref(), Some("room-1"));

        s.remove(&task.id).unwrap();
        assert!(s.list(true).is_empty());
    }

    #[test]
    fn inactive_tasks_hidden_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let task = s
            .add("x", "every 5 minutes", TaskType::Prompt, None, false, None, None)
            .unwrap();
        s.update(
            &task.id,
            TaskPatch {
                active: Some(false),
                ..TaskPatch::default()
            },
        )
        .unwrap();
        assert!(s.list(false).is_empty());
        assert_eq!(s.list(true).len(), 1);
    }

    #[test]
    fn update_unknown_task_errors() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.update("nope", TaskPatch::default()).is_err());
    }
}
