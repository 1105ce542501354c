//! Scheduler engine: a one-minute poll loop over the task file.
//!
//! Each tick is a single locked read-modify-write: evaluate every active
//! task, mark fires into `last_run`, stash parse failures in `last_error`
//! (tasks are never disabled by a bad schedule), then hand the fired
//! descriptors to the dispatcher over a non-blocking channel.

use chrono::{Local, NaiveDateTime};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::schedule::{evaluate, parse_schedule};
use crate::tasks::TaskStore;
use crate::types::{ScheduledTask, TaskFire, TaskType, SCHEDULED_PROMPT_PREFIX};

/// Tick cadence. One per minute regardless of tick duration.
const TICK_SECS: u64 = 60;

pub struct SchedulerEngine {
    tasks: TaskStore,
    /// Fired tasks are forwarded here for delivery routing. `try_send`
    /// keeps the tick loop from ever stalling on a slow dispatcher.
    fired_tx: mpsc::Sender<TaskFire>,
}

impl SchedulerEngine {
    pub fn new(tasks: TaskStore, fired_tx: mpsc::Sender<TaskFire>) -> Self {
        Self { tasks, fired_tx }
    }

    /// Main loop. Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(TICK_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Local::now().naive_local()) {
                        Ok(fired) => {
                            for fire in fired {
                                if self.fired_tx.try_send(fire).is_err() {
                                    warn!("dispatch channel full or closed; fired task dropped");
                                }
                            }
                        }
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One tick at `now`. Separated from the loop so tests drive it with a
    /// fixed clock.
    pub fn tick(&self, now: NaiveDateTime) -> Result<Vec<TaskFire>> {
        self.tasks.with_tasks(|tasks| {
            let mut fired = Vec::new();
            for task in tasks.iter_mut() {
                // Errors are per-tick observations; clear stale ones.
                task.last_error = None;

                if !task.active {
                    continue;
                }

                let schedule = match parse_schedule(&task.schedule) {
                    Ok(s) => s,
                    Err(e) => {
                        task.last_error = Some(e.to_string());
                        continue;
                    }
                };
                let last_run = task
                    .last_run
                    .as_deref()
                    .and_then(parse_naive_timestamp);

                let decision = evaluate(&schedule, now, last_run);
                if decision.fire {
                    info!(task = %task.id, schedule = %task.schedule, "task fired");
                    fired.push(fire_descriptor(task));
                    task.last_run = Some(now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
                    if decision.deactivate {
                        task.active = false;
                    }
                }
            }
            fired
        })
    }
}

fn parse_naive_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

fn fire_descriptor(task: &ScheduledTask) -> TaskFire {
    let prompt = match task.task_type {
        TaskType::Agent => task.prompt.clone(),
        TaskType::Prompt => format!("{SCHEDULED_PROMPT_PREFIX}\n{}", task.prompt),
    };
    TaskFire {
        id: task.id.clone(),
        task_type: task.task_type,
        silent: task.silent,
        room_id: task.room_id.clone(),
        project: task.project.clone(),
        prompt,
        agent: task.agent.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskPatch;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn engine(dir: &std::path::Path) -> (SchedulerEngine, mpsc::Receiver<TaskFire>) {
        let (tx, rx) = mpsc::channel(16);
        (
            SchedulerEngine::new(TaskStore::new(dir.join("scheduled_tasks.json")), tx),
            rx,
        )
    }

    fn set_last_run(store: &TaskStore, id: &str, ts: NaiveDateTime) {
        store
            .with_tasks(|tasks| {
                let task = tasks.iter_mut().find(|t| t.id == id).unwrap();
                task.last_run = Some(ts.format("%Y-%m-%dT%H:%M:%S").to_string());
            })
            .unwrap();
    }

    #[test]
    fn interval_task_fires_and_updates_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(dir.path());
        let task = engine
            .tasks
            .add("check mail", "every 5 minutes", TaskType::Prompt, None, false, None, None)
            .unwrap();

        set_last_run(&engine.tasks, &task.id, dt(2026, 8, 1, 11, 50));
        let fired = engine.tick(dt(2026, 8, 1, 12, 0)).unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].prompt.starts_with(SCHEDULED_PROMPT_PREFIX));

        // last_run advanced; an immediate second tick stays quiet.
        let fired = engine.tick(dt(2026, 8, 1, 12, 0)).unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn cron_catch_up_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(dir.path());
        let task = engine
            .tasks
            .add("evening digest", "30 17 * * *", TaskType::Agent, Some("digest".into()), true, None, None)
            .unwrap();

        // last_run yesterday 17:30, now 19:00: catch-up fires.
        set_last_run(&engine.tasks, &task.id, dt(2026, 7, 31, 17, 30));
        let fired = engine.tick(dt(2026, 8, 1, 19, 0)).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].agent.as_deref(), Some("digest"));

        // Ran today at 17:35: no refire at 19:00.
        set_last_run(&engine.tasks, &task.id, dt(2026, 8, 1, 17, 35));
        assert!(engine.tick(dt(2026, 8, 1, 19, 0)).unwrap().is_empty());

        // Beyond the six-hour grace: no catch-up.
        set_last_run(&engine.tasks, &task.id, dt(2026, 7, 31, 17, 30));
        assert!(engine.tick(dt(2026, 8, 1, 23, 35)).unwrap().is_empty());
    }

    #[test]
    fn once_task_deactivates_after_firing() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(dir.path());
        engine
            .tasks
            .add("remind me", "once at 2026-08-01T12:00:00", TaskType::Prompt, None, false, None, None)
            .unwrap();

        let fired = engine.tick(dt(2026, 8, 1, 12, 1)).unwrap();
        assert_eq!(fired.len(), 1);
        assert!(engine.tasks.list(false).is_empty());
        assert!(!engine.tasks.list(true)[0].active);
    }

    #[test]
    fn bad_schedule_sets_last_error_keeps_task_active() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(dir.path());
        engine
            .tasks
            .add("broken", "sometimes maybe", TaskType::Prompt, None, false, None, None)
            .unwrap();

        let fired = engine.tick(dt(2026, 8, 1, 12, 0)).unwrap();
        assert!(fired.is_empty());
        let task = &engine.tasks.list(false)[0];
        assert!(task.active);
        assert!(task.last_error.as_ref().unwrap().contains("sometimes maybe"));
    }

    #[test]
    fn inactive_tasks_never_fire() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(dir.path());
        let task = engine
            .tasks
            .add("paused", "every minute", TaskType::Prompt, None, false, None, None)
            .unwrap();
        engine
            .tasks
            .update(
                &task.id,
                TaskPatch {
                    active: Some(false),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        set_last_run(&engine.tasks, &task.id, dt(2026, 8, 1, 0, 0));
        assert!(engine.tick(dt(2026, 8, 1, 12, 0)).unwrap().is_empty());
    }
}
