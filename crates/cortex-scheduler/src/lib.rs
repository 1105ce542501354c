//! `cortex-scheduler` — polling task runner.
//!
//! # Schedule grammar
//!
//! | Form | Behaviour |
//! |------|-----------|
//! | `every N (minute\|hour\|day)s?` | Fires when `now - last_run ≥ N × unit` |
//! | `daily at HH:MM(am\|pm)?` | At most once per calendar day after the local time |
//! | `once at <ISO-8601>` | Fires once, then the task deactivates |
//! | 5-field cron | `*`, literals, commas, `a-b` ranges, `*/n` and `a-b/n` steps; Sun=0 |
//!
//! Daily-equivalent crons (literal minute+hour, wildcard day-of-month and
//! month) get catch-up: a missed firing still runs if less than six hours
//! late. Parse errors land in the task's `last_error` field; tasks are
//! never deactivated by a bad schedule.

pub mod engine;
pub mod error;
pub mod schedule;
pub mod tasks;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use tasks::TaskStore;
pub use types::{ScheduledTask, TaskFire, TaskType};
