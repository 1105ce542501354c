use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Unrecognized schedule format: '{0}'")]
    BadSchedule(String),

    #[error("Store error: {0}")]
    Store(#[from] cortex_core::CoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
