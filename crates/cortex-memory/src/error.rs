use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Atom not found: {id}")]
    AtomNotFound { id: String },

    #[error("Thread not found: {id}")]
    ThreadNotFound { id: String },

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Thread split failed: {errors:?}")]
    SplitValidation { errors: Vec<String> },

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Store error: {0}")]
    Store(#[from] cortex_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
