use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Chat not found: {id}")]
    NotFound { id: String },

    #[error("Store error: {0}")]
    Store(#[from] cortex_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
