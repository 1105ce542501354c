use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Unknown agent: {name}")]
    UnknownAgent { name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Agent timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Injection queue closed")]
    InjectionClosed,

    #[error("Store error: {0}")]
    Store(#[from] cortex_core::CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
