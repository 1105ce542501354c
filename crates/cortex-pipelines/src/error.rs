use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("LLM call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Malformed structured output: {0}")]
    BadOutput(String),

    #[error("Memory error: {0}")]
    Memory(#[from] cortex_memory::MemoryError),

    #[error("Store error: {0}")]
    Store(#[from] cortex_core::CoreError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
