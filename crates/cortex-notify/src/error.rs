use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("VAPID keys not configured")]
    MissingKeys,

    #[error("Invalid key material: {0}")]
    BadKeys(String),

    #[error("Push delivery failed: {0}")]
    Delivery(String),

    #[error("Store error: {0}")]
    Store(#[from] cortex_core::CoreError),
}

pub type Result<T> = std::result::Result<T, NotifyError>;
