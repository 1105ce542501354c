//! `cortex-chats` — durable conversation state.
//!
//! Two halves: the conversation store (one JSON file per chat plus a small
//! meta sidecar so listings never read every chat) and the write-ahead log
//! that makes user messages and streaming responses crash-safe.

pub mod error;
pub mod store;
pub mod types;
pub mod wal;

pub use error::{ChatError, Result};
pub use store::ChatStore;
pub use types::{Chat, ChatMessage, MessageRole};
pub use wal::{MessageWal, PendingMessage, PendingStatus, StreamingResponse};
