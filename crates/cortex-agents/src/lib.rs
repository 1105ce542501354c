//! `cortex-agents` — agent execution engine.
//!
//! The registry discovers per-agent config directories; the invoker runs
//! them in one of four modes (foreground, ping, trust, scheduled) over an
//! SDK streaming subprocess or a one-shot CLI call. Supporting machinery:
//! process registry, execution log, ping-notification queue, tool-call
//! serialization, per-agent working memory.

pub mod cli;
pub mod error;
pub mod executions;
pub mod invoker;
pub mod notify_queue;
pub mod process;
pub mod registry;
pub mod sdk;
pub mod serialize;
pub mod thinking;
pub mod types;
pub mod working_memory;

pub use error::{AgentError, Result};
pub use invoker::{AgentInvoker, InvokeOutcome};
pub use notify_queue::NotificationQueue;
pub use process::ProcessRegistry;
pub use registry::AgentRegistry;
pub use types::{
    AgentConfig, AgentInvocation, AgentKind, AgentResult, AgentStatus, InvocationMode,
    PendingNotification,
};
