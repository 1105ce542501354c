//! `cortex-core` — shared foundations for the Cortex runtime.
//!
//! Everything mutable in Cortex lives in JSON files guarded by advisory
//! locks, so the [`files`] module is the single write path for all other
//! crates. The rest is ambient plumbing: configuration, id generation and
//! the time/token helpers used when formatting memory for prompts.

pub mod config;
pub mod error;
pub mod files;
pub mod ids;
pub mod time;

pub use config::CortexConfig;
pub use error::{CoreError, Result};
