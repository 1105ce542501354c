//! Per-model thinking configuration.
//!
//! Sonnet and opus take adaptive thinking with an effort level; haiku takes
//! an explicit token budget. Per-agent overrides win over the model default.

use serde_json::{json, Value};

use crate::types::AgentConfig;

const DEFAULT_HAIKU_BUDGET: u32 = 4096;

/// Build the thinking block passed to the SDK subprocess, or `None` for an
/// unrecognized model alias.
pub fn thinking_config(config: &AgentConfig) -> Option<Value> {
    match config.model.as_str() {
        "sonnet" | "opus" => {
            let effort = config.effort.as_deref().unwrap_or("medium");
            Some(json!({"type": "adaptive", "effort": effort}))
        }
        "haiku" => {
            let budget = config.thinking_budget.unwrap_or(DEFAULT_HAIKU_BUDGET);
            Some(json!({"type": "enabled", "budget_tokens": budget}))
        }
        _ => None,
    }
}
