//! One-shot CLI agent execution.
//!
//! CLI agents spawn the SDK binary with `--print --output-format json` and
//! parse the emitted event array, extracting the `type=result` entry's
//! `result` field as the response. A timeout kills the child.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::types::AgentConfig;

/// Run a CLI-typed agent to completion.
pub async fn run_cli_agent(
    command: &str,
    config: &AgentConfig,
    prompt: &str,
    append_system_prompt: Option<&str>,
) -> Result<String> {
    let mut cmd = Command::new(command);
    cmd.arg("--print")
        .arg("--dangerously-skip-permissions")
        .arg("--model")
        .arg(&config.model)
        .arg("--output-format")
        .arg("json")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(appendage) = append_system_prompt {
        cmd.arg("--append-system-prompt").arg(appendage);
    }
    cmd.arg(prompt);

    info!(agent = %config.name, model = %config.model, "running CLI agent");

    let child = cmd.spawn().map_err(|e| {
        AgentError::Subprocess(format!("failed to spawn CLI agent '{}': {e}", config.name))
    })?;

    let output = tokio::time::timeout(
        Duration::from_secs(config.timeout_seconds),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| AgentError::Timeout {
        seconds: config.timeout_seconds,
    })?
    .map_err(|e| AgentError::Subprocess(format!("CLI agent process error: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentError::Subprocess(format!(
            "CLI agent exited with code {}: {stderr}",
            output.status.code().unwrap_or(1)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    extract_final_reply(&stdout, &config.name)
}

/// Pull the final model reply out of the CLI's JSON output.
///
/// The output is either an array of events or a single result object. The
/// `type=result` entry's `result` field wins; the fallback is the last
/// assistant text block.
pub fn extract_final_reply(json_output: &str, agent_name: &str) -> Result<String> {
    let parsed: Value = match serde_json::from_str(json_output) {
        Ok(v) => v,
        Err(e) => {
            warn!(agent = agent_name, "CLI output is not JSON ({e}), returning raw");
            return Ok(json_output.to_string());
        }
    };

    let messages: Vec<Value> = match parsed {
        Value::Array(items) => items,
        single => vec![single],
    };

    for msg in &messages {
        if msg.get("type").and_then(Value::as_str) == Some("result") {
            if let Some(result) = msg.get("result").and_then(Value::as_str) {
                if !result.is_empty() {
                    return Ok(result.to_string());
                }
            }
            if msg.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                let error = msg
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(AgentError::Subprocess(format!(
                    "CLI agent returned error: {error}"
                )));
            }
        }
    }

    for msg in messages.iter().rev() {
        if msg.get("type").and_then(Value::as_str) == Some("assistant") {
            if let Some(blocks) = msg.pointer("/message/content").and_then(Value::as_array) {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            return Ok(text.to_string());
                        }
                    }
                }
            }
        }
    }

    warn!(agent = agent_name, "CLI agent produced no extractable result");
    Ok(String::new())
}
