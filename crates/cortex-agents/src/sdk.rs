//! Streaming SDK subprocess session.
//!
//! The Agent SDK binary speaks newline-delimited JSON in both directions.
//! We consume a fixed set of event shapes (deltas, tool blocks, init,
//! result) and ignore everything else. While a response streams, new user
//! messages can be appended through a bounded injection queue that the
//! subprocess reads as streaming input; the queue is closed on turn
//! completion or interrupt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};

/// Tool output is truncated to this many chars before leaving the session.
const TOOL_OUTPUT_CAP: usize = 2000;
/// Injection queue depth; sends beyond this fail with `InjectionClosed`.
const INJECTION_QUEUE_DEPTH: usize = 16;

/// Typed events surfaced to the invoker. Everything else on the wire is
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolStart {
        tool_id: String,
        tool_name: String,
    },
    ToolUse {
        tool_id: String,
        tool_name: String,
        input: Value,
    },
    ToolEnd {
        tool_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    SessionInit {
        session_id: String,
    },
    ResultMeta {
        session_id: String,
        is_error: bool,
        result: String,
        cost_usd: f64,
        duration_ms: u64,
        num_turns: u32,
        usage: Value,
    },
}

/// Stateful wire parser: tracks `tool_id → tool_name` so tool results can
/// be attributed, since result blocks only carry the id.
#[derive(Default)]
pub struct EventParser {
    tool_names: HashMap<String, String>,
}

impl EventParser {
    /// Parse one stdout line into zero or more events.
    pub fn parse_line(&mut self, line: &str) -> Vec<SdkEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            debug!("unparseable SDK line, skipping");
            return Vec::new();
        };
        self.parse_value(&value)
    }

    fn parse_value(&mut self, value: &Value) -> Vec<SdkEvent> {
        match value.get("type").and_then(Value::as_str) {
            Some("stream_event") => self.parse_stream_event(value.get("event").unwrap_or(value)),
            Some("assistant") => self.parse_assistant(value),
            Some("system") => {
                if value.get("subtype").and_then(Value::as_str) == Some("init") {
                    let session_id = value
                        .get("session_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    vec![SdkEvent::SessionInit { session_id }]
                } else {
                    Vec::new()
                }
            }
            Some("result") => vec![SdkEvent::ResultMeta {
                session_id: value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                result: value
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                cost_usd: value
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                duration_ms: value
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                num_turns: value.get("num_turns").and_then(Value::as_u64).unwrap_or(0) as u32,
                usage: value.get("usage").cloned().unwrap_or(Value::Null),
            }],
            _ => Vec::new(),
        }
    }

    fn parse_stream_event(&mut self, event: &Value) -> Vec<SdkEvent> {
        match event.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let delta = event.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        vec![SdkEvent::TextDelta { text }]
                    }
                    Some("thinking_delta") => {
                        let text = delta
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        vec![SdkEvent::ThinkingDelta { text }]
                    }
                    _ => Vec::new(),
                }
            }
            Some("content_block_start") => {
                let block = event.get("content_block").unwrap_or(&Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let tool_id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let tool_name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.tool_names.insert(tool_id.clone(), tool_name.clone());
                    vec![SdkEvent::ToolStart { tool_id, tool_name }]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn parse_assistant(&mut self, value: &Value) -> Vec<SdkEvent> {
        let blocks = value
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut events = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let tool_id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let tool_name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.tool_names.insert(tool_id.clone(), tool_name.clone());
                    events.push(SdkEvent::ToolUse {
                        tool_id,
                        tool_name,
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                Some("tool_result") => {
                    let tool_id = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let tool_name = self
                        .tool_names
                        .get(&tool_id)
                        .cloned()
                        .unwrap_or_default();
                    let output = content_to_text(block.get("content").unwrap_or(&Value::Null));
                    events.push(SdkEvent::ToolEnd {
                        tool_id,
                        tool_name,
                        output: truncate_chars(&output, TOOL_OUTPUT_CAP),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    });
                }
                _ => {}
            }
        }
        events
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(cap).collect();
        out.push_str("...");
        out
    }
}

/// Launch parameters for one SDK session.
#[derive(Debug, Clone)]
pub struct SdkLaunch {
    /// SDK binary (`claude` unless configured otherwise).
    pub command: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub output_format: Option<Value>,
    pub thinking: Option<Value>,
    /// Working directory (the per-invocation isolated config dir).
    pub cwd: Option<PathBuf>,
    pub prompt: String,
}

/// A live streaming session: events out, injections in.
pub struct SdkSession {
    events: mpsc::Receiver<SdkEvent>,
    injector: mpsc::Sender<String>,
    cancel: CancellationToken,
    pub pid: Option<u32>,
}

impl SdkSession {
    /// Spawn the SDK subprocess and start its I/O task.
    pub fn spawn(launch: SdkLaunch) -> Result<Self> {
        let mut cmd = Command::new(&launch.command);
        cmd.arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&launch.model)
            .arg("--max-turns")
            .arg(launch.max_turns.to_string())
            .arg("--dangerously-skip-permissions")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        if let Some(prompt) = &launch.system_prompt {
            cmd.arg("--system-prompt").arg(prompt);
        }
        if !launch.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(launch.allowed_tools.join(","));
        }
        if let Some(format) = &launch.output_format {
            cmd.arg("--output-schema").arg(format.to_string());
        }
        if let Some(thinking) = &launch.thinking {
            cmd.arg("--thinking").arg(thinking.to_string());
        }
        if let Some(cwd) = &launch.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Subprocess(format!("SDK binary not found at '{}'", launch.command))
            } else {
                AgentError::Subprocess(format!("failed to spawn SDK session: {e}"))
            }
        })?;
        let pid = child.id();

        let (event_tx, event_rx) = mpsc::channel(256);
        let (inject_tx, inject_rx) = mpsc::channel(INJECTION_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        tokio::spawn(run_session_io(
            child,
            launch.prompt,
            event_tx,
            inject_rx,
            cancel.clone(),
        ));

        Ok(Self {
            events: event_rx,
            injector: inject_tx,
            cancel,
            pid,
        })
    }

    /// Next event, or `None` when the subprocess is done.
    pub async fn next_event(&mut self) -> Option<SdkEvent> {
        self.events.recv().await
    }

    /// Append a user message mid-stream. Fails once the queue is closed
    /// (turn completed or interrupted).
    pub async fn inject(&self, text: String) -> Result<()> {
        self.injector
            .send(text)
            .await
            .map_err(|_| AgentError::InjectionClosed)
    }

    /// Interrupt: closes the injection queue first, then signals the
    /// subprocess.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Clone of the injection sender, for routing mid-stream user messages
    /// from another task.
    pub fn injector(&self) -> mpsc::Sender<String> {
        self.injector.clone()
    }

    /// Token that interrupts this session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn user_message_line(text: &str) -> String {
    let mut line = json!({
        "type": "user",
        "message": {"role": "user", "content": [{"type": "text", "text": text}]}
    })
    .to_string();
    line.push('\n');
    line
}

async fn run_session_io(
    mut child: Child,
    prompt: String,
    event_tx: mpsc::Sender<SdkEvent>,
    mut inject_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let Some(mut stdin) = child.stdin.take() else {
        error!("SDK child has no stdin");
        return;
    };
    let Some(stdout) = child.stdout.take() else {
        error!("SDK child has no stdout");
        return;
    };

    if let Err(e) = stdin.write_all(user_message_line(&prompt).as_bytes()).await {
        error!("failed to write prompt to SDK session: {e}");
        let _ = child.kill().await;
        return;
    }

    let mut lines = BufReader::new(stdout).lines();
    let mut parser = EventParser::default();
    let mut saw_result = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        for event in parser.parse_line(&line) {
                            let is_result = matches!(event, SdkEvent::ResultMeta { .. });
                            if event_tx.send(event).await.is_err() {
                                // Receiver gone; stop reading.
                                saw_result = true;
                                break;
                            }
                            if is_result {
                                saw_result = true;
                            }
                        }
                        if saw_result {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("SDK stdout read error: {e}");
                        break;
                    }
                }
            }
            injected = inject_rx.recv() => {
                match injected {
                    Some(text) => {
                        debug!("injecting user message into live session");
                        if let Err(e) = stdin.write_all(user_message_line(&text).as_bytes()).await {
                            warn!("failed to inject message: {e}");
                        }
                    }
                    None => {
                        // All senders dropped; nothing more to forward.
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("SDK session interrupted");
                break;
            }
        }
    }

    // Close the injection path, then reap the child: graceful first,
    // forceful if it lingers.
    inject_rx.close();
    drop(stdin);
    let graceful = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await;
    if graceful.is_err() {
        warn!("SDK child did not exit, killing");
        let _ = child.kill().await;
    }
}
