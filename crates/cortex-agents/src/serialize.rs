//! Tool-call serialization for chat history.
//!
//! Every tool use observed during a turn becomes a hidden `tool_call`
//! message. A per-tool policy decides which arguments survive and how much
//! output is kept; the renderer turns the stored record into a compact
//! one-liner for re-injection into later turns, so agents remember what
//! they ran without paying for full outputs every turn.

use serde_json::{json, Map, Value};

/// Default caps for tools without a dedicated policy.
const DEFAULT_ARG_COUNT: usize = 5;
const DEFAULT_OUTPUT_CAP: usize = 300;

/// Truncate, preferring to break at a newline when one lands past 60% of
/// the cap.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    if let Some(last_nl) = cut.rfind('\n') {
        if last_nl as f64 > max_chars as f64 * 0.6 {
            return format!("{}\n...", &cut[..last_nl]);
        }
    }
    format!("{cut}...")
}

fn pick(args: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    let mut out = Map::new();
    for key in keys {
        if let Some(v) = args.get(*key) {
            out.insert((*key).to_string(), v.clone());
        }
    }
    out
}

fn pick_with_truncated(
    args: &Map<String, Value>,
    keys: &[&str],
    truncated_key: &str,
    cap: usize,
) -> Map<String, Value> {
    let mut kept = pick(args, keys);
    if let Some(v) = args.get(truncated_key) {
        let text = value_to_display(v);
        kept.insert(truncated_key.to_string(), Value::String(truncate(&text, cap)));
    }
    kept
}

fn value_to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A serialized tool call, stored inside a hidden chat message.
#[derive(Debug, Clone)]
pub struct SerializedToolCall {
    pub tool: String,
    pub args: Map<String, Value>,
    pub output_summary: String,
    pub is_error: bool,
}

impl SerializedToolCall {
    pub fn to_json(&self) -> Value {
        json!({
            "tool": self.tool,
            "args": self.args,
            "output_summary": self.output_summary,
            "is_error": self.is_error,
        })
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            tool: value.get("tool")?.as_str()?.to_string(),
            args: value.get("args")?.as_object().cloned().unwrap_or_default(),
            output_summary: value
                .get("output_summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Serialize one observed tool call under its per-tool policy.
pub fn serialize_tool_call(tool: &str, args: &Value, output: &str, is_error: bool) -> SerializedToolCall {
    let args = match args {
        Value::Object(map) => map.clone(),
        Value::String(raw) => serde_json::from_str::<Map<String, Value>>(raw)
            .unwrap_or_else(|_| {
                let mut m = Map::new();
                m.insert("_raw".to_string(), Value::String(raw.clone()));
                m
            }),
        _ => Map::new(),
    };

    let (kept, output_summary) = match tool {
        "Bash" => (
            pick(&args, &["command", "description"]),
            truncate(output, 500),
        ),
        "invoke_agent" => (
            pick_with_truncated(&args, &["agent", "mode", "model_override"], "prompt", 300),
            truncate(output, 500),
        ),
        "schedule_task" | "schedule_agent" => (
            pick_with_truncated(&args, &["agent", "schedule", "silent"], "prompt", 200),
            truncate(output, 200),
        ),
        "search_memory" => (pick(&args, &["query", "k"]), truncate(output, 500)),
        "working_memory" => (
            pick_with_truncated(&args, &["action", "index", "tag"], "content", 200),
            truncate(output, 200),
        ),
        "web_search" => (pick(&args, &["query"]), truncate(output, 500)),
        "generate_image" => (
            pick(&args, &["prompt", "aspect_ratio", "resolution"]),
            // Output is a file path + dimensions; keep it whole.
            output.to_string(),
        ),
        _ => {
            // Default policy: first N args, short output.
            let mut kept = Map::new();
            for (k, v) in args.iter().take(DEFAULT_ARG_COUNT) {
                let display = value_to_display(v);
                kept.insert(k.clone(), Value::String(truncate(&display, 120)));
            }
            (kept, truncate(output, DEFAULT_OUTPUT_CAP))
        }
    };

    SerializedToolCall {
        tool: tool.to_string(),
        args: kept,
        output_summary,
        is_error,
    }
}

/// Render a stored tool call as the compact one-liner injected into the
/// next turn's context.
pub fn render_tool_call(call: &SerializedToolCall) -> String {
    let mut parts = vec![format!("Tool: {}", call.tool)];
    for (k, v) in &call.args {
        parts.push(format!("{k}: {}", value_to_display(v)));
    }
    if call.is_error {
        parts.push("error: true".to_string());
    }
    if !call.output_summary.is_empty() {
        let flat = call.output_summary.replace('\n', " ");
        parts.push(format!("Output: {flat}"));
    }
    format!("[{}]", parts.join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_keeps_command_and_truncates_output() {
        let args = json!({"command": "ls -la", "description": "list", "timeout": 5000});
        let call = serialize_tool_call("Bash", &args, &"line\n".repeat(200), false);
        assert!(call.args.contains_key("command"));
        assert!(!call.args.contains_key("timeout"));
        assert!(call.output_summary.chars().count() <= 504);
    }

    #[test]
    fn invoke_agent_truncates_prompt() {
        let args = json!({"agent": "scout", "mode": "ping", "prompt": "p".repeat(1000)});
        let call = serialize_tool_call("invoke_agent", &args, "accepted", false);
        let prompt = call.args["prompt"].as_str().unwrap();
        assert!(prompt.chars().count() <= 303);
        assert_eq!(call.args["agent"], "scout");
    }

    #[test]
    fn default_policy_caps_args_and_output() {
        let args = json!({"a":1,"b":2,"c":3,"d":4,"e":5,"f":6,"g":7});
        let call = serialize_tool_call("mystery_tool", &args, &"o".repeat(1000), false);
        assert_eq!(call.args.len(), DEFAULT_ARG_COUNT);
        assert!(call.output_summary.chars().count() <= DEFAULT_OUTPUT_CAP + 3);
    }

    #[test]
    fn render_is_one_line() {
        let call = serialize_tool_call(
            "Bash",
            &json!({"command": "echo hi"}),
            "hi\nand more",
            false,
        );
        let rendered = render_tool_call(&call);
        assert!(rendered.starts_with("[Tool: Bash |"));
        assert!(!rendered.contains('\n'));
        assert!(rendered.contains("Output: hi and more"));
    }

    #[test]
    fn error_flag_surfaces_in_render() {
        let call = serialize_tool_call("web_search", &json!({"query": "x"}), "failed", true);
        assert!(render_tool_call(&call).contains("error: true"));
    }

    #[test]
    fn json_roundtrip() {
        let call = serialize_tool_call("Bash", &json!({"command": "pwd"}), "/home", false);
        let restored = SerializedToolCall::from_json(&call.to_json()).unwrap();
        assert_eq!(restored.tool, "Bash");
        assert_eq!(restored.output_summary, "/home");
    }

    #[test]
    fn newline_aware_truncation() {
        let text = format!("{}\nshort tail", "a".repeat(290));
        let out = truncate(&text, 300);
        assert!(out.ends_with("\n..."));
        assert!(!out.contains("short tail"));
    }
}
