use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How an agent is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    /// Blocking: await completion, return the result.
    Foreground,
    /// Return immediately; queue a notification for the source chat when
    /// the agent completes.
    Ping,
    /// Fire and forget, execution-logged only.
    Trust,
    /// Same behavior as trust, fired by the scheduler.
    Scheduled,
}

impl std::str::FromStr for InvocationMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "foreground" => Ok(Self::Foreground),
            "ping" => Ok(Self::Ping),
            "trust" => Ok(Self::Trust),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown invocation mode: {other}")),
        }
    }
}

/// Agent implementation flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Streaming SDK subprocess session.
    #[default]
    Sdk,
    /// One-shot CLI invocation (`--print --output-format json`).
    Cli,
}

/// Per-agent configuration, loaded from `config.toml` + `prompt.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: AgentKind,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// JSON schema constraining the agent's final output.
    #[serde(default)]
    pub output_format: Option<serde_json::Value>,
    /// System prompt content (sibling prompt.md).
    #[serde(default, skip)]
    pub prompt: Option<String>,
    /// Named system-prompt preset; prompt.md becomes an append.
    #[serde(default)]
    pub system_prompt_preset: Option<String>,
    #[serde(default)]
    pub chattable: bool,
    /// The default agent for chat turns.
    #[serde(default)]
    pub default: bool,
    /// Thinking-effort override: "low" | "medium" | "high".
    #[serde(default)]
    pub effort: Option<String>,
    /// Explicit thinking budget tokens (haiku-class models).
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

fn default_model() -> String {
    "sonnet".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_max_turns() -> u32 {
    200
}

impl AgentConfig {
    pub fn has_skills(&self) -> bool {
        self.tools.iter().any(|t| t == "Skill")
    }
}

/// A request to execute an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub agent: String,
    pub prompt: String,
    pub mode: InvocationMode,
    #[serde(default)]
    pub source_chat_id: Option<String>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub invoked_at: DateTime<Utc>,
}

impl AgentInvocation {
    pub fn new(agent: impl Into<String>, prompt: impl Into<String>, mode: InvocationMode) -> Self {
        Self {
            agent: agent.into(),
            prompt: prompt.into(),
            mode,
            source_chat_id: None,
            model_override: None,
            project: None,
            invoked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Error,
    Timeout,
}

/// Result of one agent execution. Failures never raise across the invoker
/// boundary; they land here as a status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentStatus,
    pub response: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResult {
    pub fn failure(agent: &str, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            status: AgentStatus::Error,
            response: String::new(),
            started_at,
            completed_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Injected,
    Expired,
}

/// A completed ping-mode invocation waiting to be surfaced in its source
/// chat's next turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingNotification {
    pub id: String,
    pub agent: String,
    pub invoked_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub source_chat_id: String,
    pub agent_response: String,
    pub status: NotificationStatus,
}

impl PendingNotification {
    /// Pending and older than the threshold.
    pub fn is_stale(&self, threshold_secs: i64) -> bool {
        self.status == NotificationStatus::Pending
            && Utc::now() - self.completed_at > Duration::seconds(threshold_secs)
    }
}
