use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Injected into a chat as a marked automated user turn.
    #[default]
    Prompt,
    /// Routed through the agent invoker.
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub prompt: String,
    pub schedule: String,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub last_run: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Descriptor handed to the dispatcher when a task fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFire {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub silent: bool,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Prefix marking a prompt-task turn as automated, so the agent knows the
/// user didn't type it.
pub const SCHEDULED_PROMPT_PREFIX: &str = "[SCHEDULED AUTOMATION]";
