use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    /// Hidden record of a tool invocation, re-injected into later turns in
    /// compact one-line form rather than shown in the UI.
    ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default)]
    pub hidden: bool,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: cortex_core::ids::prefixed_id("msg"),
            role,
            content: content.into(),
            created_at: cortex_core::time::now_iso(),
            images: Vec::new(),
            hidden: false,
        }
    }

    pub fn hidden_tool_call(content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageRole::ToolCall, content);
        msg.hidden = true;
        msg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub last_message_at: Option<String>,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub agent: Option<String>,
    /// SDK session id captured from the last `session_init` event.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cumulative_usage: Usage,
    #[serde(default)]
    pub exchange_count: u32,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            messages: Vec::new(),
            last_message_at: None,
            scheduled: false,
            is_system: false,
            agent: None,
            session_id: None,
            cumulative_usage: Usage::default(),
            exchange_count: 0,
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.last_message_at = Some(message.created_at.clone());
        self.messages.push(message);
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Sidecar entry in `chats_meta.json`, keyed by chat id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMeta {
    pub title: String,
    pub updated_at: String,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub scheduled: bool,
}
