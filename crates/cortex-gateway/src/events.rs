//! Wire events on the client bus.
//!
//! The chat UI is an external collaborator; this is the complete event set
//! the core emits and the complete set of client messages it accepts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ack {
        msg_id: String,
        chat_id: String,
    },
    ContentDelta {
        chat_id: String,
        text: String,
    },
    ThinkingDelta {
        chat_id: String,
        text: String,
    },
    ToolStart {
        chat_id: String,
        tool_id: String,
        tool_name: String,
    },
    ToolUse {
        chat_id: String,
        tool_id: String,
        tool_name: String,
        input: Value,
    },
    ToolEnd {
        chat_id: String,
        tool_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    SessionInit {
        chat_id: String,
        session_id: String,
    },
    ResultMeta {
        chat_id: String,
        session_id: String,
        cost_usd: f64,
        duration_ms: u64,
        num_turns: u32,
        usage: Value,
    },
    Error {
        chat_id: String,
        message: String,
    },
    NewMessageNotification {
        #[serde(rename = "chatId")]
        chat_id: String,
        preview: String,
        critical: bool,
        #[serde(rename = "playSound")]
        play_sound: bool,
    },
    /// Sent after a restart to sessions whose in-flight work was dropped.
    TurnInterrupted {
        chat_id: String,
        reason: String,
    },
}

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserTurn {
        msg_id: String,
        #[serde(default)]
        chat_id: Option<String>,
        content: String,
    },
    Heartbeat {
        #[serde(default)]
        current_chat_id: Option<String>,
        #[serde(default)]
        is_active: bool,
    },
    Interrupt {
        chat_id: String,
    },
    Inject {
        chat_id: String,
        content: String,
    },
    PushSubscribe {
        subscription: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_events_tag_with_snake_case_type() {
        let event = ServerEvent::ContentDelta {
            chat_id: "c1".into(),
            text: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_delta");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"user_turn","msg_id":"m1","chat_id":"c1","content":"hello"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::UserTurn { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"heartbeat","current_chat_id":"c1","is_active":true}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Heartbeat { .. }));
    }

    #[test]
    fn notification_uses_camel_case_fields() {
        let event = ServerEvent::NewMessageNotification {
            chat_id: "c1".into(),
            preview: "p".into(),
            critical: false,
            play_sound: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "new_message_notification");
        assert!(json["playSound"].as_bool().unwrap());
        assert_eq!(json["chatId"], "c1");
    }
}
