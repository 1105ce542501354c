//! The notification decision table.
//!
//! Inputs: is the chat silent, is any fresh client viewing it, is any
//! client connected at all, and is the message critical. Stale sessions
//! (no heartbeat within the timeout) don't count as connected.

use crate::types::ClientSessions;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationDecision {
    pub notify: bool,
    pub use_toast: bool,
    pub use_push: bool,
    pub use_email: bool,
    pub play_sound: bool,
    pub reason: &'static str,
}

/// Decide whether and how to notify for a message in `chat_id`.
pub fn should_notify(
    chat_id: &str,
    is_silent: bool,
    client_sessions: &ClientSessions,
    critical: bool,
    now: f64,
    stale_timeout: f64,
) -> NotificationDecision {
    // Silent tasks never notify unless critical overrides.
    if is_silent && !critical {
        return NotificationDecision {
            reason: "silent_chat",
            ..NotificationDecision::default()
        };
    }

    let mut has_active_connection = false;
    let mut user_is_viewing = false;
    for session in client_sessions.values() {
        if !session.is_fresh(now, stale_timeout) {
            continue;
        }
        has_active_connection = true;
        if session.is_active && session.current_chat_id.as_deref() == Some(chat_id) {
            user_is_viewing = true;
            break;
        }
    }

    // Already looking at it: nothing to announce, unless critical.
    if user_is_viewing && !critical {
        return NotificationDecision {
            reason: "user_viewing",
            ..NotificationDecision::default()
        };
    }

    if critical {
        return NotificationDecision {
            notify: true,
            use_toast: has_active_connection,
            use_push: true,
            use_email: true,
            play_sound: has_active_connection,
            reason: "critical_message",
        };
    }

    if has_active_connection {
        // Online but elsewhere. Push regardless — an open browser tab
        // doesn't mean the human is present.
        return NotificationDecision {
            notify: true,
            use_toast: true,
            use_push: true,
            use_email: false,
            play_sound: true,
            reason: "user_online_not_viewing",
        };
    }

    NotificationDecision {
        notify: true,
        use_toast: false,
        use_push: true,
        use_email: false,
        play_sound: false,
        reason: "user_offline",
    }
}
