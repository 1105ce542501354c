use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One connected client, tracked by the gateway's WebSocket layer.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Unix seconds of the last heartbeat.
    pub last_heartbeat: f64,
    /// Whether the tab reports itself focused.
    pub is_active: bool,
    /// Chat the client is currently viewing.
    pub current_chat_id: Option<String>,
}

impl ClientSession {
    pub fn is_fresh(&self, now: f64, stale_timeout: f64) -> bool {
        now - self.last_heartbeat <= stale_timeout
    }
}

/// Keyed by connection id.
pub type ClientSessions = HashMap<String, ClientSession>;

/// A web-push subscription registered by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    /// `p256dh` and `auth` client keys.
    pub keys: HashMap<String, String>,
    #[serde(default)]
    pub created_at: Option<String>,
}
