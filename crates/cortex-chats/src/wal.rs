//! Write-ahead log for message persistence.
//!
//! A user message is written here before any processing starts, and
//! streaming assistant responses are checkpointed as they arrive, so a
//! crash mid-turn loses at most the last checkpoint interval of text.
//! On restart, stale in-flight entries are cleared and the client is told
//! the previous turn was interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cortex_core::files::{load_json, save_json};
use cortex_core::time::now_unix;

use crate::error::Result;

/// Seconds between streaming checkpoints.
const CHECKPOINT_INTERVAL: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Received,
    Processing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub msg_id: String,
    /// Chat session id (may be `"new"` until resolved).
    pub session_id: String,
    pub content: String,
    /// Unix seconds when received.
    pub timestamp: f64,
    pub status: PendingStatus,
    #[serde(default)]
    pub ack_sent: bool,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingResponse {
    pub session_id: String,
    pub chat_id: String,
    /// Id of the user message that triggered this response.
    pub msg_id: String,
    #[serde(default)]
    pub content_segments: Vec<String>,
    #[serde(default)]
    pub last_checkpoint: f64,
    #[serde(default)]
    pub started_at: f64,
    #[serde(default)]
    pub tool_in_progress: Option<String>,
}

impl StreamingResponse {
    pub fn full_text(&self) -> String {
        self.content_segments.join("")
    }
}

struct WalState {
    pending: HashMap<String, PendingMessage>,
    streaming: HashMap<String, StreamingResponse>,
}

pub struct MessageWal {
    pending_file: PathBuf,
    streaming_file: PathBuf,
    state: Mutex<WalState>,
}

impl MessageWal {
    pub fn open(wal_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&wal_dir)?;
        let pending_file = wal_dir.join("pending_messages.json");
        let streaming_file = wal_dir.join("streaming_responses.json");

        let pending: HashMap<String, PendingMessage> = load_json(&pending_file, HashMap::new());
        let streaming: HashMap<String, StreamingResponse> =
            load_json(&streaming_file, HashMap::new());
        if !pending.is_empty() || !streaming.is_empty() {
            info!(
                pending = pending.len(),
                streaming = streaming.len(),
                "loaded WAL state from disk"
            );
        }

        Ok(Self {
            pending_file,
            streaming_file,
            state: Mutex::new(WalState { pending, streaming }),
        })
    }

    fn save_pending(&self, state: &WalState) {
        if let Err(e) = save_json(&self.pending_file, &state.pending) {
            warn!("failed to save pending messages: {e}");
        }
    }

    fn save_streaming(&self, state: &WalState) {
        if let Err(e) = save_json(&self.streaming_file, &state.streaming) {
            warn!("failed to save streaming responses: {e}");
        }
    }

    // --- pending messages ---------------------------------------------

    /// The critical write-ahead operation: called before any processing.
    pub fn write_message(&self, msg_id: &str, session_id: &str, content: &str) -> PendingMessage {
        let msg = PendingMessage {
            msg_id: msg_id.to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
            timestamp: now_unix(),
            status: PendingStatus::Received,
            ack_sent: false,
            chat_id: None,
            error: None,
        };
        let mut state = self.state.lock().unwrap();
        state.pending.insert(msg_id.to_string(), msg.clone());
        self.save_pending(&state);
        info!(msg_id, "message written to WAL");
        msg
    }

    pub fn ack_message(&self, msg_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.pending.get_mut(msg_id) {
            msg.ack_sent = true;
            self.save_pending(&state);
        }
    }

    pub fn start_processing(&self, msg_id: &str, chat_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.pending.get_mut(msg_id) {
            msg.status = PendingStatus::Processing;
            msg.chat_id = Some(chat_id.to_string());
            self.save_pending(&state);
            info!(msg_id, chat_id, "message processing");
        }
    }

    pub fn complete_message(&self, msg_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(msg_id).is_some() {
            self.save_pending(&state);
            info!(msg_id, "message completed, removed from WAL");
        }
    }

    pub fn fail_message(&self, msg_id: &str, error: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.pending.get_mut(msg_id) {
            msg.status = PendingStatus::Failed;
            msg.error = Some(error.to_string());
            self.save_pending(&state);
            warn!(msg_id, error, "message failed");
        }
    }

    pub fn get_pending_messages(&self) -> Vec<PendingMessage> {
        self.state.lock().unwrap().pending.values().cloned().collect()
    }

    // --- streaming responses ------------------------------------------

    pub fn start_streaming(&self, session_id: &str, chat_id: &str, msg_id: &str) {
        let now = now_unix();
        let mut state = self.state.lock().unwrap();
        state.streaming.insert(
            session_id.to_string(),
            StreamingResponse {
                session_id: session_id.to_string(),
                chat_id: chat_id.to_string(),
                msg_id: msg_id.to_string(),
                content_segments: Vec::new(),
                last_checkpoint: now,
                started_at: now,
                tool_in_progress: None,
            },
        );
        self.save_streaming(&state);
        debug!(session_id, "streaming started");
    }

    /// Append text to the current segment, flushing to disk when forced or
    /// when the checkpoint interval has elapsed.
    pub fn append_content(&self, session_id: &str, text: &str, force_checkpoint: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(resp) = state.streaming.get_mut(session_id) else {
            return;
        };
        match resp.content_segments.last_mut() {
            Some(segment) => segment.push_str(text),
            None => resp.content_segments.push(text.to_string()),
        }
        let now = now_unix();
        if force_checkpoint || now - resp.last_checkpoint >= CHECKPOINT_INTERVAL {
            resp.last_checkpoint = now;
            self.save_streaming(&state);
        }
    }

    /// Start a new content segment (between tool invocations).
    pub fn new_segment(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(resp) = state.streaming.get_mut(session_id) {
            resp.content_segments.push(String::new());
        }
    }

    /// Persisted immediately — a crash during a tool run must be visible.
    pub fn set_tool_in_progress(&self, session_id: &str, tool_name: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        if let Some(resp) = state.streaming.get_mut(session_id) {
            resp.tool_in_progress = tool_name.map(String::from);
            self.save_streaming(&state);
        }
    }

    /// Pop and return the finished stream record.
    pub fn complete_streaming(&self, session_id: &str) -> Option<StreamingResponse> {
        let mut state = self.state.lock().unwrap();
        let resp = state.streaming.remove(session_id);
        if resp.is_some() {
            self.save_streaming(&state);
            info!(session_id, "streaming completed");
        }
        resp
    }

    pub fn get_streaming(&self, session_id: &str) -> Option<StreamingResponse> {
        self.state.lock().unwrap().streaming.get(session_id).cloned()
    }

    // --- recovery ------------------------------------------------------

    /// On boot: drop every `received`/`processing` pending entry and every
    /// streaming record — they belong to a dead process. `failed` entries
    /// survive for diagnosis. Returns the dropped entries so callers can
    /// notify reconnecting sessions of the interruption.
    pub fn clear_stale_on_restart(&self) -> (Vec<PendingMessage>, Vec<StreamingResponse>) {
        let mut state = self.state.lock().unwrap();

        let stale_ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, m)| {
                matches!(m.status, PendingStatus::Received | PendingStatus::Processing)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let mut dropped_pending = Vec::new();
        for id in &stale_ids {
            if let Some(m) = state.pending.remove(id) {
                info!(msg_id = %id, status = ?m.status, "clearing stale pending message");
                dropped_pending.push(m);
            }
        }

        let dropped_streaming: Vec<StreamingResponse> = state.streaming.drain().map(|(_, r)| r).collect();
        for r in &dropped_streaming {
            info!(session_id = %r.session_id, "clearing stale streaming response");
        }

        if !dropped_pending.is_empty() || !dropped_streaming.is_empty() {
            self.save_pending(&state);
            self.save_streaming(&state);
            info!(
                pending = dropped_pending.len(),
                streaming = dropped_streaming.len(),
                "cleared stale WAL entries on restart"
            );
        }
        (dropped_pending, dropped_streaming)
    }

    /// Periodic GC of entries older than `max_age_hours`.
    pub fn clear_old_entries(&self, max_age_hours: f64) {
        let cutoff = now_unix() - max_age_hours * 3600.0;
        let mut state = self.state.lock().unwrap();
        let before_pending = state.pending.len();
        let before_streaming = state.streaming.len();
        state.pending.retain(|_, m| m.timestamp >= cutoff);
        state.streaming.retain(|_, r| r.started_at >= cutoff);
        if state.pending.len() != before_pending || state.streaming.len() != before_streaming {
            self.save_pending(&state);
            self.save_streaming(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wal(dir: &std::path::Path) -> MessageWal {
        MessageWal::open(dir.join("wal")).unwrap()
    }

    #[test]
    fn message_lifecycle_received_processing_complete() {
        let dir = tempfile::tempdir().unwrap();
        let w = wal(dir.path());
        w.write_message("m1", "s1", "hi");
        assert_eq!(w.get_pending_messages()[0].status, PendingStatus::Received);

        w.start_processing("m1", "chat-1");
        let pending = w.get_pending_messages();
        assert_eq!(pending[0].status, PendingStatus::Processing);
        assert_eq!(pending[0].chat_id.as_deref(), Some("chat-1"));

        w.complete_message("m1");
        assert!(w.get_pending_messages().is_empty());
    }

    #[test]
    fn stale_clear_drops_in_flight_keeps_failed() {
        let dir = tempfile::tempdir().unwrap();
        let w = wal(dir.path());
        w.write_message("m1", "s1", "in flight");
        w.start_processing("m1", "chat-1");
        w.write_message("m2", "s2", "broken");
        w.fail_message("m2", "boom");
        w.start_streaming("s1", "chat-1", "m1");

        let (dropped_pending, dropped_streaming) = w.clear_stale_on_restart();
        assert_eq!(dropped_pending.len(), 1);
        assert_eq!(dropped_streaming.len(), 1);

        let remaining = w.get_pending_messages();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].msg_id, "m2");
        assert_eq!(remaining[0].status, PendingStatus::Failed);
        assert!(w.get_streaming("s1").is_none());
    }

    #[test]
    fn stale_clear_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let w = wal(dir.path());
            w.write_message("m1", "s1", "x");
            w.start_processing("m1", "chat-1");
            w.start_streaming("s1", "chat-1", "m1");
        }
        // Simulated restart: reopen from disk, then clear.
        let w = wal(dir.path());
        assert_eq!(w.get_pending_messages().len(), 1);
        w.clear_stale_on_restart();
        assert!(w.get_pending_messages().is_empty());

        let w2 = wal(dir.path());
        assert!(w2.get_pending_messages().is_empty());
    }

    #[test]
    fn append_accumulates_and_segments_split() {
        let dir = tempfile::tempdir().unwrap();
        let w = wal(dir.path());
        w.start_streaming("s1", "c1", "m1");
        w.append_content("s1", "Hello ", false);
        w.append_content("s1", "world", false);
        w.new_segment("s1");
        w.append_content("s1", "after tool", false);

        let resp = w.complete_streaming("s1").unwrap();
        assert_eq!(resp.content_segments, vec!["Hello world", "after tool"]);
        assert_eq!(resp.full_text(), "Hello worldafter tool");
        assert!(w.complete_streaming("s1").is_none());
    }

    #[test]
    fn force_checkpoint_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let w = wal(dir.path());
        w.start_streaming("s1", "c1", "m1");
        w.append_content("s1", "precious text", true);

        // A second handle reading from disk sees the checkpointed text.
        let w2 = wal(dir.path());
        let resp = w2.get_streaming("s1").unwrap();
        assert_eq!(resp.full_text(), "precious text");
    }

    #[test]
    fn tool_in_progress_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let w = wal(dir.path());
        w.start_streaming("s1", "c1", "m1");
        w.set_tool_in_progress("s1", Some("web_search"));
        assert_eq!(
            w.get_streaming("s1").unwrap().tool_in_progress.as_deref(),
            Some("web_search")
        );
        w.set_tool_in_progress("s1", None);
        assert!(w.get_streaming("s1").unwrap().tool_in_progress.is_none());
    }

    #[test]
    fn old_entries_are_garbage_collected() {
        let dir = tempfile::tempdir().unwrap();
        let w = wal(dir.path());
        w.write_message("m1", "s1", "old");
        // Age the entry artificially.
        {
            let mut state = w.state.lock().unwrap();
            state.pending.get_mut("m1").unwrap().timestamp -= 100.0 * 3600.0;
            w.save_pending(&state);
        }
        w.clear_old_entries(24.0);
        assert!(w.get_pending_messages().is_empty());
    }
}
