//! Self-restart with conversation continuity.
//!
//! The primary agent can restart the server (after changing its own
//! configuration, say). A continuation marker survives the restart; on the
//! next boot the marker's prompt is replayed as a synthetic user turn in
//! the original session, then the marker is deleted.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::AppState;
use crate::turn;

const SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationMarker {
    pub session_id: String,
    pub restart_time: String,
    pub reason: String,
    pub message_count: usize,
    pub continuation_prompt: String,
}

impl ContinuationMarker {
    pub fn new(session_id: &str, reason: Option<&str>, message_count: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            restart_time: cortex_core::time::now_iso(),
            reason: reason
                .unwrap_or("Server restart requested by the assistant")
                .to_string(),
            message_count,
            continuation_prompt: "Restart completed successfully. \
                Please continue from where you left off. \
                If you were testing a change, verify it now."
                .to_string(),
        }
    }
}

/// Write the marker, spawn the start script detached, then stop this
/// process: SIGTERM to ourselves first, SIGKILL-equivalent hard exit if the
/// graceful path stalls.
pub fn initiate_restart(state: &Arc<AppState>, session_id: &str, reason: Option<&str>) -> std::io::Result<()> {
    let message_count = state
        .chats
        .load(session_id)
        .map(|c| c.messages.len())
        .unwrap_or(0);
    let marker = ContinuationMarker::new(session_id, reason, message_count);
    cortex_core::files::save_json(&state.config.data.restart_marker_file(), &marker)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    info!(session = session_id, "continuation marker written");

    if let Some(script) = &state.config.data.start_script {
        spawn_start_script(script, &state.config.data.dir)?;
    } else {
        warn!("no start script configured; restart will not relaunch the server");
    }

    let pid = std::process::id();
    tokio::spawn(async move {
        unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
        warn!("graceful shutdown timed out, exiting hard");
        std::process::exit(1);
    });
    Ok(())
}

/// Detached launch of the start script with logs redirected.
fn spawn_start_script(script: &Path, data_dir: &Path) -> std::io::Result<()> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join("server_restart.log"))?;
    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 1 && exec {}", script.display()))
        .stdin(std::process::Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;
    info!(pid = child.id(), script = %script.display(), "start script spawned");
    Ok(())
}

/// On boot: replay the continuation prompt if a marker is present, then
/// delete the marker.
pub async fn resume_continuation(state: &Arc<AppState>) {
    let marker_file = state.config.data.restart_marker_file();
    if !marker_file.exists() {
        return;
    }
    let marker: ContinuationMarker = cortex_core::files::load_json(
        &marker_file,
        ContinuationMarker::new("", None, 0),
    );
    if let Err(e) = std::fs::remove_file(&marker_file) {
        warn!("failed to delete continuation marker: {e}");
    }
    if marker.session_id.is_empty() {
        return;
    }
    info!(session = %marker.session_id, "resuming after restart");
    let msg_id = cortex_core::ids::prefixed_id("msg");
    turn::process_turn(
        state,
        &msg_id,
        &marker.session_id,
        &marker.continuation_prompt,
        false,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_roundtrips_through_json() {
        let marker = ContinuationMarker::new("chat-7", Some("config change"), 42);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart_continuation.json");
        cortex_core::files::save_json(&path, &marker).unwrap();

        let loaded: ContinuationMarker =
            cortex_core::files::load_json(&path, ContinuationMarker::new("", None, 0));
        assert_eq!(loaded.session_id, "chat-7");
        assert_eq!(loaded.reason, "config change");
        assert_eq!(loaded.message_count, 42);
        assert!(loaded.continuation_prompt.contains("continue"));
    }
}
