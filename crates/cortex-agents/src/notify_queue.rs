//! Ping-mode notification queue.
//!
//! When a ping-mode agent completes, its result is queued here keyed to the
//! source chat. The primary agent's next turn in that chat sees the pending
//! notifications in its context and must acknowledge them; they are then
//! marked injected. Terminal notifications ignore further state changes.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use cortex_core::files::locked_update;

use crate::error::Result;
use crate::types::{NotificationStatus, PendingNotification};

#[derive(Debug, Default, Serialize, Deserialize)]
struct NotificationsFile {
    #[serde(default)]
    notifications: Vec<PendingNotification>,
    #[serde(default)]
    last_updated: String,
}

pub struct NotificationQueue {
    file: PathBuf,
}

impl NotificationQueue {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    pub fn add(
        &self,
        agent: &str,
        agent_response: &str,
        source_chat_id: &str,
        invoked_at: DateTime<Utc>,
    ) -> Result<PendingNotification> {
        let notification = PendingNotification {
            id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            invoked_at,
            completed_at: Utc::now(),
            source_chat_id: source_chat_id.to_string(),
            agent_response: agent_response.to_string(),
            status: NotificationStatus::Pending,
        };
        let stored = notification.clone();
        locked_update(&self.file, NotificationsFile::default(), move |mut data| {
            data.notifications.push(stored);
            data.last_updated = cortex_core::time::now_iso();
            (data, ())
        })?;
        info!(agent, chat = source_chat_id, "queued ping notification");
        Ok(notification)
    }

    pub fn get_pending(&self, chat_id: Option<&str>) -> Vec<PendingNotification> {
        let data: NotificationsFile =
            cortex_core::files::load_json(&self.file, NotificationsFile::default());
        data.notifications
            .into_iter()
            .filter(|n| n.status == NotificationStatus::Pending)
            .filter(|n| chat_id.map_or(true, |c| n.source_chat_id == c))
            .collect()
    }

    /// Mark notifications injected. A no-op for ids already terminal.
    pub fn mark_injected(&self, ids: &[String]) -> Result<usize> {
        self.transition(ids, NotificationStatus::Injected)
    }

    /// Mark notifications expired. A no-op for ids already terminal.
    pub fn mark_expired(&self, ids: &[String]) -> Result<usize> {
        self.transition(ids, NotificationStatus::Expired)
    }

    fn transition(&self, ids: &[String], to: NotificationStatus) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        let marked = locked_update(&self.file, NotificationsFile::default(), move |mut data| {
            let mut marked = 0;
            for n in data.notifications.iter_mut() {
                if ids.contains(&n.id) && n.status == NotificationStatus::Pending {
                    n.status = to;
                    marked += 1;
                }
            }
            data.last_updated = cortex_core::time::now_iso();
            (data, marked)
        })?;
        Ok(marked)
    }

    /// Drop terminal notifications older than `max_age_hours`.
    pub fn cleanup(&self, max_age_hours: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        locked_update(&self.file, NotificationsFile::default(), move |mut data| {
            let before = data.notifications.len();
            data.notifications.retain(|n| {
                n.status == NotificationStatus::Pending || n.completed_at >= cutoff
            });
            let removed = before - data.notifications.len();
            (data, removed)
        })
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(dir: &std::path::Path) -> NotificationQueue {
        NotificationQueue::new(dir.join("pending.json"))
    }

    #[test]
    fn add_and_filter_by_chat() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.add("scout", "found it", "chat-1", Utc::now()).unwrap();
        q.add("scout", "other", "chat-2", Utc::now()).unwrap();

        assert_eq!(q.get_pending(Some("chat-1")).len(), 1);
        assert_eq!(q.get_pending(None).len(), 2);
    }

    #[test]
    fn mark_injected_is_terminal_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let n = q.add("scout", "r", "chat-1", Utc::now()).unwrap();

        assert_eq!(q.mark_injected(&[n.id.clone()]).unwrap(), 1);
        // Already terminal: no-op.
        assert_eq!(q.mark_injected(&[n.id.clone()]).unwrap(), 0);
        assert_eq!(q.mark_expired(&[n.id.clone()]).unwrap(), 0);
        assert!(q.get_pending(None).is_empty());
    }

    #[test]
    fn cleanup_keeps_pending() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let n = q.add("scout", "r", "chat-1", Utc::now()).unwrap();
        q.mark_expired(&[n.id]).unwrap();
        q.add("scout", "fresh", "chat-1", Utc::now()).unwrap();

        // Terminal entries newer than the cutoff survive; pending always do.
        assert_eq!(q.cleanup(24).unwrap(), 0);
        assert_eq!(q.get_pending(None).len(), 1);
    }
}
