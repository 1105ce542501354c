//! Conversation store — one JSON file per chat.
//!
//! Saves are atomic under a per-chat advisory lock held in
//! `chats/.locks/<id>.lock`, and each save refreshes the `chats_meta.json`
//! sidecar so listing chats never has to open every chat file.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use cortex_core::files::{load_json, FileLock};

use crate::error::Result;
use crate::types::{Chat, ChatMeta};

pub struct ChatStore {
    chats_dir: PathBuf,
    locks_dir: PathBuf,
    meta_file: PathBuf,
}

/// Listing entry: chat id, title, and the resolved ordering timestamp.
#[derive(Debug, Clone)]
pub struct ChatListing {
    pub id: String,
    pub title: String,
    pub last_message_at: String,
    pub is_system: bool,
    pub scheduled: bool,
}

impl ChatStore {
    pub fn open(chats_dir: PathBuf, meta_file: PathBuf) -> Result<Self> {
        let locks_dir = chats_dir.join(".locks");
        fs::create_dir_all(&locks_dir)?;
        Ok(Self {
            chats_dir,
            locks_dir,
            meta_file,
        })
    }

    fn chat_file(&self, id: &str) -> PathBuf {
        self.chats_dir.join(format!("{id}.json"))
    }

    fn lock_target(&self, id: &str) -> PathBuf {
        // FileLock appends ".lock" to this path's file name.
        self.locks_dir.join(id)
    }

    pub fn load(&self, id: &str) -> Option<Chat> {
        let path = self.chat_file(id);
        if !path.exists() {
            return None;
        }
        let chat: Chat = load_json(&path, Chat::new(id));
        Some(chat)
    }

    pub fn load_or_create(&self, id: &str) -> Chat {
        self.load(id).unwrap_or_else(|| Chat::new(id))
    }

    /// Atomic save under the chat's advisory lock, then refresh the meta
    /// sidecar.
    pub fn save(&self, chat: &Chat) -> Result<()> {
        fs::create_dir_all(&self.chats_dir)?;
        let _lock = FileLock::acquire(&self.lock_target(&chat.id), Duration::from_secs(10))?;

        let path = self.chat_file(&chat.id);
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}", chat.id))
            .suffix(".tmp")
            .tempfile_in(&self.chats_dir)
            .map_err(cortex_core::CoreError::Io)?;
        serde_json::to_writer_pretty(tmp.as_file(), chat)
            .map_err(cortex_core::CoreError::Serialization)?;
        tmp.persist(&path)
            .map_err(|e| cortex_core::CoreError::Io(e.error))?;
        drop(_lock);

        self.update_meta(chat)?;
        debug!(chat = %chat.id, messages = chat.messages.len(), "saved chat");
        Ok(())
    }

    fn update_meta(&self, chat: &Chat) -> Result<()> {
        let updated_at = chat
            .last_message_at
            .clone()
            .unwrap_or_else(cortex_core::time::now_iso);
        let entry = ChatMeta {
            title: chat.title.clone(),
            updated_at,
            is_system: chat.is_system,
            scheduled: chat.scheduled,
        };
        cortex_core::files::locked_update(
            &self.meta_file,
            BTreeMap::<String, ChatMeta>::new(),
            |mut meta| {
                meta.insert(chat.id.clone(), entry);
                (meta, ())
            },
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.chat_file(id);
        let existed = path.exists();
        if existed {
            fs::remove_file(&path)?;
        }
        cortex_core::files::locked_update(
            &self.meta_file,
            BTreeMap::<String, ChatMeta>::new(),
            |mut meta| {
                meta.remove(id);
                (meta, ())
            },
        )?;
        Ok(existed)
    }

    /// List chats newest-first by `last_message_at`.
    ///
    /// The timestamp is resolved in order of preference: the chat's
    /// explicit field, the maximum timestamp encoded in message ids, and
    /// finally file mtime.
    pub fn list(&self) -> Vec<ChatListing> {
        let meta: BTreeMap<String, ChatMeta> = load_json(&self.meta_file, BTreeMap::new());

        let mut listings = Vec::new();
        let Ok(entries) = fs::read_dir(&self.chats_dir) else {
            return listings;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };

            if let Some(m) = meta.get(id) {
                listings.push(ChatListing {
                    id: id.to_string(),
                    title: m.title.clone(),
                    last_message_at: m.updated_at.clone(),
                    is_system: m.is_system,
                    scheduled: m.scheduled,
                });
                continue;
            }

            // Sidecar miss — fall back to reading the chat file.
            let Some(chat) = self.load(id) else {
                continue;
            };
            let last = chat
                .last_message_at
                .clone()
                .or_else(|| max_message_id_timestamp(&chat))
                .or_else(|| file_mtime_iso(&path))
                .unwrap_or_default();
            listings.push(ChatListing {
                id: id.to_string(),
                title: chat.title,
                last_message_at: last,
                is_system: chat.is_system,
                scheduled: chat.scheduled,
            });
        }

        listings.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        listings
    }
}

/// Message ids are timestamp-prefixed (`msg_YYYYmmdd_HHMMSS_xxxx`); the max
/// across messages approximates the last activity time.
fn max_message_id_timestamp(chat: &Chat) -> Option<String> {
    chat.messages
        .iter()
        .filter_map(|m| {
            let rest = m.id.split_once('_')?.1;
            let (stamp, _) = rest.rsplit_once('_')?;
            chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()
        })
        .max()
        .map(|dt| dt.and_utc().to_rfc3339())
}

fn file_mtime_iso(path: &std::path::Path) -> Option<String> {
    let mtime = fs::metadata(path).ok()?.modified().ok()?;
    let dt: DateTime<Utc> = mtime.into();
    Some(dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, MessageRole};

    fn store(dir: &std::path::Path) -> ChatStore {
        ChatStore::open(dir.join("chats"), dir.join("chats_meta.json")).unwrap()
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut chat = Chat::new("c1");
        chat.title = "Morning plans".to_string();
        chat.push_message(ChatMessage::new(MessageRole::User, "hello"));
        s.save(&chat).unwrap();

        let loaded = s.load("c1").unwrap();
        assert_eq!(loaded.title, "Morning plans");
        assert_eq!(loaded.messages.len(), 1);
        assert!(loaded.last_message_at.is_some());
    }

    #[test]
    fn missing_chat_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.load("nope").is_none());
    }

    #[test]
    fn list_orders_by_last_message() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let mut older = Chat::new("older");
        older.last_message_at = Some("2026-01-01T00:00:00+00:00".to_string());
        older.title = "old".to_string();
        s.save(&older).unwrap();

        let mut newer = Chat::new("newer");
        newer.last_message_at = Some("2026-06-01T00:00:00+00:00".to_string());
        newer.title = "new".to_string();
        s.save(&newer).unwrap();

        let listings = s.list();
        assert_eq!(listings[0].id, "newer");
        assert_eq!(listings[1].id, "older");
    }

    #[test]
    fn meta_sidecar_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut chat = Chat::new("c1");
        chat.title = "T".to_string();
        chat.push_message(ChatMessage::new(MessageRole::User, "x"));
        s.save(&chat).unwrap();

        let meta: BTreeMap<String, ChatMeta> =
            load_json(&dir.path().join("chats_meta.json"), BTreeMap::new());
        assert_eq!(meta.get("c1").unwrap().title, "T");
    }

    #[test]
    fn delete_removes_file_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let chat = Chat::new("gone");
        s.save(&chat).unwrap();
        assert!(s.delete("gone").unwrap());
        assert!(s.load("gone").is_none());
        let meta: BTreeMap<String, ChatMeta> =
            load_json(&dir.path().join("chats_meta.json"), BTreeMap::new());
        assert!(!meta.contains_key("gone"));
    }
}
