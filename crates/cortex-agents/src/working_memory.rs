//! Per-agent working memory.
//!
//! Ephemeral notes that survive across exchanges but expire on a TTL
//! counted in completed exchanges. Pinned items (max 3, rank 1–3) never
//! expire; items with a future deadline hold their TTL until the deadline
//! passes. Display order and 1-based indices come from the sort: pinned
//! first by rank, then soonest deadline, then recency.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cortex_core::files::{load_json, save_json};
use cortex_core::ids::short_id;

use crate::error::{AgentError, Result};

pub const DEFAULT_TTL: u32 = 5;
pub const MAX_TTL: u32 = 10;
pub const MAX_PINNED: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineType {
    Soft,
    Hard,
}

impl Default for DeadlineType {
    fn default() -> Self {
        DeadlineType::Soft
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemoryItem {
    pub item_id: String,
    pub content: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub ttl_initial: u32,
    pub ttl_remaining: u32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default = "default_pin_rank")]
    pub pin_rank: u8,
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remind_before: Option<String>,
    #[serde(default)]
    pub deadline_type: DeadlineType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_pin_rank() -> u8 {
    1
}

impl WorkingMemoryItem {
    pub fn is_overdue(&self) -> bool {
        self.deadline_at.map_or(false, |d| Utc::now() > d)
    }

    /// T-/T+ countdown with coarsening granularity.
    pub fn deadline_countdown(&self) -> Option<String> {
        let deadline = self.deadline_at?;
        let delta = deadline - Utc::now();
        let (prefix, magnitude) = if delta.num_seconds() >= 0 {
            ("T-", delta)
        } else {
            ("T+", -delta)
        };
        let label = if magnitude.num_minutes() < 1 {
            "<1m".to_string()
        } else if magnitude.num_hours() < 1 {
            format!("{}m", magnitude.num_minutes())
        } else if magnitude.num_days() < 1 {
            format!("{}h", magnitude.num_hours())
        } else {
            format!("{}d", magnitude.num_days())
        };
        Some(format!("{prefix}{label}"))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkingMemoryFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    items: Vec<WorkingMemoryItem>,
}

/// Parameters for adding an item.
#[derive(Debug, Default, Clone)]
pub struct NewItem {
    pub content: String,
    pub tag: Option<String>,
    pub ttl: Option<u32>,
    pub pinned: bool,
    pub pin_rank: u8,
    pub deadline_at: Option<DateTime<Utc>>,
    pub remind_before: Option<String>,
    pub deadline_type: DeadlineType,
}

pub struct WorkingMemoryStore {
    file: PathBuf,
    state: Mutex<WorkingMemoryFile>,
}

impl WorkingMemoryStore {
    pub fn open(file: PathBuf) -> Self {
        let state: WorkingMemoryFile = load_json(&file, WorkingMemoryFile::default());
        Self {
            file,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &WorkingMemoryFile) -> Result<()> {
        save_json(&self.file, state)?;
        Ok(())
    }

    fn clamp_ttl(ttl: Option<u32>) -> u32 {
        ttl.unwrap_or(DEFAULT_TTL).clamp(1, MAX_TTL)
    }

    fn sort(items: &mut [WorkingMemoryItem]) {
        items.sort_by(|a, b| {
            let key = |i: &WorkingMemoryItem| -> (u8, i64, i64) {
                if i.pinned {
                    (0, -(i.pin_rank as i64), -i.updated_at.timestamp())
                } else if let Some(d) = i.deadline_at {
                    (1, (d - Utc::now()).num_seconds(), -i.updated_at.timestamp())
                } else {
                    (2, -i.updated_at.timestamp(), 0)
                }
            };
            key(a).cmp(&key(b))
        });
    }

    pub fn add(&self, new: NewItem) -> Result<WorkingMemoryItem> {
        let content = new.content.trim().to_string();
        if content.is_empty() {
            return Err(AgentError::InvalidConfig("cannot add empty note".into()));
        }

        let mut state = self.state.lock().unwrap();
        if state.items.iter().any(|i| i.content == content) {
            return Err(AgentError::InvalidConfig(
                "working memory already contains that note".into(),
            ));
        }
        if new.pinned && state.items.iter().filter(|i| i.pinned).count() >= MAX_PINNED {
            return Err(AgentError::InvalidConfig(format!(
                "maximum of {MAX_PINNED} pinned items; unpin one first"
            )));
        }

        let ttl = Self::clamp_ttl(new.ttl);
        let now = Utc::now();
        let item = WorkingMemoryItem {
            item_id: short_id(),
            content,
            tag: new.tag,
            ttl_initial: ttl,
            ttl_remaining: ttl,
            pinned: new.pinned,
            pin_rank: new.pin_rank.clamp(1, 3),
            deadline_at: new.deadline_at,
            remind_before: new.remind_before,
            deadline_type: new.deadline_type,
            created_at: now,
            updated_at: now,
        };
        state.items.push(item.clone());
        state.version += 1;
        self.persist(&state)?;
        Ok(item)
    }

    /// Items in display order.
    pub fn list(&self) -> Vec<WorkingMemoryItem> {
        let mut items = self.state.lock().unwrap().items.clone();
        Self::sort(&mut items);
        items
    }

    /// Remove by 1-based display index.
    pub fn remove(&self, index: usize) -> Result<WorkingMemoryItem> {
        let mut state = self.state.lock().unwrap();
        let mut sorted = state.items.clone();
        Self::sort(&mut sorted);
        if index < 1 || index > sorted.len() {
            return Err(AgentError::InvalidConfig(format!(
                "no item numbered {index}; valid indices: 1-{}",
                sorted.len()
            )));
        }
        let target = sorted[index - 1].clone();
        state.items.retain(|i| i.item_id != target.item_id);
        state.version += 1;
        self.persist(&state)?;
        Ok(target)
    }

    /// Update content/tag/pin state by 1-based display index.
    pub fn update(
        &self,
        index: usize,
        content: Option<String>,
        tag: Option<String>,
        pinned: Option<bool>,
        ttl: Option<u32>,
    ) -> Result<WorkingMemoryItem> {
        let mut state = self.state.lock().unwrap();
        let mut sorted = state.items.clone();
        Self::sort(&mut sorted);
        if index < 1 || index > sorted.len() {
            return Err(AgentError::InvalidConfig(format!(
                "no item numbered {index}; valid indices: 1-{}",
                sorted.len()
            )));
        }
        let target_id = sorted[index - 1].item_id.clone();

        if pinned == Some(true) {
            let already = state
                .items
                .iter()
                .filter(|i| i.pinned && i.item_id != target_id)
                .count();
            if already >= MAX_PINNED {
                return Err(AgentError::InvalidConfig(format!(
                    "maximum of {MAX_PINNED} pinned items; unpin one first"
                )));
            }
        }

        let item = state
            .items
            .iter_mut()
            .find(|i| i.item_id == target_id)
            .expect("id from sorted snapshot");
        if let Some(content) = content {
            item.content = content;
        }
        if let Some(tag) = tag {
            item.tag = Some(tag);
        }
        if let Some(pinned) = pinned {
            item.pinned = pinned;
        }
        if let Some(ttl) = ttl {
            let ttl = Self::clamp_ttl(Some(ttl));
            item.ttl_initial = ttl;
            item.ttl_remaining = ttl;
        }
        item.updated_at = Utc::now();
        let updated = item.clone();
        state.version += 1;
        self.persist(&state)?;
        Ok(updated)
    }

    /// One tick per completed exchange: decrement TTLs and purge expired
    /// items. Pinned items don't count down; neither do items with a
    /// deadline still in the future.
    pub fn advance_exchange(&self) -> Result<Vec<WorkingMemoryItem>> {
        let mut state = self.state.lock().unwrap();
        let mut purged = Vec::new();
        for item in state.items.iter_mut() {
            if item.pinned {
                continue;
            }
            let deadline_holds_ttl = item.deadline_at.map_or(false, |d| Utc::now() <= d);
            if deadline_holds_ttl {
                continue;
            }
            item.ttl_remaining = item.ttl_remaining.saturating_sub(1);
        }
        state.items.retain(|i| {
            let expired = !i.pinned && i.ttl_remaining == 0;
            if expired {
                purged.push(i.clone());
            }
            !expired
        });
        if !purged.is_empty() {
            debug!(purged = purged.len(), "working memory items expired");
        }
        state.version += 1;
        self.persist(&state)?;
        Ok(purged)
    }
}

/// Render the store for prompt injection: 1-based indices matching the
/// display order, pin markers, tags, TTL and deadline countdowns.
pub fn format_working_memory(items: &[WorkingMemoryItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut lines = vec!["Working memory (ephemeral notes, numbered for reference):".to_string()];
    for (i, item) in items.iter().enumerate() {
        let mut markers = Vec::new();
        if item.pinned {
            markers.push(format!("pinned#{}", item.pin_rank));
        } else {
            markers.push(format!("ttl:{}", item.ttl_remaining));
        }
        if let Some(tag) = &item.tag {
            markers.push(format!("tag:{tag}"));
        }
        if let Some(countdown) = item.deadline_countdown() {
            markers.push(countdown);
        }
        lines.push(format!("{}. [{}] {}", i + 1, markers.join(" "), item.content));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store(dir: &std::path::Path) -> WorkingMemoryStore {
        WorkingMemoryStore::open(dir.join("working_memory.json"))
    }

    fn note(content: &str) -> NewItem {
        NewItem {
            content: content.to_string(),
            pin_rank: 1,
            ..NewItem::default()
        }
    }

    #[test]
    fn ttl_counts_down_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add(NewItem {
            ttl: Some(2),
            ..note("short lived")
        })
        .unwrap();

        assert!(s.advance_exchange().unwrap().is_empty());
        let purged = s.advance_exchange().unwrap();
        assert_eq!(purged.len(), 1);
        assert!(s.list().is_empty());
    }

    #[test]
    fn pinned_items_never_expire() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add(NewItem {
            pinned: true,
            ttl: Some(1),
            ..note("keep me")
        })
        .unwrap();
        for _ in 0..5 {
            s.advance_exchange().unwrap();
        }
        assert_eq!(s.list().len(), 1);
    }

    #[test]
    fn future_deadline_holds_ttl_past_deadline_counts() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add(NewItem {
            ttl: Some(1),
            deadline_at: Some(Utc::now() + Duration::hours(2)),
            ..note("deadline ahead")
        })
        .unwrap();
        s.advance_exchange().unwrap();
        assert_eq!(s.list().len(), 1, "future deadline must hold the TTL");

        s.add(NewItem {
            ttl: Some(1),
            deadline_at: Some(Utc::now() - Duration::hours(2)),
            ..note("deadline passed")
        })
        .unwrap();
        let purged = s.advance_exchange().unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].content, "deadline passed");
    }

    #[test]
    fn max_three_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for i in 0..3 {
            s.add(NewItem {
                pinned: true,
                ..note(&format!("pin {i}"))
            })
            .unwrap();
        }
        let err = s
            .add(NewItem {
                pinned: true,
                ..note("one too many")
            })
            .unwrap_err();
        assert!(err.to_string().contains("pinned"));
    }

    #[test]
    fn sort_order_pinned_deadline_recency() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add(note("plain note")).unwrap();
        s.add(NewItem {
            deadline_at: Some(Utc::now() + Duration::hours(1)),
            ..note("due soon")
        })
        .unwrap();
        s.add(NewItem {
            pinned: true,
            pin_rank: 2,
            ..note("pinned high")
        })
        .unwrap();

        let listed = s.list();
        assert_eq!(listed[0].content, "pinned high");
        assert_eq!(listed[1].content, "due soon");
        assert_eq!(listed[2].content, "plain note");
    }

    #[test]
    fn remove_by_display_index() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add(note("first")).unwrap();
        s.add(note("second")).unwrap();

        let removed = s.remove(1).unwrap();
        // Most recent first among plain notes.
        assert_eq!(removed.content, "second");
        assert!(s.remove(5).is_err());
    }

    #[test]
    fn duplicate_content_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add(note("same")).unwrap();
        assert!(s.add(note("same")).is_err());
    }

    #[test]
    fn countdown_granularity() {
        let mut item = WorkingMemoryItem {
            item_id: "i".into(),
            content: "c".into(),
            tag: None,
            ttl_initial: 5,
            ttl_remaining: 5,
            pinned: false,
            pin_rank: 1,
            deadline_at: Some(Utc::now() + Duration::minutes(30) + Duration::seconds(5)),
            remind_before: None,
            deadline_type: DeadlineType::Soft,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(item.deadline_countdown().unwrap(), "T-30m");
        item.deadline_at = Some(Utc::now() - Duration::hours(3));
        assert_eq!(item.deadline_countdown().unwrap(), "T+3h");
        item.deadline_at = Some(Utc::now() + Duration::days(2) + Duration::minutes(5));
        assert_eq!(item.deadline_countdown().unwrap(), "T-2d");
        item.deadline_at = Some(Utc::now() + Duration::seconds(20));
        assert_eq!(item.deadline_countdown().unwrap(), "T-<1m");
    }
}
