//! Thread store — named collections of atoms.
//!
//! Two thread types with very different lifecycles:
//! `topical` threads are Gardener territory, capped at 75 atoms (soft warn
//! at 50) and subject to split/merge maintenance; `conversation` threads
//! mirror one chat each (`scope = "room:{chat_id}"`), are owned by the
//! Librarian, and are never split, merged, or assigned to by maintenance.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cortex_core::files::{load_json, save_json};
use cortex_core::ids::prefixed_id;
use cortex_core::time::now_iso;

use crate::content::ContentType;
use crate::error::{MemoryError, Result};
use crate::index::EmbeddingIndex;

/// Warn and recommend a split at this size.
pub const SOFT_CAP: usize = 50;
/// Refuse new assignments at this size.
pub const HARD_CAP: usize = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    Topical,
    Conversation,
}

impl Default for ThreadType {
    fn default() -> Self {
        ThreadType::Topical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub memory_ids: Vec<String>,
    #[serde(default)]
    pub thread_type: ThreadType,
    #[serde(default)]
    pub split_from: Option<String>,
    #[serde(default)]
    pub split_into: Option<Vec<String>>,
    pub created_at: String,
    pub last_updated: String,
    #[serde(default)]
    pub embedding_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ThreadsFile {
    version: u32,
    threads: Vec<Thread>,
    #[serde(default)]
    last_modified: String,
}

impl Default for ThreadsFile {
    fn default() -> Self {
        Self {
            version: 4,
            threads: Vec::new(),
            last_modified: String::new(),
        }
    }
}

/// Membership edit mode for [`ThreadStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryIdsAction {
    Overwrite,
    Append,
    Remove,
}

/// One child definition for [`ThreadStore::split_thread`].
#[derive(Debug, Clone)]
pub struct SplitChild {
    pub name: String,
    pub description: String,
    pub scope: String,
    pub atom_ids: Vec<String>,
}

/// Outcome of a split.
#[derive(Debug, Default)]
pub struct SplitResult {
    pub new_thread_ids: Vec<String>,
    pub atoms_reassigned: usize,
    pub source_deleted: bool,
}

pub struct ThreadStore {
    file: PathBuf,
    index: Arc<EmbeddingIndex>,
    threads: Mutex<Vec<Thread>>,
}

impl ThreadStore {
    pub fn open(file: PathBuf, index: Arc<EmbeddingIndex>) -> Self {
        let data: ThreadsFile = load_json(&file, ThreadsFile::default());
        info!(count = data.threads.len(), "loaded threads");
        Self {
            file,
            index,
            threads: Mutex::new(data.threads),
        }
    }

    fn persist(&self) -> Result<()> {
        let threads = self.threads.lock().unwrap().clone();
        save_json(
            &self.file,
            &ThreadsFile {
                version: 4,
                threads,
                last_modified: now_iso(),
            },
        )?;
        Ok(())
    }

    async fn embed_thread(&self, id: &str, name: &str, description: &str) -> Option<String> {
        match self
            .index
            .embed(
                &format!("{name}: {description}"),
                serde_json::json!({"thread_id": id}),
                Some(ContentType::Thread),
            )
            .await
        {
            Ok(emb_id) => Some(emb_id),
            Err(e) => {
                warn!(thread = %id, "failed to embed thread: {e}");
                None
            }
        }
    }

    /// Create a thread, embedding `"{name}: {description}"` as type
    /// `thread`. Scope defaults to the description.
    pub async fn create(
        &self,
        name: &str,
        description: &str,
        memory_ids: Vec<String>,
        scope: Option<String>,
        split_from: Option<String>,
        thread_type: ThreadType,
    ) -> Result<Thread> {
        let now = now_iso();
        let id = prefixed_id("thread");
        let embedding_id = self.embed_thread(&id, name, description).await;
        let thread = Thread {
            id,
            name: name.to_string(),
            description: description.to_string(),
            scope: scope.unwrap_or_else(|| description.to_string()),
            memory_ids,
            thread_type,
            split_from,
            split_into: None,
            created_at: now.clone(),
            last_updated: now,
            embedding_id,
        };
        self.threads.lock().unwrap().push(thread.clone());
        self.persist()?;
        debug!(thread = %thread.id, name = %thread.name, "created thread");
        Ok(thread)
    }

    /// Update name/description/membership. Name or description changes
    /// re-embed the thread (old embedding deleted, new one created).
    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
        memory_ids: Option<Vec<String>>,
        action: MemoryIdsAction,
    ) -> Result<Option<Thread>> {
        let (reembed, old_embedding, snapshot) = {
            let mut threads = self.threads.lock().unwrap();
            let Some(thread) = threads.iter_mut().find(|t| t.id == id) else {
                return Ok(None);
            };
            let reembed = name.is_some() || description.is_some();
            if let Some(name) = name {
                thread.name = name;
            }
            if let Some(description) = description {
                thread.description = description;
            }
            if let Some(ids) = memory_ids {
                match action {
                    MemoryIdsAction::Overwrite => thread.memory_ids = ids,
                    MemoryIdsAction::Append => {
                        for mid in ids {
                            if !thread.memory_ids.contains(&mid) {
                                thread.memory_ids.push(mid);
                            }
                        }
                    }
                    MemoryIdsAction::Remove => {
                        thread.memory_ids.retain(|m| !ids.contains(m));
                    }
                }
            }
            thread.last_updated = now_iso();
            let old = if reembed { thread.embedding_id.take() } else { None };
            (reembed, old, thread.clone())
        };

        if reembed {
            if let Some(old_id) = old_embedding {
                let _ = self.index.delete_by_id(&old_id).await;
            }
            let new_id = self
                .embed_thread(&snapshot.id, &snapshot.name, &snapshot.description)
                .await;
            let mut threads = self.threads.lock().unwrap();
            if let Some(thread) = threads.iter_mut().find(|t| t.id == id) {
                thread.embedding_id = new_id;
            }
        }

        self.persist()?;
        Ok(self.get(id))
    }

    /// Delete a thread (atoms are untouched).
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let embedding_id = {
            let mut threads = self.threads.lock().unwrap();
            let before = threads.len();
            let emb = threads
                .iter()
                .find(|t| t.id == id)
                .and_then(|t| t.embedding_id.clone());
            threads.retain(|t| t.id != id);
            if threads.len() == before {
                return Ok(false);
            }
            emb
        };
        if let Some(emb_id) = embedding_id {
            let _ = self.index.delete_by_id(&emb_id).await;
        }
        self.persist()?;
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<Thread> {
        self.threads.lock().unwrap().iter().find(|t| t.id == id).cloned()
    }

    /// Case-insensitive name lookup.
    pub fn get_by_name(&self, name: &str) -> Option<Thread> {
        let needle = name.to_lowercase();
        self.threads
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name.to_lowercase() == needle)
            .cloned()
    }

    pub fn list_all(&self) -> Vec<Thread> {
        self.threads.lock().unwrap().clone()
    }

    /// The conversation thread for a chat, if one exists. At most one per
    /// chat id.
    pub fn get_conversation_thread_for_room(&self, room_id: &str) -> Option<Thread> {
        let scope_key = format!("room:{room_id}");
        self.threads
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.thread_type == ThreadType::Conversation && t.scope == scope_key)
            .cloned()
    }

    /// All threads containing an atom (the lazily built inverse map).
    pub fn get_threads_for_memory(&self, memory_id: &str) -> Vec<Thread> {
        self.threads
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.memory_ids.iter().any(|m| m == memory_id))
            .cloned()
            .collect()
    }

    /// Drop an atom id from every thread (delete-atom cleanup).
    pub fn remove_memory_from_all(&self, memory_id: &str) -> Result<()> {
        let modified = {
            let mut threads = self.threads.lock().unwrap();
            let mut modified = false;
            for thread in threads.iter_mut() {
                let before = thread.memory_ids.len();
                thread.memory_ids.retain(|m| m != memory_id);
                if thread.memory_ids.len() != before {
                    thread.last_updated = now_iso();
                    modified = true;
                }
            }
            modified
        };
        if modified {
            self.persist()?;
        }
        Ok(())
    }

    /// Idempotent append of an atom to a thread.
    pub fn add_memory_to_thread(&self, thread_id: &str, memory_id: &str) -> Result<bool> {
        let found = {
            let mut threads = self.threads.lock().unwrap();
            match threads.iter_mut().find(|t| t.id == thread_id) {
                Some(thread) => {
                    if !thread.memory_ids.iter().any(|m| m == memory_id) {
                        thread.memory_ids.push(memory_id.to_string());
                        thread.last_updated = now_iso();
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.persist()?;
        }
        Ok(found)
    }

    /// Raise `last_updated` to at least `last_updated` (monotone).
    pub fn touch(&self, thread_id: &str, last_updated: &str) -> Result<()> {
        {
            let mut threads = self.threads.lock().unwrap();
            if let Some(thread) = threads.iter_mut().find(|t| t.id == thread_id) {
                if thread.last_updated.as_str() < last_updated {
                    thread.last_updated = last_updated.to_string();
                }
            }
        }
        self.persist()
    }

    /// Set `last_updated` exactly. Conversation threads keep it equal to
    /// the max member-atom `created_at`; the Chronicler repairs drift after
    /// a summarization pass.
    pub fn set_last_updated(&self, thread_id: &str, last_updated: &str) -> Result<()> {
        {
            let mut threads = self.threads.lock().unwrap();
            if let Some(thread) = threads.iter_mut().find(|t| t.id == thread_id) {
                thread.last_updated = last_updated.to_string();
            }
        }
        self.persist()
    }

    pub async fn find_or_create(&self, name: &str, description: &str) -> Result<Thread> {
        if let Some(existing) = self.get_by_name(name) {
            return Ok(existing);
        }
        self.create(name, description, Vec::new(), None, None, ThreadType::Topical)
            .await
    }

    /// Whether the Gardener may assign into this thread.
    ///
    /// Refused for conversation threads and for topical threads at or over
    /// the hard cap; a warning is logged from the soft cap up.
    pub fn can_assign_to_thread(&self, thread_id: &str) -> (bool, String) {
        let Some(thread) = self.get(thread_id) else {
            return (false, format!("Thread not found: {thread_id}"));
        };
        if thread.thread_type == ThreadType::Conversation {
            return (
                false,
                format!("Thread '{}' is a system-managed conversation thread", thread.name),
            );
        }
        let size = thread.memory_ids.len();
        if size >= HARD_CAP {
            return (
                false,
                format!(
                    "Thread '{}' has {size} atoms (hard cap: {HARD_CAP}). Must split before accepting new assignments.",
                    thread.name
                ),
            );
        }
        if size >= SOFT_CAP {
            warn!(
                thread = %thread.name,
                size,
                "thread over soft cap ({SOFT_CAP}); assignment allowed but split recommended"
            );
        }
        (true, "OK".to_string())
    }

    /// Semantic search over threads (content type `thread`).
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(Thread, f32)>> {
        let hits = self
            .index
            .retrieve(query, k * 2, 0.2, Some(ContentType::Thread))
            .await?;
        let mut results = Vec::new();
        for (meta, score) in hits {
            let Some(thread_id) = meta.metadata.get("thread_id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(thread) = self.get(thread_id) {
                results.push((thread, score));
            }
            if results.len() >= k {
                break;
            }
        }
        Ok(results)
    }

    /// Split a thread into new children, moving atoms out of the source.
    ///
    /// Validation reports the full error list before anything mutates:
    /// every child needs a name, description and atoms; every moved atom
    /// must be in the source thread; `atom_exists` must confirm each id in
    /// the atom store. Partially created children are rolled back on any
    /// creation failure.
    pub async fn split_thread(
        &self,
        source_id: &str,
        new_threads: &[SplitChild],
        delete_source_if_empty: bool,
        atom_exists: impl Fn(&str) -> bool,
    ) -> Result<SplitResult> {
        let source = self
            .get(source_id)
            .ok_or_else(|| MemoryError::ThreadNotFound {
                id: source_id.to_string(),
            })?;

        let mut errors = Vec::new();
        if new_threads.is_empty() {
            errors.push("No new threads specified".to_string());
        }
        for (i, child) in new_threads.iter().enumerate() {
            if child.name.is_empty() {
                errors.push(format!("New thread {i} missing name"));
            }
            if child.description.is_empty() {
                errors.push(format!("New thread {i} missing description"));
            }
            if child.atom_ids.is_empty() {
                errors.push(format!("New thread {i} missing atom ids"));
            }
        }

        let source_set: std::collections::HashSet<&str> =
            source.memory_ids.iter().map(String::as_str).collect();
        let mut to_move = Vec::new();
        for child in new_threads {
            for atom_id in &child.atom_ids {
                if !source_set.contains(atom_id.as_str()) {
                    errors.push(format!(
                        "Atom '{atom_id}' not in source thread '{}'",
                        source.name
                    ));
                } else if !atom_exists(atom_id) {
                    errors.push(format!("Atom '{atom_id}' does not exist in memory store"));
                }
                if !to_move.contains(atom_id) {
                    to_move.push(atom_id.clone());
                }
            }
        }
        if !errors.is_empty() {
            return Err(MemoryError::SplitValidation { errors });
        }

        let mut result = SplitResult::default();
        let mut created: Vec<String> = Vec::new();
        for child in new_threads {
            match self
                .create(
                    &child.name,
                    &child.description,
                    child.atom_ids.clone(),
                    Some(child.scope.clone()),
                    Some(source_id.to_string()),
                    ThreadType::Topical,
                )
                .await
            {
                Ok(thread) => {
                    result.atoms_reassigned += child.atom_ids.len();
                    created.push(thread.id);
                }
                Err(e) => {
                    for tid in &created {
                        let _ = self.delete(tid).await;
                    }
                    return Err(e);
                }
            }
        }
        result.new_thread_ids = created.clone();

        {
            let mut threads = self.threads.lock().unwrap();
            if let Some(src) = threads.iter_mut().find(|t| t.id == source_id) {
                src.split_into.get_or_insert_with(Vec::new).extend(created);
                src.memory_ids.retain(|m| !to_move.contains(m));
                src.last_updated = now_iso();
            }
        }
        self.persist()?;

        if delete_source_if_empty {
            if let Some(src) = self.get(source_id) {
                if src.memory_ids.is_empty() {
                    self.delete(source_id).await?;
                    result.source_deleted = true;
                    info!(thread = %source_id, "deleted emptied source thread after split");
                }
            }
        }

        Ok(result)
    }

    /// Merge source threads into one new thread, deduplicating atom ids in
    /// first-seen order and deleting the sources. Conversation threads are
    /// refused.
    pub async fn merge_threads(
        &self,
        source_ids: &[String],
        merged_name: &str,
        merged_scope: &str,
    ) -> Result<Thread> {
        if source_ids.len() < 2 {
            return Err(MemoryError::Invalid(
                "merge requires at least two source threads".to_string(),
            ));
        }
        let mut sources = Vec::new();
        for sid in source_ids {
            let thread = self.get(sid).ok_or_else(|| MemoryError::ThreadNotFound {
                id: sid.to_string(),
            })?;
            if thread.thread_type == ThreadType::Conversation {
                return Err(MemoryError::Invalid(format!(
                    "cannot merge conversation thread '{}'",
                    thread.name
                )));
            }
            sources.push(thread);
        }

        let mut merged_ids = Vec::new();
        for src in &sources {
            for mid in &src.memory_ids {
                if !merged_ids.contains(mid) {
                    merged_ids.push(mid.clone());
                }
            }
        }

        let merged = self
            .create(
                merged_name,
                merged_scope,
                merged_ids,
                Some(merged_scope.to_string()),
                None,
                ThreadType::Topical,
            )
            .await?;
        for src in &sources {
            self.delete(&src.id).await?;
        }
        info!(
            merged = %merged.id,
            sources = sources.len(),
            "merged threads"
        );
        Ok(merged)
    }

    pub fn stats(&self) -> serde_json::Value {
        let threads = self.threads.lock().unwrap();
        let sizes: Vec<usize> = threads.iter().map(|t| t.memory_ids.len()).collect();
        let topical = threads
            .iter()
            .filter(|t| t.thread_type == ThreadType::Topical)
            .count();
        serde_json::json!({
            "total_threads": threads.len(),
            "topical_threads": topical,
            "conversation_threads": threads.len() - topical,
            "max_memories_in_thread": sizes.iter().max().copied().unwrap_or(0),
        })
    }
}
