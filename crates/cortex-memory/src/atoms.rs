//! Atom store — standalone facts with version history.
//!
//! Atoms never reference their threads; the thread store owns membership.
//! The only cross-link kept here is `assignment_confidence`, written by the
//! Gardener when it places an atom, which doubles as the triage queue
//! (any `low` entry puts the atom up for re-evaluation).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cortex_core::files::{load_json, save_json};
use cortex_core::ids::prefixed_id;
use cortex_core::time::now_iso;

use crate::content::ContentType;
use crate::error::Result;
use crate::index::EmbeddingIndex;

/// A superseded content revision. Supersession is append-only; history is
/// never discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomVersion {
    pub content: String,
    pub timestamp: String,
    pub superseded_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub id: String,
    pub content: String,
    pub created_at: String,
    pub last_modified: String,
    #[serde(default)]
    pub source_exchange_id: Option<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
    #[serde(default)]
    pub embedding_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub previous_versions: Vec<AtomVersion>,
    /// thread-id → "high" | "medium" | "low"
    #[serde(default)]
    pub assignment_confidence: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AtomsFile {
    version: u32,
    memories: Vec<Atom>,
    #[serde(default)]
    last_modified: String,
}

impl Default for AtomsFile {
    fn default() -> Self {
        Self {
            version: 3,
            memories: Vec::new(),
            last_modified: String::new(),
        }
    }
}

/// Options for [`AtomStore::create`].
#[derive(Debug, Default, Clone)]
pub struct NewAtom {
    pub content: String,
    pub source_exchange_id: Option<String>,
    pub source_session_id: Option<String>,
    pub tags: Vec<String>,
    /// Explicit creation timestamp (Librarian batches stamp atoms with the
    /// earliest exchange time). Defaults to now.
    pub created_at: Option<String>,
}

pub struct AtomStore {
    file: PathBuf,
    index: Arc<EmbeddingIndex>,
    atoms: Mutex<Vec<Atom>>,
}

impl AtomStore {
    pub fn open(file: PathBuf, index: Arc<EmbeddingIndex>) -> Self {
        let data: AtomsFile = load_json(&file, AtomsFile::default());
        info!(count = data.memories.len(), "loaded atoms");
        Self {
            file,
            index,
            atoms: Mutex::new(data.memories),
        }
    }

    fn persist(&self) -> Result<()> {
        let memories = self.atoms.lock().unwrap().clone();
        save_json(
            &self.file,
            &AtomsFile {
                version: 3,
                memories,
                last_modified: now_iso(),
            },
        )?;
        Ok(())
    }

    /// Create an atom and index its content as type `memory`.
    pub async fn create(&self, new: NewAtom) -> Result<Atom> {
        let now = now_iso();
        let mut atom = Atom {
            id: prefixed_id("atom"),
            content: new.content,
            created_at: new.created_at.unwrap_or_else(|| now.clone()),
            last_modified: now,
            source_exchange_id: new.source_exchange_id,
            source_session_id: new.source_session_id,
            embedding_id: None,
            tags: new.tags,
            previous_versions: Vec::new(),
            assignment_confidence: BTreeMap::new(),
        };

        match self
            .index
            .embed(
                &atom.content,
                serde_json::json!({"memory_id": atom.id, "tags": atom.tags}),
                Some(ContentType::Memory),
            )
            .await
        {
            Ok(id) => atom.embedding_id = Some(id),
            Err(e) => warn!(atom = %atom.id, "failed to embed atom: {e}"),
        }

        self.atoms.lock().unwrap().push(atom.clone());
        self.persist()?;
        debug!(atom = %atom.id, "created atom");
        Ok(atom)
    }

    /// Update an atom. A content change pushes the old content onto
    /// `previous_versions` and swaps the embedding.
    pub async fn update(
        &self,
        id: &str,
        content: Option<String>,
        tags: Option<Vec<String>>,
        superseded_reason: Option<String>,
    ) -> Result<Option<Atom>> {
        let (old_embedding, content_changed, snapshot) = {
            let mut atoms = self.atoms.lock().unwrap();
            let Some(atom) = atoms.iter_mut().find(|a| a.id == id) else {
                return Ok(None);
            };

            let mut changed = false;
            if let Some(new_content) = content {
                if new_content != atom.content {
                    atom.previous_versions.push(AtomVersion {
                        content: std::mem::replace(&mut atom.content, new_content),
                        timestamp: atom.last_modified.clone(),
                        superseded_reason: superseded_reason
                            .unwrap_or_else(|| "Content updated".to_string()),
                    });
                    changed = true;
                }
            }
            if let Some(tags) = tags {
                atom.tags = tags;
            }
            atom.last_modified = now_iso();

            let old_embedding = if changed { atom.embedding_id.take() } else { None };
            (old_embedding, changed, atom.clone())
        };

        if content_changed {
            if let Some(old_id) = old_embedding {
                let _ = self.index.delete_by_id(&old_id).await;
            }
            let new_embedding = self
                .index
                .embed(
                    &snapshot.content,
                    serde_json::json!({"memory_id": snapshot.id, "tags": snapshot.tags}),
                    Some(ContentType::Memory),
                )
                .await;
            let mut atoms = self.atoms.lock().unwrap();
            if let Some(atom) = atoms.iter_mut().find(|a| a.id == id) {
                match new_embedding {
                    Ok(emb_id) => atom.embedding_id = Some(emb_id),
                    Err(e) => warn!(atom = %id, "failed to re-embed atom: {e}"),
                }
            }
        }

        self.persist()?;
        Ok(self.get(id))
    }

    /// Delete an atom and its embedding.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let embedding_id = {
            let mut atoms = self.atoms.lock().unwrap();
            let before = atoms.len();
            let embedding = atoms
                .iter()
                .find(|a| a.id == id)
                .and_then(|a| a.embedding_id.clone());
            atoms.retain(|a| a.id != id);
            if atoms.len() == before {
                return Ok(false);
            }
            embedding
        };
        if let Some(emb_id) = embedding_id {
            let _ = self.index.delete_by_id(&emb_id).await;
        }
        self.persist()?;
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<Atom> {
        self.atoms.lock().unwrap().iter().find(|a| a.id == id).cloned()
    }

    pub fn list_all(&self) -> Vec<Atom> {
        self.atoms.lock().unwrap().clone()
    }

    /// Record the Gardener's confidence for an atom's placement in a thread.
    pub fn set_assignment_confidence(
        &self,
        atom_id: &str,
        thread_id: &str,
        confidence: &str,
    ) -> Result<bool> {
        let updated = {
            let mut atoms = self.atoms.lock().unwrap();
            match atoms.iter_mut().find(|a| a.id == atom_id) {
                Some(atom) => {
                    atom.assignment_confidence
                        .insert(thread_id.to_string(), confidence.to_string());
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist()?;
        }
        Ok(updated)
    }

    /// Drop confidence entries for a thread that no longer references the
    /// atom (keeps the confidence keys a subset of referencing threads).
    pub fn clear_confidence_for_thread(&self, atom_id: &str, thread_id: &str) -> Result<()> {
        let changed = {
            let mut atoms = self.atoms.lock().unwrap();
            atoms
                .iter_mut()
                .find(|a| a.id == atom_id)
                .map(|a| a.assignment_confidence.remove(thread_id).is_some())
                .unwrap_or(false)
        };
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    /// Semantic search over atoms (content type `memory`).
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(Atom, f32)>> {
        let hits = self
            .index
            .retrieve(query, k * 2, 0.2, Some(ContentType::Memory))
            .await?;
        let mut results = Vec::new();
        for (meta, score) in hits {
            let Some(memory_id) = meta.metadata.get("memory_id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(atom) = self.get(memory_id) {
                results.push((atom, score));
            }
            if results.len() >= k {
                break;
            }
        }
        Ok(results)
    }

    /// Duplicate probe used by the Librarian before creating an atom.
    pub async fn find_similar(&self, content: &str, threshold: f32) -> Result<Option<Atom>> {
        let hits = self
            .index
            .retrieve(content, 5, threshold, Some(ContentType::Memory))
            .await?;
        for (meta, _) in hits {
            if let Some(memory_id) = meta.metadata.get("memory_id").and_then(|v| v.as_str()) {
                if let Some(atom) = self.get(memory_id) {
                    return Ok(Some(atom));
                }
            }
        }
        Ok(None)
    }

    /// Triage queue: atoms with at least one low-confidence assignment.
    pub fn get_low_confidence_atoms(&self) -> Vec<Atom> {
        self.atoms
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.assignment_confidence.values().any(|c| c == "low"))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> serde_json::Value {
        let atoms = self.atoms.lock().unwrap();
        let with_versions = atoms.iter().filter(|a| !a.previous_versions.is_empty()).count();
        serde_json::json!({
            "total_memories": atoms.len(),
            "with_versions": with_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::testing::HashEmbedder;

    async fn store(dir: &std::path::Path) -> AtomStore {
        let index = EmbeddingIndex::open(&dir.join("embeddings"), Arc::new(HashEmbedder), 32)
            .await
            .unwrap();
        AtomStore::open(dir.join("atomic_memories.json"), Arc::new(index))
    }

    fn new_atom(content: &str) -> NewAtom {
        NewAtom {
            content: content.to_string(),
            ..NewAtom::default()
        }
    }

    #[tokio::test]
    async fn create_embeds_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let atom = s.create(new_atom("sim:cat the cat likes sunbeams")).await.unwrap();
        assert!(atom.embedding_id.is_some());
        assert!(!atom.content.is_empty());

        let s2 = store(dir.path()).await;
        assert!(s2.get(&atom.id).is_some());
    }

    #[tokio::test]
    async fn update_content_appends_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let atom = s.create(new_atom("job hunt ongoing")).await.unwrap();

        let updated = s
            .update(
                &atom.id,
                Some("got the job".to_string()),
                None,
                Some("Status changed".to_string()),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.content, "got the job");
        assert_eq!(updated.previous_versions.len(), 1);
        assert_eq!(updated.previous_versions[0].content, "job hunt ongoing");
        assert_eq!(updated.previous_versions[0].superseded_reason, "Status changed");
        // A fresh embedding replaced the old one.
        assert!(updated.embedding_id.is_some());
        assert_ne!(updated.embedding_id, atom.embedding_id);
    }

    #[tokio::test]
    async fn update_same_content_skips_versioning() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let atom = s.create(new_atom("stable fact")).await.unwrap();
        let updated = s
            .update(&atom.id, Some("stable fact".to_string()), None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(updated.previous_versions.is_empty());
        assert_eq!(updated.embedding_id, atom.embedding_id);
    }

    #[tokio::test]
    async fn find_similar_hits_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let atom = s.create(new_atom("sim:dup a duplicated fact")).await.unwrap();
        let hit = s.find_similar("sim:dup a duplicated fact", 0.88).await.unwrap();
        assert_eq!(hit.map(|a| a.id), Some(atom.id));
    }

    #[tokio::test]
    async fn low_confidence_triage_queue() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let a = s.create(new_atom("fact one")).await.unwrap();
        let b = s.create(new_atom("fact two")).await.unwrap();
        s.set_assignment_confidence(&a.id, "t1", "low").unwrap();
        s.set_assignment_confidence(&b.id, "t1", "high").unwrap();

        let triage = s.get_low_confidence_atoms();
        assert_eq!(triage.len(), 1);
        assert_eq!(triage[0].id, a.id);
    }

    #[tokio::test]
    async fn delete_removes_atom() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let atom = s.create(new_atom("ephemeral")).await.unwrap();
        assert!(s.delete(&atom.id).await.unwrap());
        assert!(s.get(&atom.id).is_none());
        assert!(!s.delete(&atom.id).await.unwrap());
    }
}
