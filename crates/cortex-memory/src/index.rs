//! Flat inner-product vector index with content-addressed caching.
//!
//! The index is a packed array of unit vectors plus a parallel metadata
//! list. A flat index supports no in-place deletion, so deletes drop the
//! metadata entry and rebuild the packed array from the on-disk cache —
//! O(n) and accepted. Cache files are keyed by a hash of the full prefixed
//! input, so re-embedding identical text is a disk read, not an encoder
//! call.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use cortex_core::files::{FileLock, LOCK_TIMEOUT};
use cortex_core::time::now_iso;

use crate::content::{detect_content_type, ContentType};
use crate::embedder::{normalize, Embedder, EMBEDDING_DIM};
use crate::error::{MemoryError, Result};

/// Stored alongside each vector. `metadata` carries the back-reference
/// into the owning store (`memory_id` or `thread_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingMeta {
    pub id: String,
    /// First ≤1000 chars of the indexed text (debugging).
    pub text: String,
    /// Cache key computed at write time over the full prefixed input.
    /// Rebuilds look the cache up by this hash; re-deriving it from the
    /// truncated `text` would miss for any input over 1000 chars.
    #[serde(default)]
    pub text_hash: String,
    pub content_type: ContentType,
    pub created_at: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    version: u32,
    entries: Vec<EmbeddingMeta>,
}

struct IndexState {
    vectors: Vec<Vec<f32>>,
    metadata: Vec<EmbeddingMeta>,
}

pub struct EmbeddingIndex {
    index_file: PathBuf,
    metadata_file: PathBuf,
    cache_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    state: Mutex<IndexState>,
}

fn hash_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest)[..16].to_string()
}

fn pack_vectors(vectors: &[Vec<f32>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vectors.len() * EMBEDDING_DIM * 4);
    for v in vectors {
        for x in v {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }
    out
}

fn unpack_vectors(bytes: &[u8]) -> Vec<Vec<f32>> {
    bytes
        .chunks_exact(EMBEDDING_DIM * 4)
        .map(|chunk| {
            chunk
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect()
}

impl EmbeddingIndex {
    /// Open the index under `dir`, loading persisted state. On a
    /// vector/metadata count mismatch, rebuild from cache (re-encoding
    /// anything the cache lost).
    pub async fn open(
        dir: &Path,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Result<Self> {
        let cache_dir = dir.join("cache");
        fs::create_dir_all(&cache_dir)?;

        let index = Self {
            index_file: dir.join("index.bin"),
            metadata_file: dir.join("metadata.json"),
            cache_dir,
            embedder,
            batch_size: batch_size.max(1),
            state: Mutex::new(IndexState {
                vectors: Vec::new(),
                metadata: Vec::new(),
            }),
        };

        let meta: MetadataFile = cortex_core::files::load_json(
            &index.metadata_file,
            MetadataFile {
                version: 1,
                entries: Vec::new(),
            },
        );
        let vectors = if index.index_file.exists() {
            unpack_vectors(&fs::read(&index.index_file)?)
        } else {
            Vec::new()
        };

        if vectors.len() == meta.entries.len() {
            let mut state = index.state.lock().unwrap();
            state.vectors = vectors;
            state.metadata = meta.entries;
            info!(count = state.metadata.len(), "loaded embedding index");
        } else {
            warn!(
                vectors = vectors.len(),
                entries = meta.entries.len(),
                "index/metadata mismatch, rebuilding from cache"
            );
            {
                let mut state = index.state.lock().unwrap();
                state.metadata = meta.entries;
            }
            index.rebuild().await?;
        }

        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cache_file(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}.vec"))
    }

    fn read_cache(&self, hash: &str) -> Option<Vec<f32>> {
        let path = self.cache_file(hash);
        let bytes = fs::read(path).ok()?;
        let vecs = unpack_vectors(&bytes);
        vecs.into_iter().next()
    }

    fn write_cache(&self, hash: &str, vector: &[f32]) {
        let path = self.cache_file(hash);
        let bytes: Vec<u8> = vector.iter().flat_map(|x| x.to_le_bytes()).collect();
        if let Err(e) = fs::write(&path, bytes) {
            warn!(path = %path.display(), "failed to write embedding cache: {e}");
        }
    }

    /// Look up the cache for the prefixed input, encoding on a miss.
    /// Returned vectors are unit length.
    async fn vector_for(&self, prefixed: &str) -> Result<Vec<f32>> {
        let hash = hash_text(prefixed);
        if let Some(v) = self.read_cache(&hash) {
            return Ok(v);
        }
        let mut encoded = self
            .embedder
            .encode(std::slice::from_ref(&prefixed.to_string()))
            .await?;
        let mut v = encoded
            .pop()
            .ok_or_else(|| MemoryError::Encoder("empty encoder batch".into()))?;
        normalize(&mut v);
        self.write_cache(&hash, &v);
        Ok(v)
    }

    /// Embed `text` and append it to the index. Returns the embedding id.
    pub async fn embed(
        &self,
        text: &str,
        metadata: serde_json::Value,
        content_type: Option<ContentType>,
    ) -> Result<String> {
        let ids = self
            .embed_batch(vec![(text.to_string(), metadata, content_type)])
            .await?;
        Ok(ids.into_iter().next().expect("one id per input"))
    }

    /// Batch form of [`embed`]: cache lookups first, one encoder round per
    /// `batch_size` chunk for the misses, then a single persist.
    pub async fn embed_batch(
        &self,
        items: Vec<(String, serde_json::Value, Option<ContentType>)>,
    ) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; items.len()];
        let mut types = Vec::with_capacity(items.len());
        let mut hashes = Vec::with_capacity(items.len());
        let mut misses: Vec<(usize, String, String)> = Vec::new();

        for (i, (text, _meta, ctype)) in items.iter().enumerate() {
            let ctype = ctype.unwrap_or_else(|| detect_content_type(text));
            types.push(ctype);
            let prefixed = format!("{}{}", ctype.input_prefix(), text);
            let hash = hash_text(&prefixed);
            hashes.push(hash.clone());
            match self.read_cache(&hash) {
                Some(v) => vectors[i] = Some(v),
                None => misses.push((i, prefixed, hash)),
            }
        }

        for chunk in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|(_, p, _)| p.clone()).collect();
            let encoded = self.embedder.encode(&inputs).await?;
            if encoded.len() != inputs.len() {
                return Err(MemoryError::Encoder("encoder batch size mismatch".into()));
            }
            for ((i, _, hash), mut v) in chunk.iter().zip(encoded) {
                normalize(&mut v);
                self.write_cache(hash, &v);
                vectors[*i] = Some(v);
            }
        }

        let mut ids = Vec::with_capacity(items.len());
        {
            let mut state = self.state.lock().unwrap();
            for (i, (text, meta, _)) in items.iter().enumerate() {
                let id = cortex_core::ids::prefixed_id("emb");
                state.vectors.push(vectors[i].take().expect("filled above"));
                state.metadata.push(EmbeddingMeta {
                    id: id.clone(),
                    text: text.chars().take(1000).collect(),
                    text_hash: hashes[i].clone(),
                    content_type: types[i],
                    created_at: now_iso(),
                    metadata: meta.clone(),
                });
                ids.push(id);
            }
        }
        self.persist()?;
        Ok(ids)
    }

    /// Top-k cosine search. Over-fetches 3k candidates, filters by score
    /// threshold and optional content type. Ties break on insertion order.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
        content_type_filter: Option<ContentType>,
    ) -> Result<Vec<(EmbeddingMeta, f32)>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = self.query_vector(query).await?;

        let state = self.state.lock().unwrap();
        let search_k = (k * 3).min(state.vectors.len());

        let mut scored: Vec<(usize, f32)> = state
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, dot(&query_vec, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(search_k);

        let mut results = Vec::new();
        for (idx, score) in scored {
            if score < threshold {
                continue;
            }
            let meta = &state.metadata[idx];
            if let Some(filter) = content_type_filter {
                if meta.content_type != filter {
                    continue;
                }
            }
            results.push((meta.clone(), score));
            if results.len() >= k {
                break;
            }
        }
        Ok(results)
    }

    /// Encode a retrieval query (always `"query: "`-prefixed, cached).
    pub async fn query_vector(&self, query: &str) -> Result<Vec<f32>> {
        self.vector_for(&format!("query: {query}")).await
    }

    /// Delete one embedding. Rebuilds the packed array from cache; cache
    /// entries for surviving embeddings are untouched.
    pub async fn delete_by_id(&self, emb_id: &str) -> Result<bool> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let before = state.metadata.len();
            if let Some(pos) = state.metadata.iter().position(|m| m.id == emb_id) {
                state.metadata.remove(pos);
            }
            state.metadata.len() != before
        };
        if !removed {
            return Ok(false);
        }
        self.rebuild().await?;
        Ok(true)
    }

    /// Re-derive the packed vector array from metadata + cache, keyed by
    /// each entry's write-time hash. Surviving cache entries are read, not
    /// rewritten; a lost cache file is re-encoded and restored under its
    /// original key.
    async fn rebuild(&self) -> Result<()> {
        let snapshot: Vec<EmbeddingMeta> = self.state.lock().unwrap().metadata.clone();

        let mut vectors = Vec::with_capacity(snapshot.len());
        for meta in &snapshot {
            if meta.text_hash.is_empty() {
                // Pre-hash entry: the truncated text is all we have.
                let prefixed = format!("{}{}", meta.content_type.input_prefix(), meta.text);
                vectors.push(self.vector_for(&prefixed).await?);
                continue;
            }
            if let Some(v) = self.read_cache(&meta.text_hash) {
                vectors.push(v);
                continue;
            }
            let prefixed = format!("{}{}", meta.content_type.input_prefix(), meta.text);
            let mut encoded = self
                .embedder
                .encode(std::slice::from_ref(&prefixed))
                .await?;
            let mut v = encoded
                .pop()
                .ok_or_else(|| MemoryError::Encoder("empty encoder batch".into()))?;
            normalize(&mut v);
            self.write_cache(&meta.text_hash, &v);
            vectors.push(v);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.vectors = vectors;
        }
        self.persist()?;
        debug!(count = snapshot.len(), "rebuilt embedding index");
        Ok(())
    }

    /// Drop everything including the cache directory contents.
    pub fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.vectors.clear();
            state.metadata.clear();
        }
        self.persist()?;
        if self.cache_dir.exists() {
            for entry in fs::read_dir(&self.cache_dir)? {
                let entry = entry?;
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Totals and per-content-type counts.
    pub fn stats(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        let mut by_type = std::collections::BTreeMap::new();
        for m in &state.metadata {
            *by_type.entry(m.content_type.to_string()).or_insert(0u32) += 1;
        }
        serde_json::json!({
            "total_embeddings": state.metadata.len(),
            "by_content_type": by_type,
        })
    }

    fn persist(&self) -> Result<()> {
        let (bytes, meta) = {
            let state = self.state.lock().unwrap();
            (
                pack_vectors(&state.vectors),
                MetadataFile {
                    version: 1,
                    entries: state.metadata.clone(),
                },
            )
        };

        let _lock = FileLock::acquire(&self.index_file, LOCK_TIMEOUT)?;
        let parent = self
            .index_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let tmp = tempfile::Builder::new()
            .prefix(".index")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(MemoryError::Io)?;
        fs::write(tmp.path(), &bytes)?;
        tmp.persist(&self.index_file)
            .map_err(|e| MemoryError::Io(e.error))?;
        drop(_lock);

        cortex_core::files::save_json(&self.metadata_file, &meta)?;
        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::testing::HashEmbedder;

    async fn open_index(dir: &Path) -> EmbeddingIndex {
        EmbeddingIndex::open(dir, Arc::new(HashEmbedder), 32)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stored_vectors_are_unit_length() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        index
            .embed("the quick brown fox", serde_json::json!({}), None)
            .await
            .unwrap();
        let state = index.state.lock().unwrap();
        let norm: f32 = state.vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn retrieve_finds_identical_text() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        index
            .embed(
                "sim:apples apples are in season",
                serde_json::json!({"memory_id": "a1"}),
                Some(ContentType::Memory),
            )
            .await
            .unwrap();
        index
            .embed(
                "sim:rust the borrow checker",
                serde_json::json!({"memory_id": "a2"}),
                Some(ContentType::Memory),
            )
            .await
            .unwrap();

        // The hash embedder maps query "sim:apples ..." onto the same basis
        // vector, so the apple atom dominates.
        let hits = index
            .retrieve("sim:apples what about apples", 5, 0.5, None)
            .await
            .unwrap();
        assert_eq!(hits[0].0.metadata["memory_id"], "a1");
    }

    #[tokio::test]
    async fn content_type_filter_applies() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        index
            .embed("sim:x one", serde_json::json!({}), Some(ContentType::Memory))
            .await
            .unwrap();
        index
            .embed("sim:x two", serde_json::json!({}), Some(ContentType::Thread))
            .await
            .unwrap();

        let hits = index
            .retrieve("sim:x query", 10, 0.0, Some(ContentType::Thread))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content_type, ContentType::Thread);
    }

    #[tokio::test]
    async fn delete_then_reembed_hits_cache_with_same_vector() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        let id = index
            .embed("a fact to forget", serde_json::json!({}), Some(ContentType::Memory))
            .await
            .unwrap();
        let first = index.state.lock().unwrap().vectors[0].clone();

        assert!(index.delete_by_id(&id).await.unwrap());
        assert_eq!(index.len(), 0);

        index
            .embed("a fact to forget", serde_json::json!({}), Some(ContentType::Memory))
            .await
            .unwrap();
        let second = index.state.lock().unwrap().vectors[0].clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn delete_leaves_long_text_survivors_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;

        // Longer than the 1000-char metadata truncation: the cache key is
        // the write-time hash of the full input, not the truncated text.
        let long_text = format!("a long memory {}", "detail ".repeat(300));
        index
            .embed(&long_text, serde_json::json!({}), Some(ContentType::Memory))
            .await
            .unwrap();
        let victim = index
            .embed("short lived", serde_json::json!({}), Some(ContentType::Memory))
            .await
            .unwrap();

        let survivor_before = index.state.lock().unwrap().vectors[0].clone();
        let cache_files_before = fs::read_dir(dir.path().join("cache")).unwrap().count();

        assert!(index.delete_by_id(&victim).await.unwrap());

        // The rebuild read the survivor's cache entry; it did not re-encode
        // the truncated text or grow the cache.
        let survivor_after = index.state.lock().unwrap().vectors[0].clone();
        assert_eq!(survivor_before, survivor_after);
        let cache_files_after = fs::read_dir(dir.path().join("cache")).unwrap().count();
        assert_eq!(cache_files_before, cache_files_after);
    }

    #[tokio::test]
    async fn reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(dir.path()).await;
            index
                .embed("persist me", serde_json::json!({}), Some(ContentType::Memory))
                .await
                .unwrap();
        }
        let reopened = open_index(dir.path()).await;
        assert_eq!(reopened.len(), 1);
    }

    #[tokio::test]
    async fn clear_drops_cache() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        index
            .embed("ephemeral", serde_json::json!({}), None)
            .await
            .unwrap();
        index.clear().unwrap();
        assert_eq!(index.len(), 0);
        let cached = fs::read_dir(dir.path().join("cache")).unwrap().count();
        assert_eq!(cached, 0);
    }
}
