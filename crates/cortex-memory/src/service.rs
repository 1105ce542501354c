//! Memory service container.
//!
//! One value owning every memory-side store, passed explicitly to the
//! components that need it. No global singletons: tests build their own
//! service over a temp dir, and `wipe_memory` clears all of it
//! deterministically.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::atoms::AtomStore;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::index::EmbeddingIndex;
use crate::retrieval::RetrievalEngine;
use crate::threads::ThreadStore;

pub struct MemoryService {
    pub index: Arc<EmbeddingIndex>,
    pub atoms: Arc<AtomStore>,
    pub threads: Arc<ThreadStore>,
    pub retrieval: Arc<RetrievalEngine>,
    memory_dir: PathBuf,
}

impl MemoryService {
    /// Open all stores under `memory_dir`.
    pub async fn open(
        memory_dir: PathBuf,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        min_semantic_score: f32,
    ) -> Result<Self> {
        let index = Arc::new(
            EmbeddingIndex::open(&memory_dir.join("embeddings"), embedder, batch_size).await?,
        );
        let atoms = Arc::new(AtomStore::open(
            memory_dir.join("atomic_memories.json"),
            index.clone(),
        ));
        let threads = Arc::new(ThreadStore::open(
            memory_dir.join("threads.json"),
            index.clone(),
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            atoms.clone(),
            threads.clone(),
            min_semantic_score,
        ));
        Ok(Self {
            index,
            atoms,
            threads,
            retrieval,
            memory_dir,
        })
    }

    /// Wipe all memory state: atoms, threads, embeddings (cache included)
    /// and pipeline buffers under the memory dir. The service must be
    /// reopened afterwards.
    pub fn wipe_memory(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        self.index.clear()?;

        for name in [
            "atomic_memories.json",
            "threads.json",
            "exchange_buffer.json",
            "throttle_state.json",
        ] {
            let path = self.memory_dir.join(name);
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        info!(files = removed.len(), "wiped memory state");
        Ok(removed)
    }
}
