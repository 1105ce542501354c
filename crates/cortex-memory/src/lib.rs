//! `cortex-memory` — the long-term semantic memory core.
//!
//! The graph has two owned sides: atoms (standalone facts, versioned on
//! edit) and threads (named collections of atom ids). Atoms store no
//! back-references; retrieval builds the inverse map lazily from the
//! thread store. Vector search runs over a flat inner-product index of
//! unit vectors, so scores are cosine similarities.

pub mod atoms;
pub mod content;
pub mod embedder;
pub mod error;
pub mod index;
pub mod retrieval;
pub mod service;
pub mod threads;

pub use atoms::{Atom, AtomStore, NewAtom};
pub use content::ContentType;
pub use embedder::{Embedder, HttpEmbedder, EMBEDDING_DIM};
pub use error::{MemoryError, Result};
pub use index::EmbeddingIndex;
pub use retrieval::{
    MemoryContext, QueryItem, RetrievalEngine, RetrievalRequest, RewrittenQuery,
};
pub use service::MemoryService;
pub use threads::{
    MemoryIdsAction, SplitChild, Thread, ThreadStore, ThreadType, HARD_CAP, SOFT_CAP,
};
