//! Hybrid memory retrieval.
//!
//! Phase 1 fills the token budget with whole threads, scored by the best of
//! direct thread similarity and best child-atom similarity. Phase 2 spends
//! the remainder on individually high-scoring atoms from threads that did
//! not make the cut, capped at a quarter of the budget. Scoring is purely
//! semantic — recency is the separate recent-memory block's job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cortex_core::time::{count_tokens, humanize_timestamp};

use crate::atoms::{Atom, AtomStore};
use crate::error::Result;
use crate::threads::{Thread, ThreadStore, ThreadType};

/// Bonus atoms may take at most this fraction of the total budget.
const ORPHAN_BUDGET_CAP: f64 = 0.25;
/// Token overhead charged per thread header.
const THREAD_HEADER_TOKENS: usize = 10;
/// Token overhead charged per memory line.
const MEMORY_LINE_TOKENS: usize = 5;

/// One rewritten search query with a relative importance weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryItem {
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    0.5
}

/// Structured output of the query rewriter: 1–5 weighted queries.
///
/// Rewriting splits multiple topics, expands pronoun references from
/// context, and preserves distinctive verbatim phrases — those are the best
/// vector-search terms and must not be paraphrased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrittenQuery {
    pub queries: Vec<QueryItem>,
}

impl RewrittenQuery {
    /// Fallback when the rewriter is unavailable: the raw message as one
    /// full-weight query.
    pub fn passthrough(message: &str) -> Self {
        Self {
            queries: vec![QueryItem {
                text: message.to_string(),
                weight: 1.0,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedThread {
    pub id: String,
    pub name: String,
    pub description: String,
    pub memory_ids: Vec<String>,
    pub last_updated: String,
    pub memories: Vec<MemoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BonusAtom {
    pub id: String,
    pub content: String,
    pub created_at: String,
    pub semantic_score: f32,
    pub source_thread: Option<String>,
}

/// Retrieved context ready for prompt injection.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MemoryContext {
    pub threads: Vec<SelectedThread>,
    pub atomic_memories: Vec<BonusAtom>,
    pub total_tokens: usize,
    pub token_breakdown: HashMap<String, usize>,
}

const PREAMBLE: &str = "Past context from my long-term memory. These are facts and events\n\
from *previous* conversations — not this one. I recorded them from\n\
my first-person perspective; 'I' is me in a previous conversation.\n\
The user is always referred to by name. Timestamps indicate when recorded.\n\
Don't assume past states are still current; things may have changed.\n\
Use these to inform understanding, but don't surface them\n\
unprompted — let the conversation lead.";

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty() && self.atomic_memories.is_empty()
    }

    /// Render the context block with the fixed first-person preamble.
    pub fn format_for_prompt(&self) -> String {
        let mut sections = vec![PREAMBLE.to_string(), String::new()];

        for thread in &self.threads {
            sections.push(format!("## Thread: {}", thread.name));
            if !thread.description.is_empty() {
                sections.push(format!("*{}*", thread.description));
            }
            for mem in &thread.memories {
                let ts = humanize_timestamp(&mem.created_at);
                sections.push(format!("- [{ts}] {}", mem.content));
            }
            sections.push(String::new());
        }

        if !self.atomic_memories.is_empty() {
            sections.push("## Additional Relevant Facts".to_string());
            sections.push("*Individually relevant facts from other contexts:*".to_string());
            for mem in &self.atomic_memories {
                let ts = humanize_timestamp(&mem.created_at);
                match &mem.source_thread {
                    Some(source) => {
                        sections.push(format!("- [{ts}] {} *(from: {source})*", mem.content))
                    }
                    None => sections.push(format!("- [{ts}] {}", mem.content)),
                }
            }
            sections.push(String::new());
        }

        sections.join("\n")
    }
}

/// Parameters of one retrieval call.
#[derive(Debug, Default, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub token_budget: usize,
    /// Atoms sourced from this chat session are deduplicated against the
    /// visible conversation.
    pub exclude_session_id: Option<String>,
    /// Compaction cutoff: atoms from the excluded session created *before*
    /// this time are kept (their source messages were summarized away).
    pub session_uncompacted_after: Option<String>,
    /// Thread ids already present in the recent-memory block.
    pub exclude_thread_ids: HashSet<String>,
}

fn should_exclude_atom(
    atom: &Atom,
    exclude_session_id: Option<&str>,
    session_uncompacted_after: Option<&str>,
) -> bool {
    let Some(session) = exclude_session_id else {
        return false;
    };
    if atom.source_session_id.as_deref() != Some(session) {
        return false;
    }
    match session_uncompacted_after {
        // No compaction: every source message is still visible.
        None => true,
        Some(cutoff) => atom.created_at.as_str() >= cutoff,
    }
}

pub struct RetrievalEngine {
    atoms: Arc<AtomStore>,
    threads: Arc<ThreadStore>,
    min_score: f32,
}

impl RetrievalEngine {
    pub fn new(atoms: Arc<AtomStore>, threads: Arc<ThreadStore>, min_score: f32) -> Self {
        Self {
            atoms,
            threads,
            min_score,
        }
    }

    /// Run hybrid retrieval for one query under a token budget.
    pub async fn get_memory_context(&self, req: &RetrievalRequest) -> Result<MemoryContext> {
        let mut context = MemoryContext::default();
        let mut used_tokens = 0usize;

        let thread_hits = self.threads.search(&req.query, 10).await?;
        // Over-fetch atoms so phase 2 has candidates.
        let atom_hits = self.atoms.search(&req.query, 100).await?;

        let all_threads = self.threads.list_all();
        let mut atom_to_thread: HashMap<&str, &Thread> = HashMap::new();
        for t in &all_threads {
            for mid in &t.memory_ids {
                atom_to_thread.insert(mid.as_str(), t);
            }
        }

        // Candidate threads: direct hits plus implied ownership via atoms.
        struct Candidate {
            thread: Thread,
            direct: f32,
            best_atom: f32,
        }
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for (thread, score) in thread_hits {
            candidates
                .entry(thread.id.clone())
                .and_modify(|c| c.direct = c.direct.max(score))
                .or_insert(Candidate {
                    thread,
                    direct: score,
                    best_atom: 0.0,
                });
        }
        for (atom, score) in &atom_hits {
            if let Some(parent) = atom_to_thread.get(atom.id.as_str()) {
                candidates
                    .entry(parent.id.clone())
                    .and_modify(|c| c.best_atom = c.best_atom.max(*score))
                    .or_insert(Candidate {
                        thread: (*parent).clone(),
                        direct: 0.0,
                        best_atom: *score,
                    });
            }
        }

        let mut scored: Vec<(Thread, f32)> = candidates
            .into_values()
            .map(|c| {
                let score = c.direct.max(c.best_atom);
                (c.thread, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // Phase 1: whole threads, all-or-nothing, oldest atom first.
        let mut selected_memory_ids: HashSet<String> = HashSet::new();
        let mut selected_thread_ids: HashSet<String> = HashSet::new();
        let mut excluded_atoms = 0usize;

        for (thread, score) in &scored {
            if *score < self.min_score {
                debug!(thread = %thread.name, score, "below score floor, skipping");
                continue;
            }
            if req.exclude_thread_ids.contains(&thread.id) {
                continue;
            }

            let mut memories = Vec::new();
            let mut thread_tokens = THREAD_HEADER_TOKENS;
            for mid in &thread.memory_ids {
                let Some(atom) = self.atoms.get(mid) else {
                    continue;
                };
                if should_exclude_atom(
                    &atom,
                    req.exclude_session_id.as_deref(),
                    req.session_uncompacted_after.as_deref(),
                ) {
                    excluded_atoms += 1;
                    continue;
                }
                thread_tokens += count_tokens(&atom.content) + MEMORY_LINE_TOKENS;
                memories.push(MemoryEntry {
                    id: atom.id,
                    content: atom.content,
                    created_at: atom.created_at,
                });
            }
            memories.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            if !memories.is_empty() && used_tokens + thread_tokens <= req.token_budget {
                used_tokens += thread_tokens;
                selected_memory_ids.extend(memories.iter().map(|m| m.id.clone()));
                selected_thread_ids.insert(thread.id.clone());
                context.threads.push(SelectedThread {
                    id: thread.id.clone(),
                    name: thread.name.clone(),
                    description: thread.description.clone(),
                    memory_ids: thread.memory_ids.clone(),
                    last_updated: thread.last_updated.clone(),
                    memories,
                });
            }
        }

        // Phase 2: bonus atoms from non-selected threads under the orphan cap.
        let max_orphan_tokens = (req.token_budget as f64 * ORPHAN_BUDGET_CAP) as usize;
        let mut bonus_tokens = 0usize;

        for (atom, score) in &atom_hits {
            // atom_hits are score-descending; nothing below the floor follows.
            if *score < self.min_score {
                break;
            }
            if selected_memory_ids.contains(&atom.id) {
                continue;
            }
            if should_exclude_atom(
                atom,
                req.exclude_session_id.as_deref(),
                req.session_uncompacted_after.as_deref(),
            ) {
                excluded_atoms += 1;
                continue;
            }
            let parent = atom_to_thread.get(atom.id.as_str());
            if let Some(parent) = parent {
                if selected_thread_ids.contains(&parent.id) {
                    continue;
                }
            }

            let mem_tokens = count_tokens(&atom.content) + MEMORY_LINE_TOKENS;
            if bonus_tokens + mem_tokens > max_orphan_tokens {
                break;
            }
            if used_tokens + mem_tokens > req.token_budget {
                break;
            }
            used_tokens += mem_tokens;
            bonus_tokens += mem_tokens;
            selected_memory_ids.insert(atom.id.clone());
            context.atomic_memories.push(BonusAtom {
                id: atom.id.clone(),
                content: atom.content.clone(),
                created_at: atom.created_at.clone(),
                semantic_score: *score,
                source_thread: parent.map(|t| t.name.clone()),
            });
        }

        context.total_tokens = used_tokens;
        context
            .token_breakdown
            .insert("threads".to_string(), used_tokens - bonus_tokens);
        context
            .token_breakdown
            .insert("bonus_atoms".to_string(), bonus_tokens);

        info!(
            threads = context.threads.len(),
            bonus_atoms = context.atomic_memories.len(),
            used_tokens,
            budget = req.token_budget,
            excluded_atoms,
            "retrieved memory context"
        );
        Ok(context)
    }

    /// Conversation threads active in the look-back window, for the
    /// recent-memory block. Returns the formatted thread blocks, the set of
    /// included thread ids (fed back as `exclude_thread_ids`), and the
    /// tokens used.
    pub fn recent_conversation_threads(
        &self,
        hours: i64,
        token_budget: usize,
        exclude_room_id: Option<&str>,
        exclude_session_id: Option<&str>,
        session_uncompacted_after: Option<&str>,
    ) -> (Vec<SelectedThread>, HashSet<String>, usize) {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        let exclude_scope = exclude_room_id.map(|r| format!("room:{r}"));

        let mut candidates: Vec<Thread> = self
            .threads
            .list_all()
            .into_iter()
            .filter(|t| t.thread_type == ThreadType::Conversation)
            .filter(|t| exclude_scope.as_deref() != Some(t.scope.as_str()))
            .filter(|t| !t.last_updated.is_empty() && t.last_updated >= cutoff)
            .collect();
        candidates.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));

        let mut result = Vec::new();
        let mut included_ids = HashSet::new();
        let mut used_tokens = 0usize;

        for t in candidates {
            let mut memories = Vec::new();
            for mid in &t.memory_ids {
                let Some(atom) = self.atoms.get(mid) else {
                    continue;
                };
                if should_exclude_atom(&atom, exclude_session_id, session_uncompacted_after) {
                    continue;
                }
                memories.push(MemoryEntry {
                    id: atom.id,
                    content: atom.content,
                    created_at: atom.created_at,
                });
            }
            if memories.is_empty() {
                continue;
            }
            memories.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            let mem_tokens: Vec<usize> = memories
                .iter()
                .map(|m| count_tokens(&m.content) + MEMORY_LINE_TOKENS)
                .collect();
            let full_tokens = THREAD_HEADER_TOKENS + mem_tokens.iter().sum::<usize>();

            let remaining = token_budget.saturating_sub(used_tokens);
            if remaining < THREAD_HEADER_TOKENS + 20 {
                break;
            }

            if full_tokens <= remaining {
                used_tokens += full_tokens;
                included_ids.insert(t.id.clone());
                result.push(SelectedThread {
                    id: t.id,
                    name: t.name,
                    description: t.description,
                    memory_ids: t.memory_ids,
                    last_updated: t.last_updated,
                    memories,
                });
            } else {
                // Keep the most recent atoms that fit, marking the omission.
                let available = remaining.saturating_sub(THREAD_HEADER_TOKENS + 10);
                let mut kept = Vec::new();
                let mut kept_tokens = 0usize;
                for (m, mt) in memories.iter().zip(&mem_tokens).rev() {
                    if kept_tokens + mt > available {
                        break;
                    }
                    kept.push(m.clone());
                    kept_tokens += mt;
                }
                kept.reverse();
                if kept.is_empty() {
                    continue;
                }
                let omitted = memories.len() - kept.len();
                if omitted > 0 {
                    let marker = MemoryEntry {
                        id: "_omitted".to_string(),
                        content: format!("[... {omitted} earlier entries omitted ...]"),
                        created_at: String::new(),
                    };
                    kept_tokens += count_tokens(&marker.content) + MEMORY_LINE_TOKENS;
                    kept.insert(0, marker);
                }
                used_tokens += THREAD_HEADER_TOKENS + kept_tokens;
                included_ids.insert(t.id.clone());
                result.push(SelectedThread {
                    id: t.id,
                    name: t.name,
                    description: t.description,
                    memory_ids: t.memory_ids,
                    last_updated: t.last_updated,
                    memories: kept,
                });
            }
        }

        info!(
            threads = result.len(),
            used_tokens, token_budget, "assembled recent-memory block"
        );
        (result, included_ids, used_tokens)
    }
}

/// Render the recent-memory block.
pub fn format_recent_memory(threads: &[SelectedThread], hours: i64) -> String {
    let mut sections = vec![
        format!(
            "My recent conversations (last {hours}h). These provide continuity\n\
across conversations. I recorded them from my first-person perspective;\n\
'I' is me in a previous conversation. The user is always referred to by name.\n\
Reference naturally when relevant."
        ),
        String::new(),
    ];
    for thread in threads {
        sections.push(format!("## Recent: {}", thread.name));
        if !thread.description.is_empty() {
            sections.push(format!("*{}*", thread.description));
        }
        for mem in &thread.memories {
            let ts = humanize_timestamp(&mem.created_at);
            if ts.is_empty() {
                sections.push(format!("- {}", mem.content));
            } else {
                sections.push(format!("- [{ts}] {}", mem.content));
            }
        }
        sections.push(String::new());
    }
    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::NewAtom;
    use crate::embedder::testing::HashEmbedder;
    use crate::index::EmbeddingIndex;
    use crate::threads::ThreadType;

    struct Fixture {
        atoms: Arc<AtomStore>,
        threads: Arc<ThreadStore>,
        engine: RetrievalEngine,
    }

    async fn fixture(dir: &std::path::Path) -> Fixture {
        let index = Arc::new(
            EmbeddingIndex::open(&dir.join("embeddings"), Arc::new(HashEmbedder), 32)
                .await
                .unwrap(),
        );
        let atoms = Arc::new(AtomStore::open(
            dir.join("atomic_memories.json"),
            index.clone(),
        ));
        let threads = Arc::new(ThreadStore::open(dir.join("threads.json"), index));
        let engine = RetrievalEngine::new(atoms.clone(), threads.clone(), 0.65);
        Fixture {
            atoms,
            threads,
            engine,
        }
    }

    async fn seed_atom(f: &Fixture, content: &str, session: Option<&str>, created_at: &str) -> Atom {
        f.atoms
            .create(NewAtom {
                content: content.to_string(),
                source_session_id: session.map(String::from),
                created_at: Some(created_at.to_string()),
                ..NewAtom::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn whole_thread_selected_when_it_fits() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let a1 = seed_atom(&f, "sim:travel booked flights", None, "2026-01-01T00:00:00Z").await;
        let a2 = seed_atom(&f, "sim:travel packed bags", None, "2026-01-02T00:00:00Z").await;
        let t = f
            .threads
            .create(
                "Trip planning sim:travel",
                "sim:travel travel plans",
                vec![a1.id.clone(), a2.id.clone()],
                None,
                None,
                ThreadType::Topical,
            )
            .await
            .unwrap();

        let ctx = f
            .engine
            .get_memory_context(&RetrievalRequest {
                query: "sim:travel the trip".to_string(),
                token_budget: 20_000,
                ..RetrievalRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(ctx.threads.len(), 1);
        assert_eq!(ctx.threads[0].id, t.id);
        // Chronological order within the thread.
        assert_eq!(ctx.threads[0].memories[0].id, a1.id);
        assert!(ctx.atomic_memories.is_empty());
    }

    #[tokio::test]
    async fn budget_too_small_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let a = seed_atom(&f, "sim:big a substantial memory entry", None, "2026-01-01T00:00:00Z").await;
        f.threads
            .create(
                "Big sim:big",
                "sim:big stuff",
                vec![a.id],
                None,
                None,
                ThreadType::Topical,
            )
            .await
            .unwrap();

        let ctx = f
            .engine
            .get_memory_context(&RetrievalRequest {
                query: "sim:big query".to_string(),
                token_budget: 4,
                ..RetrievalRequest::default()
            })
            .await
            .unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn session_dedup_respects_compaction_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let a1 = seed_atom(
            &f,
            "sim:dedup fact from this chat",
            Some("chatX"),
            "2026-05-01T00:00:00Z",
        )
        .await;
        f.threads
            .create(
                "Dedup sim:dedup",
                "sim:dedup facts",
                vec![a1.id.clone()],
                None,
                None,
                ThreadType::Topical,
            )
            .await
            .unwrap();

        // No compaction: the atom duplicates visible messages — filtered.
        let ctx = f
            .engine
            .get_memory_context(&RetrievalRequest {
                query: "sim:dedup anything".to_string(),
                token_budget: 20_000,
                exclude_session_id: Some("chatX".to_string()),
                session_uncompacted_after: None,
                ..RetrievalRequest::default()
            })
            .await
            .unwrap();
        assert!(ctx.is_empty(), "atom from current session must be filtered");

        // Compacted after T0 > created_at: source messages are gone — kept.
        let ctx = f
            .engine
            .get_memory_context(&RetrievalRequest {
                query: "sim:dedup anything".to_string(),
                token_budget: 20_000,
                exclude_session_id: Some("chatX".to_string()),
                session_uncompacted_after: Some("2026-06-01T00:00:00Z".to_string()),
                ..RetrievalRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(ctx.threads.len(), 1);
        assert_eq!(ctx.threads[0].memories[0].id, a1.id);
    }

    #[tokio::test]
    async fn no_duplicate_atom_ids_across_threads_and_bonus() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let a = seed_atom(&f, "sim:shared a shared fact", None, "2026-01-01T00:00:00Z").await;
        f.threads
            .create(
                "First sim:shared",
                "sim:shared one",
                vec![a.id.clone()],
                None,
                None,
                ThreadType::Topical,
            )
            .await
            .unwrap();

        let ctx = f
            .engine
            .get_memory_context(&RetrievalRequest {
                query: "sim:shared find it".to_string(),
                token_budget: 20_000,
                ..RetrievalRequest::default()
            })
            .await
            .unwrap();

        let mut seen = HashSet::new();
        for t in &ctx.threads {
            for m in &t.memories {
                assert!(seen.insert(m.id.clone()), "duplicate atom {}", m.id);
            }
        }
        for m in &ctx.atomic_memories {
            assert!(seen.insert(m.id.clone()), "duplicate bonus atom {}", m.id);
        }
    }

    #[tokio::test]
    async fn excluded_threads_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let a = seed_atom(&f, "sim:skip some fact", None, "2026-01-01T00:00:00Z").await;
        let t = f
            .threads
            .create(
                "Skippable sim:skip",
                "sim:skip things",
                vec![a.id],
                None,
                None,
                ThreadType::Topical,
            )
            .await
            .unwrap();

        let mut exclude = HashSet::new();
        exclude.insert(t.id.clone());
        let ctx = f
            .engine
            .get_memory_context(&RetrievalRequest {
                query: "sim:skip query".to_string(),
                token_budget: 20_000,
                exclude_thread_ids: exclude,
                ..RetrievalRequest::default()
            })
            .await
            .unwrap();
        assert!(ctx.threads.is_empty());
    }

    #[tokio::test]
    async fn recent_block_truncates_with_omission_marker() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;

        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..10 {
            let ts = (now - Duration::minutes(100 - i)).to_rfc3339();
            let atom = seed_atom(
                &f,
                &format!("conversation note number {i} with some padding text"),
                None,
                &ts,
            )
            .await;
            ids.push(atom.id);
        }
        f.threads
            .create(
                "Chat log",
                "a recent chat",
                ids,
                Some("room:r1".to_string()),
                None,
                ThreadType::Conversation,
            )
            .await
            .unwrap();
        // Pin last_updated into the window.
        let t = f.threads.get_conversation_thread_for_room("r1").unwrap();
        f.threads.touch(&t.id, &now.to_rfc3339()).unwrap();

        let (threads, ids, _used) =
            f.engine
                .recent_conversation_threads(24, 80, None, None, None);
        assert_eq!(threads.len(), 1);
        assert!(ids.contains(&t.id));
        assert!(threads[0].memories[0].content.contains("earlier entries omitted"));
        // The newest note survives truncation.
        assert!(threads[0]
            .memories
            .last()
            .unwrap()
            .content
            .contains("number 9"));
    }

    #[tokio::test]
    async fn recent_block_excludes_current_room() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let now = Utc::now().to_rfc3339();
        let a = seed_atom(&f, "note", None, &now).await;
        f.threads
            .create(
                "Current chat",
                "this one",
                vec![a.id],
                Some("room:here".to_string()),
                None,
                ThreadType::Conversation,
            )
            .await
            .unwrap();
        let t = f.threads.get_conversation_thread_for_room("here").unwrap();
        f.threads.touch(&t.id, &now).unwrap();

        let (threads, _, _) =
            f.engine
                .recent_conversation_threads(24, 4000, Some("here"), None, None);
        assert!(threads.is_empty());
    }
}
