//! The Librarian: exchange ingestion into atoms and threads.
//!
//! A cycle drains the throttled buffer, asks the extraction model for
//! atoms (each naming the threads it belongs to), deduplicates against
//! existing memories, and applies the result. Every created atom is also
//! attached to its chat's conversation thread; the affected conversation
//! threads chain into the Chronicler and the created atom ids into the
//! Gardener.

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cortex_memory::atoms::NewAtom;
use cortex_memory::threads::ThreadType;
use cortex_memory::{AtomStore, ThreadStore};

use crate::buffer::{Exchange, ExchangeBuffer};
use crate::error::Result;
use crate::llm::PipelineLlm;

/// Cosine threshold above which a proposed atom is a duplicate.
const DEDUP_THRESHOLD: f32 = 0.88;
/// Existing atoms shown to the model for dedup context.
const DEDUP_CONTEXT_ATOMS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProposedAtom {
    /// Clear, standalone fact.
    pub content: String,
    /// Legacy importance score; accepted and ignored.
    #[serde(default)]
    pub importance: Option<i64>,
    /// Threads this atom belongs to (usually 2-4).
    pub thread_names: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Brief context about the source.
    #[serde(default)]
    pub source_context: Option<String>,
    /// Chat session the fact came from; defaults to the batch's session
    /// when it is unambiguous.
    #[serde(default)]
    pub source_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProposedThread {
    pub name: String,
    pub description: String,
}

/// Structured output contract of the extraction call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LibrarianOutput {
    pub atomic_memories: Vec<ProposedAtom>,
    pub new_threads: Vec<ProposedThread>,
    #[serde(default)]
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ApplyStats {
    pub memories_created: usize,
    pub memories_skipped_duplicate: usize,
    pub threads_created: usize,
    pub thread_assignments: usize,
    pub errors: Vec<String>,
}

/// Outcome of one Librarian cycle.
#[derive(Debug)]
pub enum LibrarianRun {
    EmptyBuffer,
    Throttled {
        minutes_remaining: f64,
        buffer_size: usize,
    },
    Completed {
        exchanges_processed: usize,
        stats: ApplyStats,
        affected_conversation_threads: Vec<String>,
        created_atom_ids: Vec<String>,
    },
    Failed {
        error: String,
    },
}

pub struct Librarian {
    buffer: Arc<ExchangeBuffer>,
    atoms: Arc<AtomStore>,
    threads: Arc<ThreadStore>,
    llm: Arc<dyn PipelineLlm>,
    model: String,
    system_prompt: String,
    timeout_secs: u64,
}

impl Librarian {
    pub fn new(
        buffer: Arc<ExchangeBuffer>,
        atoms: Arc<AtomStore>,
        threads: Arc<ThreadStore>,
        llm: Arc<dyn PipelineLlm>,
        model: String,
        system_prompt: String,
        timeout_secs: u64,
    ) -> Self {
        Self {
            buffer,
            atoms,
            threads,
            llm,
            model,
            system_prompt,
            timeout_secs,
        }
    }

    /// Run one full cycle: throttle check, atomic consume, extraction,
    /// application.
    pub async fn run_cycle(&self) -> LibrarianRun {
        let buffered = self.buffer.peek();
        if buffered.is_empty() {
            return LibrarianRun::EmptyBuffer;
        }

        let remaining = self.buffer.throttle_remaining();
        if remaining > 0.0 {
            return LibrarianRun::Throttled {
                minutes_remaining: remaining / 60.0,
                buffer_size: buffered.len(),
            };
        }

        let exchanges = match self.buffer.consume() {
            Ok(exchanges) => exchanges,
            Err(e) => {
                return LibrarianRun::Failed {
                    error: format!("buffer consume failed: {e}"),
                }
            }
        };
        if exchanges.is_empty() {
            // Raced empty between check and consume; throttle untouched.
            return LibrarianRun::EmptyBuffer;
        }

        info!(count = exchanges.len(), "running Librarian extraction");

        let prompt = self.build_prompt(&exchanges);
        let schema = serde_json::to_value(schemars::schema_for!(LibrarianOutput))
            .expect("schema serializes");
        let output = match self
            .llm
            .structured(&self.model, &self.system_prompt, &prompt, schema, self.timeout_secs)
            .await
            .and_then(|v| {
                serde_json::from_value::<LibrarianOutput>(v)
                    .map_err(|e| crate::error::PipelineError::BadOutput(e.to_string()))
            }) {
            Ok(output) => output,
            Err(e) => {
                warn!("Librarian extraction failed: {e}");
                return LibrarianRun::Failed {
                    error: e.to_string(),
                };
            }
        };

        if let Some(reason) = &output.skipped_reason {
            debug!(reason, "Librarian skipped extraction");
        }

        match self.apply(&output, &exchanges).await {
            Ok((stats, affected, created)) => LibrarianRun::Completed {
                exchanges_processed: exchanges.len(),
                stats,
                affected_conversation_threads: affected,
                created_atom_ids: created,
            },
            Err(e) => LibrarianRun::Failed {
                error: e.to_string(),
            },
        }
    }

    fn build_prompt(&self, exchanges: &[Exchange]) -> String {
        let mut sections = vec![format!(
            "## Exchanges to Process ({} total)\n",
            exchanges.len()
        )];
        for (i, ex) in exchanges.iter().enumerate() {
            sections.push(format!(
                "### Exchange {} [{}]\n**Session**: {}\n\n**User**: {}\n\n**Assistant**: {}\n",
                i + 1,
                ex.timestamp,
                ex.session_id,
                clip(&ex.user_message, 2000),
                clip(&ex.assistant_message, 2000),
            ));
        }

        sections.push("## Existing Memories (for deduplication - don't extract duplicates)\n".into());
        let atoms = self.atoms.list_all();
        let recent = atoms.iter().rev().take(DEDUP_CONTEXT_ATOMS);
        let mut lines = Vec::new();
        for atom in recent {
            lines.push(format!("- {}", clip(&atom.content, 200)));
        }
        sections.push(if lines.is_empty() {
            "No existing memories.".to_string()
        } else {
            lines.join("\n")
        });

        // Every thread goes in: the atom list above is bounded for dedup
        // context, but organization context needs the full thread picture.
        sections.push("\n## Existing Threads (for organization)\n".into());
        let threads = self.threads.list_all();
        let mut lines = Vec::new();
        for t in &threads {
            lines.push(format!(
                "- **{}** ({} memories): {}",
                t.name,
                t.memory_ids.len(),
                clip(&t.description, 100)
            ));
        }
        sections.push(if lines.is_empty() {
            "No existing threads.".to_string()
        } else {
            lines.join("\n")
        });

        sections.push("\n---\n\nAnalyze these exchanges and extract any important memories.".into());
        sections.join("\n")
    }

    /// Apply an extraction result. Separated from the LLM call so the
    /// application rules are testable with a scripted output.
    pub async fn apply(
        &self,
        output: &LibrarianOutput,
        exchanges: &[Exchange],
    ) -> Result<(ApplyStats, Vec<String>, Vec<String>)> {
        let mut stats = ApplyStats::default();
        let mut created_ids = Vec::new();
        // conversation-thread id → max created_at over atoms added this run
        let mut touched_conversations: BTreeMap<String, String> = BTreeMap::new();

        let batch_timestamp = exchanges
            .iter()
            .map(|e| e.timestamp.clone())
            .min()
            .unwrap_or_else(cortex_core::time::now_iso);
        let sole_session = match exchanges.first() {
            Some(first) if exchanges.iter().all(|e| e.session_id == first.session_id) => {
                Some(first.session_id.clone())
            }
            _ => None,
        };

        // New threads first so assignments can land in them.
        for proposed in &output.new_threads {
            let name = proposed.name.trim();
            if name.is_empty() {
                continue;
            }
            if self.threads.get_by_name(name).is_none() {
                match self
                    .threads
                    .create(name, &proposed.description, Vec::new(), None, None, ThreadType::Topical)
                    .await
                {
                    Ok(_) => stats.threads_created += 1,
                    Err(e) => stats.errors.push(format!("thread '{name}': {e}")),
                }
            }
        }

        for proposed in &output.atomic_memories {
            let content = proposed.content.trim();
            if content.is_empty() {
                continue;
            }

            match self.atoms.find_similar(content, DEDUP_THRESHOLD).await {
                Ok(Some(existing)) => {
                    debug!(existing = %existing.id, "skipping duplicate atom");
                    stats.memories_skipped_duplicate += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => stats.errors.push(format!("dedup probe: {e}")),
            }

            let session = proposed
                .source_session_id
                .clone()
                .or_else(|| sole_session.clone());

            let atom = match self
                .atoms
                .create(NewAtom {
                    content: content.to_string(),
                    source_session_id: session.clone(),
                    tags: proposed.tags.clone(),
                    created_at: Some(batch_timestamp.clone()),
                    ..NewAtom::default()
                })
                .await
            {
                Ok(atom) => atom,
                Err(e) => {
                    stats.errors.push(format!("create atom: {e}"));
                    continue;
                }
            };
            stats.memories_created += 1;
            created_ids.push(atom.id.clone());

            for thread_name in &proposed.thread_names {
                let thread_name = thread_name.trim();
                if thread_name.is_empty() {
                    continue;
                }
                let thread = match self.threads.get_by_name(thread_name) {
                    Some(t) => t,
                    None => {
                        // Referenced but never declared: auto-create.
                        match self
                            .threads
                            .create(
                                thread_name,
                                &format!("Auto-created for: {}", clip(content, 50)),
                                Vec::new(),
                                None,
                                None,
                                ThreadType::Topical,
                            )
                            .await
                        {
                            Ok(t) => {
                                stats.threads_created += 1;
                                t
                            }
                            Err(e) => {
                                stats.errors.push(format!("thread '{thread_name}': {e}"));
                                continue;
                            }
                        }
                    }
                };
                match self.threads.add_memory_to_thread(&thread.id, &atom.id) {
                    Ok(true) => stats.thread_assignments += 1,
                    Ok(false) => stats.errors.push(format!("thread vanished: {thread_name}")),
                    Err(e) => stats.errors.push(format!("assign: {e}")),
                }
            }

            // Conversation-thread attribution.
            if let Some(session) = session {
                match self.conversation_thread_for(&session).await {
                    Ok(thread_id) => {
                        if let Err(e) = self.threads.add_memory_to_thread(&thread_id, &atom.id) {
                            stats.errors.push(format!("conversation assign: {e}"));
                        }
                        let entry = touched_conversations
                            .entry(thread_id)
                            .or_insert_with(|| atom.created_at.clone());
                        if atom.created_at > *entry {
                            *entry = atom.created_at.clone();
                        }
                    }
                    Err(e) => stats.errors.push(format!("conversation thread: {e}")),
                }
            }
        }

        // Conversation threads track the newest member atom.
        for (thread_id, max_created) in &touched_conversations {
            if let Err(e) = self.threads.touch(thread_id, max_created) {
                stats.errors.push(format!("touch conversation: {e}"));
            }
        }

        info!(
            created = stats.memories_created,
            duplicates = stats.memories_skipped_duplicate,
            threads_created = stats.threads_created,
            assignments = stats.thread_assignments,
            "applied Librarian results"
        );
        let affected = touched_conversations.into_keys().collect();
        Ok((stats, affected, created_ids))
    }

    async fn conversation_thread_for(&self, session_id: &str) -> Result<String> {
        if let Some(existing) = self.threads.get_conversation_thread_for_room(session_id) {
            return Ok(existing.id);
        }
        let short: String = session_id.chars().take(8).collect();
        let thread = self
            .threads
            .create(
                &format!("Chat {short}"),
                "Conversation record",
                Vec::new(),
                Some(format!("room:{session_id}")),
                None,
                ThreadType::Conversation,
            )
            .await?;
        Ok(thread.id)
    }
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use cortex_memory::embedder::testing::HashEmbedder;
    use cortex_memory::EmbeddingIndex;
    use serde_json::json;

    struct Fixture {
        buffer: Arc<ExchangeBuffer>,
        atoms: Arc<AtomStore>,
        threads: Arc<ThreadStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(
            EmbeddingIndex::open(&dir.path().join("embeddings"), Arc::new(HashEmbedder), 32)
                .await
                .unwrap(),
        );
        let atoms = Arc::new(AtomStore::open(
            dir.path().join("atomic_memories.json"),
            index.clone(),
        ));
        let threads = Arc::new(ThreadStore::open(dir.path().join("threads.json"), index));
        let buffer = Arc::new(ExchangeBuffer::new(dir.path(), 100, 1200.0));
        Fixture {
            buffer,
            atoms,
            threads,
            _dir: dir,
        }
    }

    fn librarian(f: &Fixture, responses: Vec<serde_json::Value>) -> Librarian {
        Librarian::new(
            f.buffer.clone(),
            f.atoms.clone(),
            f.threads.clone(),
            Arc::new(ScriptedLlm::new(responses)),
            "sonnet".into(),
            "You extract memories.".into(),
            120,
        )
    }

    fn exchange(session: &str, ts: &str) -> Exchange {
        Exchange {
            user_message: "I got the job at the observatory".into(),
            assistant_message: "Congratulations!".into(),
            timestamp: ts.into(),
            session_id: session.into(),
            buffered_at: 0.0,
        }
    }

    fn extraction() -> serde_json::Value {
        json!({
            "atomic_memories": [{
                "content": "Got the job at the observatory",
                "importance": 80,
                "thread_names": ["Career"],
                "tags": ["work"]
            }],
            "new_threads": [{"name": "Career", "description": "Work and jobs"}]
        })
    }

    #[tokio::test]
    async fn empty_buffer_short_circuits() {
        let f = fixture().await;
        let lib = librarian(&f, vec![]);
        assert!(matches!(lib.run_cycle().await, LibrarianRun::EmptyBuffer));
        // Throttle untouched.
        assert_eq!(f.buffer.throttle_state().total_librarian_runs, 0);
    }

    #[tokio::test]
    async fn throttle_honors_time() {
        let f = fixture().await;
        let lib = librarian(&f, vec![extraction()]);

        f.buffer.add(exchange("chat-1", "2026-08-01T10:00:00+00:00")).unwrap();
        // Simulate a recent run: consume an entry to stamp the throttle,
        // then re-add the exchange.
        f.buffer.consume().unwrap();
        f.buffer.add(exchange("chat-1", "2026-08-01T10:00:00+00:00")).unwrap();

        match lib.run_cycle().await {
            LibrarianRun::Throttled {
                minutes_remaining,
                buffer_size,
            } => {
                assert!(minutes_remaining > 0.0);
                assert_eq!(buffer_size, 1);
            }
            other => panic!("expected throttled, got {other:?}"),
        }
        // Buffer unchanged by a throttled cycle.
        assert_eq!(f.buffer.peek().len(), 1);

        // Rewind past the window: the cycle completes and drains.
        f.buffer.rewind_last_run(1201.0).unwrap();
        match lib.run_cycle().await {
            LibrarianRun::Completed {
                exchanges_processed,
                stats,
                ..
            } => {
                assert_eq!(exchanges_processed, 1);
                assert_eq!(stats.memories_created, 1);
            }
            other => panic!("expected completed, got {other:?}"),
        }
        assert!(f.buffer.peek().is_empty());
    }

    #[tokio::test]
    async fn apply_creates_atoms_threads_and_conversation_attribution() {
        let f = fixture().await;
        let lib = librarian(&f, vec![]);
        let exchanges = vec![
            exchange("chat-9", "2026-08-01T10:00:00+00:00"),
            exchange("chat-9", "2026-08-01T10:05:00+00:00"),
        ];

        let output: LibrarianOutput = serde_json::from_value(extraction()).unwrap();
        let (stats, affected, created) = lib.apply(&output, &exchanges).await.unwrap();

        assert_eq!(stats.memories_created, 1);
        assert_eq!(stats.threads_created, 1);
        assert_eq!(created.len(), 1);

        // Atom stamped with the earliest exchange timestamp and the batch
        // session.
        let atom = f.atoms.get(&created[0]).unwrap();
        assert_eq!(atom.created_at, "2026-08-01T10:00:00+00:00");
        assert_eq!(atom.source_session_id.as_deref(), Some("chat-9"));

        // Topical assignment plus conversation-thread membership.
        let career = f.threads.get_by_name("Career").unwrap();
        assert!(career.memory_ids.contains(&created[0]));
        let conv = f.threads.get_conversation_thread_for_room("chat-9").unwrap();
        assert!(conv.memory_ids.contains(&created[0]));
        assert_eq!(affected, vec![conv.id.clone()]);
    }

    #[tokio::test]
    async fn duplicate_atoms_are_skipped() {
        let f = fixture().await;
        let lib = librarian(&f, vec![]);
        let exchanges = vec![exchange("chat-1", "2026-08-01T10:00:00+00:00")];
        let output: LibrarianOutput = serde_json::from_value(extraction()).unwrap();

        let (first, _, _) = lib.apply(&output, &exchanges).await.unwrap();
        assert_eq!(first.memories_created, 1);

        let (second, _, created) = lib.apply(&output, &exchanges).await.unwrap();
        assert_eq!(second.memories_created, 0);
        assert_eq!(second.memories_skipped_duplicate, 1);
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn referenced_thread_is_auto_created() {
        let f = fixture().await;
        let lib = librarian(&f, vec![]);
        let exchanges = vec![exchange("chat-1", "2026-08-01T10:00:00+00:00")];
        let output = LibrarianOutput {
            atomic_memories: vec![ProposedAtom {
                content: "A stray fact".into(),
                importance: None,
                thread_names: vec!["Undeclared Topic".into()],
                tags: vec![],
                source_context: None,
                source_session_id: None,
            }],
            new_threads: vec![],
            skipped_reason: None,
        };

        let (stats, _, _) = lib.apply(&output, &exchanges).await.unwrap();
        assert_eq!(stats.threads_created, 1);
        assert!(f.threads.get_by_name("Undeclared Topic").is_some());
    }
}
