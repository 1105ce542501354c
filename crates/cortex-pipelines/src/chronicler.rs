//! The Chronicler: conversation-thread summarization.
//!
//! Conversation threads are born with generic descriptions; the Chronicler
//! replaces them with natural 2-3 sentence summaries so thread embeddings
//! are useful for semantic search. It never runs on its own schedule —
//! the Librarian chains it with the thread ids it touched. A scan mode
//! covers threads updated since the last run.

use std::path::PathBuf;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use cortex_core::files::{load_json, save_json};
use cortex_core::time::now_iso;
use cortex_memory::threads::ThreadType;
use cortex_memory::{AtomStore, MemoryIdsAction, Thread, ThreadStore};

use crate::error::Result;
use crate::llm::PipelineLlm;

const MAX_THREADS_PER_BATCH: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThreadSummary {
    pub thread_id: String,
    /// 2-3 sentence natural summary of the conversation.
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChroniclerOutput {
    pub summaries: Vec<ThreadSummary>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChroniclerState {
    #[serde(default)]
    last_chronicler_run: Option<String>,
}

/// Outcome of one Chronicler run.
#[derive(Debug)]
pub enum ChroniclerRun {
    NoWork,
    Completed { threads_summarized: usize, errors: Vec<String> },
    Failed { error: String },
}

pub struct Chronicler {
    atoms: Arc<AtomStore>,
    threads: Arc<ThreadStore>,
    llm: Arc<dyn PipelineLlm>,
    model: String,
    system_prompt: String,
    timeout_secs: u64,
    state_file: PathBuf,
}

impl Chronicler {
    pub fn new(
        atoms: Arc<AtomStore>,
        threads: Arc<ThreadStore>,
        llm: Arc<dyn PipelineLlm>,
        model: String,
        system_prompt: String,
        timeout_secs: u64,
        state_file: PathBuf,
    ) -> Self {
        Self {
            atoms,
            threads,
            llm,
            model,
            system_prompt,
            timeout_secs,
            state_file,
        }
    }

    fn last_run(&self) -> Option<String> {
        let state: ChroniclerState = load_json(&self.state_file, ChroniclerState::default());
        state.last_chronicler_run
    }

    fn set_last_run(&self, timestamp: &str) {
        let state = ChroniclerState {
            last_chronicler_run: Some(timestamp.to_string()),
        };
        if let Err(e) = save_json(&self.state_file, &state) {
            warn!("failed to persist chronicler state: {e}");
        }
    }

    /// Run targeted at specific thread ids (the Librarian chain), or in
    /// scan mode over everything updated since the last run.
    pub async fn run(&self, thread_ids: Option<&[String]>) -> ChroniclerRun {
        // Captured at the start so threads updated mid-run are picked up by
        // the next scan instead of being lost.
        let run_timestamp = now_iso();

        let candidates: Vec<Thread> = match thread_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.threads.get(id))
                .filter(|t| t.thread_type == ThreadType::Conversation && !t.memory_ids.is_empty())
                .collect(),
            None => {
                let last_run = self.last_run();
                self.threads
                    .list_all()
                    .into_iter()
                    .filter(|t| t.thread_type == ThreadType::Conversation)
                    .filter(|t| !t.memory_ids.is_empty())
                    .filter(|t| match &last_run {
                        None => true,
                        Some(last) => t.last_updated.as_str() > last.as_str(),
                    })
                    .collect()
            }
        };

        if candidates.is_empty() {
            self.set_last_run(&run_timestamp);
            return ChroniclerRun::NoWork;
        }

        info!(count = candidates.len(), "Chronicler summarizing threads");

        let mut summarized = 0usize;
        let mut errors = Vec::new();

        for batch in candidates.chunks(MAX_THREADS_PER_BATCH) {
            let prompt = self.build_prompt(batch);
            let schema = serde_json::to_value(schemars::schema_for!(ChroniclerOutput))
                .expect("schema serializes");
            let output = match self
                .llm
                .structured(&self.model, &self.system_prompt, &prompt, schema, self.timeout_secs)
                .await
                .and_then(|v| {
                    serde_json::from_value::<ChroniclerOutput>(v)
                        .map_err(|e| crate::error::PipelineError::BadOutput(e.to_string()))
                }) {
                Ok(output) => output,
                Err(e) => {
                    warn!("Chronicler batch failed: {e}");
                    errors.push(e.to_string());
                    continue;
                }
            };

            for summary in output.summaries {
                match self.apply_summary(&summary).await {
                    Ok(true) => summarized += 1,
                    Ok(false) => errors.push(format!("unknown thread: {}", summary.thread_id)),
                    Err(e) => errors.push(e.to_string()),
                }
            }
        }

        self.set_last_run(&run_timestamp);
        if summarized == 0 && !errors.is_empty() {
            return ChroniclerRun::Failed {
                error: errors.join("; "),
            };
        }
        ChroniclerRun::Completed {
            threads_summarized: summarized,
            errors,
        }
    }

    async fn apply_summary(&self, summary: &ThreadSummary) -> Result<bool> {
        let updated = self
            .threads
            .update(
                &summary.thread_id,
                None,
                Some(summary.summary.clone()),
                None,
                MemoryIdsAction::Append,
            )
            .await?;
        let Some(thread) = updated else {
            return Ok(false);
        };

        // Repair: a conversation thread's last_updated tracks its newest
        // member atom, not the summarization time.
        let max_created = thread
            .memory_ids
            .iter()
            .filter_map(|mid| self.atoms.get(mid))
            .map(|a| a.created_at)
            .max();
        if let Some(max_created) = max_created {
            self.threads.set_last_updated(&thread.id, &max_created)?;
        }
        Ok(true)
    }

    fn build_prompt(&self, threads: &[Thread]) -> String {
        let mut parts = vec![format!(
            "Summarize each of the following {} conversation threads.\n\
             For each thread, write a 2-3 sentence summary based on the facts\n\
             extracted from that conversation.\n",
            threads.len()
        )];
        for t in threads {
            let atoms: Vec<String> = t
                .memory_ids
                .iter()
                .filter_map(|mid| self.atoms.get(mid))
                .map(|a| a.content)
                .collect();
            parts.push(format!("## Thread: {}", t.id));
            parts.push(format!("Name: {}", t.name));
            parts.push(format!("Atom count: {}", atoms.len()));
            parts.push("Atoms:".to_string());
            for (i, content) in atoms.iter().enumerate() {
                parts.push(format!("  {}. {content}", i + 1));
            }
            parts.push(String::new());
        }
        parts.push("---\n\nFor each thread, return its thread_id and your summary.".to_string());
        parts.join("\n")
    }

    /// Stats for maintenance reporting.
    pub fn state(&self) -> serde_json::Value {
        json!({"last_chronicler_run": self.last_run()})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use cortex_memory::atoms::NewAtom;
    use cortex_memory::embedder::testing::HashEmbedder;
    use cortex_memory::EmbeddingIndex;

    struct Fixture {
        atoms: Arc<AtomStore>,
        threads: Arc<ThreadStore>,
        _dir: tempfile::TempDir,
        state_file: PathBuf,
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
        let state_file = dir.path().join("chronicler_state.json");
        Fixture {
            atoms,
            threads,
            _dir: dir,
            state_file,
        }
    }

    fn chronicler(f: &Fixture, responses: Vec<serde_json::Value>) -> Chronicler {
        Chronicler::new(
            f.atoms.clone(),
            f.threads.clone(),
            Arc::new(ScriptedLlm::new(responses)),
            "haiku".into(),
            "You summarize conversations.".into(),
            120,
            f.state_file.clone(),
        )
    }

    #[tokio::test]
    async fn targeted_run_updates_description_and_repairs_timestamp() {
        let f = fixture().await;
        let a1 = f
            .atoms
            .create(NewAtom {
                content: "Planted tomatoes".into(),
                created_at: Some("2026-07-01T10:00:00+00:00".into()),
                ..NewAtom::default()
            })
            .await
            .unwrap();
        let a2 = f
            .atoms
            .create(NewAtom {
                content: "Watered them the next day".into(),
                created_at: Some("2026-07-02T10:00:00+00:00".into()),
                ..NewAtom::default()
            })
            .await
            .unwrap();
        let thread = f
            .threads
            .create(
                "Chat about the garden",
                "Conversation record",
                vec![a1.id, a2.id],
                Some("room:garden-chat".into()),
                None,
                ThreadType::Conversation,
            )
            .await
            .unwrap();

        let c = chronicler(
            &f,
            vec![serde_json::json!({
                "summaries": [{
                    "thread_id": thread.id,
                    "summary": "We planted tomatoes and kept them watered."
                }]
            })],
        );

        match c.run(Some(&[thread.id.clone()])).await {
            ChroniclerRun::Completed {
                threads_summarized, ..
            } => assert_eq!(threads_summarized, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let updated = f.threads.get(&thread.id).unwrap();
        assert_eq!(updated.description, "We planted tomatoes and kept them watered.");
        // last_updated repaired to the newest member atom.
        assert_eq!(updated.last_updated, "2026-07-02T10:00:00+00:00");
        // State advanced.
        assert!(c.state()["last_chronicler_run"].is_string());
    }

    #[tokio::test]
    async fn scan_mode_skips_threads_not_updated_since_last_run() {
        let f = fixture().await;
        let c = chronicler(&f, vec![]);

        // First run with no candidates records the timestamp.
        assert!(matches!(c.run(None).await, ChroniclerRun::NoWork));

        // A thread last updated before the recorded run is not a candidate.
        let a = f
            .atoms
            .create(NewAtom {
                content: "Old note".into(),
                created_at: Some("2020-01-01T00:00:00+00:00".into()),
                ..NewAtom::default()
            })
            .await
            .unwrap();
        let t = f
            .threads
            .create(
                "Old chat",
                "Conversation record",
                vec![a.id],
                Some("room:old".into()),
                None,
                ThreadType::Conversation,
            )
            .await
            .unwrap();
        f.threads
            .set_last_updated(&t.id, "2020-01-01T00:00:00+00:00")
            .unwrap();

        assert!(matches!(c.run(None).await, ChroniclerRun::NoWork));
    }

    #[tokio::test]
    async fn targeted_run_ignores_topical_threads() {
        let f = fixture().await;
        let t = f
            .threads
            .create(
                "Topical",
                "not a conversation",
                vec!["a1".into()],
                None,
                None,
                ThreadType::Topical,
            )
            .await
            .unwrap();
        let c = chronicler(&f, vec![]);
        assert!(matches!(c.run(Some(&[t.id])).await, ChroniclerRun::NoWork));
    }
}
