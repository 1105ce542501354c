//! The Gardener: topical-graph maintenance.
//!
//! Candidate threads are pre-computed per atom by embedding similarity
//! (conversation threads excluded), the model returns structured
//! decisions, and application is purely programmatic: assignments respect
//! the size caps, supersessions version the atom, thread maintenance
//! refuses conversation threads.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use cortex_memory::threads::{SplitChild, ThreadType, HARD_CAP, SOFT_CAP};
use cortex_memory::{Atom, AtomStore, ThreadStore};

use crate::buffer::ExchangeBuffer;
use crate::error::Result;
use crate::llm::PipelineLlm;

const CANDIDATES_PER_ATOM: usize = 5;
const MAX_BATCH: usize = 20;
const THREAD_OVERVIEW_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Assign,
    CreateAndAssign,
    Supersede,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GardenerDecision {
    pub atom_id: String,
    pub action: DecisionAction,
    /// Existing thread name (for `assign`).
    #[serde(default)]
    pub thread_name: Option<String>,
    /// "high" | "medium" | "low".
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub new_thread_name: Option<String>,
    #[serde(default)]
    pub new_thread_scope: Option<String>,
    #[serde(default)]
    pub supersede_content: Option<String>,
    #[serde(default)]
    pub supersede_reason: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceAction {
    Split,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewThreadDef {
    pub name: String,
    pub scope: String,
    pub atom_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThreadMaintenance {
    pub action: MaintenanceAction,
    /// Thread name to split.
    #[serde(default)]
    pub source_thread: Option<String>,
    #[serde(default)]
    pub new_threads: Vec<NewThreadDef>,
    /// Thread names to merge.
    #[serde(default)]
    pub merge_threads: Vec<String>,
    #[serde(default)]
    pub merged_name: Option<String>,
    #[serde(default)]
    pub merged_scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GardenerOutput {
    pub decisions: Vec<GardenerDecision>,
    #[serde(default)]
    pub thread_maintenance: Vec<ThreadMaintenance>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GardenerStats {
    pub assigned: usize,
    pub threads_created: usize,
    pub superseded: usize,
    pub skipped: usize,
    pub splits: usize,
    pub merges: usize,
    pub blocked_by_size: usize,
    pub errors: Vec<String>,
}

/// Outcome of one Gardener run.
#[derive(Debug)]
pub enum GardenerRun {
    Empty,
    Completed {
        atoms_processed: usize,
        triage_processed: usize,
        stats: GardenerStats,
    },
    Failed {
        error: String,
    },
}

pub struct Gardener {
    atoms: Arc<AtomStore>,
    threads: Arc<ThreadStore>,
    buffer: Arc<ExchangeBuffer>,
    llm: Arc<dyn PipelineLlm>,
    model: String,
    system_prompt: String,
    timeout_secs: u64,
}

impl Gardener {
    pub fn new(
        atoms: Arc<AtomStore>,
        threads: Arc<ThreadStore>,
        buffer: Arc<ExchangeBuffer>,
        llm: Arc<dyn PipelineLlm>,
        model: String,
        system_prompt: String,
        timeout_secs: u64,
    ) -> Self {
        Self {
            atoms,
            threads,
            buffer,
            llm,
            model,
            system_prompt,
            timeout_secs,
        }
    }

    /// Run over `atom_ids` in batches, adding the triage queue on the last
    /// batch.
    pub async fn run_batched(&self, atom_ids: &[String]) -> GardenerRun {
        if atom_ids.is_empty() {
            return self.run(&[], true).await;
        }

        let batches: Vec<&[String]> = atom_ids.chunks(MAX_BATCH).collect();
        let total = batches.len();
        let mut combined = GardenerStats::default();
        let mut atoms_processed = 0usize;
        let mut triage_processed = 0usize;

        for (i, batch) in batches.into_iter().enumerate() {
            let is_last = i + 1 == total;
            info!(batch = i + 1, total, size = batch.len(), "Gardener batch");
            match self.run(batch, is_last).await {
                GardenerRun::Completed {
                    atoms_processed: a,
                    triage_processed: t,
                    stats,
                } => {
                    atoms_processed += a;
                    triage_processed += t;
                    merge_stats(&mut combined, stats);
                }
                GardenerRun::Empty => {}
                GardenerRun::Failed { error } => combined.errors.push(error),
            }
        }

        if let Err(e) = self.buffer.mark_gardener_run() {
            warn!("failed to mark gardener run: {e}");
        }
        GardenerRun::Completed {
            atoms_processed,
            triage_processed,
            stats: combined,
        }
    }

    /// One Gardener pass over a batch of atoms (plus, optionally, the
    /// triage queue).
    pub async fn run(&self, atom_ids: &[String], include_triage: bool) -> GardenerRun {
        let mut atoms_data = Vec::new();
        for aid in atom_ids {
            if let Some(atom) = self.atoms.get(aid) {
                let candidates = self.candidate_threads(&atom.content).await;
                atoms_data.push((atom, candidates));
            }
        }

        let mut triage_data = Vec::new();
        if include_triage {
            for atom in self.atoms.get_low_confidence_atoms() {
                if atom_ids.iter().any(|id| id == &atom.id) {
                    continue;
                }
                let candidates = self.candidate_threads(&atom.content).await;
                triage_data.push((atom, candidates));
            }
        }

        if atoms_data.is_empty() && triage_data.is_empty() {
            return GardenerRun::Empty;
        }

        let prompt = self.build_prompt(&atoms_data, &triage_data);
        let schema = serde_json::to_value(schemars::schema_for!(GardenerOutput))
            .expect("schema serializes");
        let output = match self
            .llm
            .structured(&self.model, &self.system_prompt, &prompt, schema, self.timeout_secs)
            .await
            .and_then(|v| {
                serde_json::from_value::<GardenerOutput>(v)
                    .map_err(|e| crate::error::PipelineError::BadOutput(e.to_string()))
            }) {
            Ok(output) => output,
            Err(e) => {
                warn!("Gardener failed: {e}");
                return GardenerRun::Failed {
                    error: e.to_string(),
                };
            }
        };

        info!(
            decisions = output.decisions.len(),
            maintenance = output.thread_maintenance.len(),
            "Gardener returned decisions"
        );

        match self.apply(&output).await {
            Ok(stats) => GardenerRun::Completed {
                atoms_processed: atoms_data.len(),
                triage_processed: triage_data.len(),
                stats,
            },
            Err(e) => GardenerRun::Failed {
                error: e.to_string(),
            },
        }
    }

    /// Top candidate topical threads for an atom, by embedding similarity.
    async fn candidate_threads(&self, content: &str) -> Vec<(String, f32, usize, String)> {
        let hits = match self.threads.search(content, CANDIDATES_PER_ATOM * 2).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("candidate search failed: {e}");
                return Vec::new();
            }
        };
        hits.into_iter()
            .filter(|(t, _)| t.thread_type != ThreadType::Conversation)
            .take(CANDIDATES_PER_ATOM)
            .map(|(t, score)| {
                let scope = if t.scope.is_empty() {
                    t.description.clone()
                } else {
                    t.scope.clone()
                };
                (t.name, score, t.memory_ids.len(), scope)
            })
            .collect()
    }

    fn build_prompt(
        &self,
        atoms: &[(Atom, Vec<(String, f32, usize, String)>)],
        triage: &[(Atom, Vec<(String, f32, usize, String)>)],
    ) -> String {
        let mut parts = vec![format!("## Thread Overview\n\n{}\n", self.thread_overview())];

        let (blocked, warning) = self.size_alerts();
        if !blocked.is_empty() || !warning.is_empty() {
            let mut alert = vec!["## Thread Size Alerts\n".to_string()];
            if !blocked.is_empty() {
                alert.push(format!(
                    "**BLOCKED ({HARD_CAP}+ atoms - cannot accept assignments):**"
                ));
                for (name, size) in &blocked {
                    alert.push(format!("  - {name}: {size} atoms (MUST SPLIT)"));
                }
                alert.push(String::new());
            }
            if !warning.is_empty() {
                alert.push(format!("**Warning ({SOFT_CAP}+ atoms - consider splitting):**"));
                for (name, size) in &warning {
                    alert.push(format!("  - {name}: {size} atoms"));
                }
                alert.push(String::new());
            }
            parts.push(alert.join("\n"));
        }

        if !atoms.is_empty() {
            parts.push(format!(
                "## New Atoms to Process ({} atoms)\n\n{}\n",
                atoms.len(),
                format_atoms(atoms)
            ));
        }
        if !triage.is_empty() {
            parts.push(format!(
                "## Triage Queue ({} atoms needing re-evaluation)\n\n{}\n",
                triage.len(),
                format_atoms(triage)
            ));
        }

        parts.push(
            "---\n\nFor each atom, decide: assign to an existing thread, create a new thread, \
             supersede with updated content, or skip. Use the candidate threads as starting \
             points but also consider the full thread list."
                .to_string(),
        );
        parts.join("\n")
    }

    fn thread_overview(&self) -> String {
        let mut topical: Vec<_> = self
            .threads
            .list_all()
            .into_iter()
            .filter(|t| t.thread_type != ThreadType::Conversation)
            .collect();
        if topical.is_empty() {
            return "No existing threads.".to_string();
        }
        topical.sort_by_key(|t| std::cmp::Reverse(t.memory_ids.len()));

        let total = topical.len();
        let mut lines = vec![format!("**{total} existing topical threads:**")];
        for t in topical.iter().take(THREAD_OVERVIEW_LIMIT) {
            let scope = if t.scope.is_empty() { &t.description } else { &t.scope };
            let scope: String = scope.chars().take(80).collect();
            lines.push(format!("- {} ({} atoms): {scope}", t.name, t.memory_ids.len()));
        }
        if total > THREAD_OVERVIEW_LIMIT {
            lines.push(format!("... and {} more threads", total - THREAD_OVERVIEW_LIMIT));
        }
        lines.join("\n")
    }

    fn size_alerts(&self) -> (Vec<(String, usize)>, Vec<(String, usize)>) {
        let mut blocked = Vec::new();
        let mut warning = Vec::new();
        for t in self.threads.list_all() {
            if t.thread_type == ThreadType::Conversation {
                continue;
            }
            let size = t.memory_ids.len();
            if size >= HARD_CAP {
                blocked.push((t.name, size));
            } else if size >= SOFT_CAP {
                warning.push((t.name, size));
            }
        }
        (blocked, warning)
    }

    /// Apply decisions programmatically. Testable with a hand-built output.
    pub async fn apply(&self, output: &GardenerOutput) -> Result<GardenerStats> {
        let mut stats = GardenerStats::default();

        for decision in &output.decisions {
            if let Err(e) = self.apply_decision(decision, &mut stats).await {
                stats.errors.push(format!("{}: {e}", decision.atom_id));
            }
        }
        for maintenance in &output.thread_maintenance {
            if let Err(e) = self.apply_maintenance(maintenance, &mut stats).await {
                stats.errors.push(format!("maintenance: {e}"));
            }
        }
        Ok(stats)
    }

    async fn apply_decision(
        &self,
        decision: &GardenerDecision,
        stats: &mut GardenerStats,
    ) -> Result<()> {
        let atom = self.atoms.get(&decision.atom_id);
        let confidence = decision.confidence.as_deref().unwrap_or("medium");

        match decision.action {
            DecisionAction::Assign => {
                let Some(atom) = atom else {
                    stats.errors.push(format!("atom not found: {}", decision.atom_id));
                    return Ok(());
                };
                let Some(thread_name) = decision.thread_name.as_deref() else {
                    stats.errors.push(format!("missing thread_name for {}", atom.id));
                    return Ok(());
                };
                let Some(thread) = self.threads.get_by_name(thread_name) else {
                    stats.errors.push(format!("thread not found: {thread_name}"));
                    return Ok(());
                };
                let (ok, reason) = self.threads.can_assign_to_thread(&thread.id);
                if !ok {
                    stats.errors.push(format!(
                        "BLOCKED: cannot assign {} to '{thread_name}': {reason}",
                        atom.id
                    ));
                    stats.blocked_by_size += 1;
                    return Ok(());
                }
                self.threads.add_memory_to_thread(&thread.id, &atom.id)?;
                self.atoms
                    .set_assignment_confidence(&atom.id, &thread.id, confidence)?;
                stats.assigned += 1;
            }

            DecisionAction::CreateAndAssign => {
                let Some(atom) = atom else {
                    stats.errors.push(format!("atom not found: {}", decision.atom_id));
                    return Ok(());
                };
                let Some(name) = decision.new_thread_name.as_deref() else {
                    stats
                        .errors
                        .push(format!("missing new_thread_name for {}", atom.id));
                    return Ok(());
                };
                let scope = decision.new_thread_scope.clone().unwrap_or_default();

                let thread = match self.threads.get_by_name(name) {
                    Some(existing) => {
                        let (ok, reason) = self.threads.can_assign_to_thread(&existing.id);
                        if !ok {
                            stats.errors.push(format!(
                                "BLOCKED: cannot assign {} to existing '{name}': {reason}",
                                atom.id
                            ));
                            stats.blocked_by_size += 1;
                            return Ok(());
                        }
                        existing
                    }
                    None => {
                        let created = self
                            .threads
                            .create(name, &scope, Vec::new(), Some(scope.clone()), None, ThreadType::Topical)
                            .await?;
                        stats.threads_created += 1;
                        created
                    }
                };
                self.threads.add_memory_to_thread(&thread.id, &atom.id)?;
                self.atoms
                    .set_assignment_confidence(&atom.id, &thread.id, confidence)?;
                stats.assigned += 1;
            }

            DecisionAction::Supersede => {
                let Some(atom) = atom else {
                    stats
                        .errors
                        .push(format!("atom not found for supersede: {}", decision.atom_id));
                    return Ok(());
                };
                let Some(new_content) = decision.supersede_content.as_deref() else {
                    stats
                        .errors
                        .push(format!("missing supersede_content for {}", atom.id));
                    return Ok(());
                };
                if new_content != atom.content {
                    self.atoms
                        .update(
                            &atom.id,
                            Some(new_content.to_string()),
                            None,
                            Some(
                                decision
                                    .supersede_reason
                                    .clone()
                                    .unwrap_or_else(|| "Updated by maintenance".to_string()),
                            ),
                        )
                        .await?;
                    stats.superseded += 1;
                }
            }

            DecisionAction::Skip => stats.skipped += 1,
        }
        Ok(())
    }

    async fn apply_maintenance(
        &self,
        maintenance: &ThreadMaintenance,
        stats: &mut GardenerStats,
    ) -> Result<()> {
        match maintenance.action {
            MaintenanceAction::Split => {
                let Some(source_name) = maintenance.source_thread.as_deref() else {
                    stats.errors.push("split missing source_thread".to_string());
                    return Ok(());
                };
                let Some(source) = self.threads.get_by_name(source_name) else {
                    stats.errors.push(format!("split source not found: {source_name}"));
                    return Ok(());
                };
                if source.thread_type == ThreadType::Conversation {
                    stats.errors.push(format!(
                        "BLOCKED: cannot split conversation thread '{source_name}'"
                    ));
                    return Ok(());
                }
                if maintenance.new_threads.is_empty() {
                    stats.errors.push("split with no new threads".to_string());
                    return Ok(());
                }
                let children: Vec<SplitChild> = maintenance
                    .new_threads
                    .iter()
                    .map(|nt| SplitChild {
                        name: nt.name.clone(),
                        description: nt.scope.clone(),
                        scope: nt.scope.clone(),
                        atom_ids: nt.atom_ids.clone(),
                    })
                    .collect();
                let atoms = self.atoms.clone();
                self.threads
                    .split_thread(&source.id, &children, true, |id| atoms.get(id).is_some())
                    .await?;
                stats.splits += 1;
            }

            MaintenanceAction::Merge => {
                if maintenance.merge_threads.len() < 2 {
                    stats.errors.push("merge requires at least two threads".to_string());
                    return Ok(());
                }
                let Some(merged_name) = maintenance.merged_name.as_deref() else {
                    stats.errors.push("merge missing merged_name".to_string());
                    return Ok(());
                };
                let mut source_ids = Vec::new();
                for name in &maintenance.merge_threads {
                    match self.threads.get_by_name(name) {
                        Some(t) if t.thread_type == ThreadType::Conversation => {
                            stats.errors.push(format!(
                                "BLOCKED: cannot merge conversation thread '{name}'"
                            ));
                            return Ok(());
                        }
                        Some(t) => source_ids.push(t.id),
                        None => {
                            stats.errors.push(format!("merge source not found: {name}"));
                            return Ok(());
                        }
                    }
                }
                self.threads
                    .merge_threads(
                        &source_ids,
                        merged_name,
                        maintenance.merged_scope.as_deref().unwrap_or(""),
                    )
                    .await?;
                stats.merges += 1;
            }
        }
        Ok(())
    }

    /// Health metrics for maintenance scheduling.
    pub fn thread_health(&self) -> serde_json::Value {
        let all = self.threads.list_all();
        let atoms = self.atoms.list_all();
        let topical: Vec<_> = all
            .iter()
            .filter(|t| t.thread_type != ThreadType::Conversation)
            .collect();
        let sizes: Vec<usize> = topical.iter().map(|t| t.memory_ids.len()).collect();

        let assigned: std::collections::HashSet<&str> = all
            .iter()
            .flat_map(|t| t.memory_ids.iter().map(String::as_str))
            .collect();
        let orphans: Vec<&Atom> = atoms.iter().filter(|a| !assigned.contains(a.id.as_str())).collect();
        let triage = self.atoms.get_low_confidence_atoms();

        json!({
            "total_threads": all.len(),
            "topical_threads": topical.len(),
            "conversation_threads": all.len() - topical.len(),
            "total_atoms": atoms.len(),
            "max_thread_size": sizes.iter().max().copied().unwrap_or(0),
            "oversized_threads": topical.iter()
                .filter(|t| t.memory_ids.len() >= SOFT_CAP)
                .map(|t| json!({"name": t.name, "size": t.memory_ids.len()}))
                .collect::<Vec<_>>(),
            "orphan_atoms": orphans.len(),
            "orphan_atom_ids": orphans.iter().take(50).map(|a| a.id.clone()).collect::<Vec<_>>(),
            "triage_queue": triage.len(),
        })
    }
}

fn merge_stats(into: &mut GardenerStats, from: GardenerStats) {
    into.assigned += from.assigned;
    into.threads_created += from.threads_created;
    into.superseded += from.superseded;
    into.skipped += from.skipped;
    into.splits += from.splits;
    into.merges += from.merges;
    into.blocked_by_size += from.blocked_by_size;
    into.errors.extend(from.errors);
}

fn format_atoms(atoms: &[(Atom, Vec<(String, f32, usize, String)>)]) -> String {
    let mut lines = Vec::new();
    for (atom, candidates) in atoms {
        lines.push(format!("### Atom: {}", atom.id));
        lines.push(format!(
            "- Created: {}",
            atom.created_at.chars().take(10).collect::<String>()
        ));
        lines.push(format!("- Content: {}", atom.content));
        let tags = if atom.tags.is_empty() {
            "none".to_string()
        } else {
            atom.tags.join(", ")
        };
        lines.push(format!("- Tags: {tags}"));
        if candidates.is_empty() {
            lines.push("- No similar threads found; may need a new thread".to_string());
        } else {
            lines.push("- **Candidate threads** (by embedding similarity):".to_string());
            for (name, score, count, scope) in candidates {
                let scope: String = scope.chars().take(60).collect();
                lines.push(format!("  - {name} (score={score:.3}, {count} atoms): {scope}"));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
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
        buffer: Arc<ExchangeBuffer>,
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
            atoms,
            threads,
            buffer,
            _dir: dir,
        }
    }

    fn gardener(f: &Fixture, responses: Vec<serde_json::Value>) -> Gardener {
        Gardener::new(
            f.atoms.clone(),
            f.threads.clone(),
            f.buffer.clone(),
            Arc::new(ScriptedLlm::new(responses)),
            "sonnet".into(),
            "You curate memory threads.".into(),
            300,
        )
    }

    async fn seed_atom(f: &Fixture, content: &str) -> Atom {
        f.atoms
            .create(NewAtom {
                content: content.into(),
                ..NewAtom::default()
            })
            .await
            .unwrap()
    }

    fn assign_decision(atom_id: &str, thread_name: &str, confidence: &str) -> GardenerOutput {
        GardenerOutput {
            decisions: vec![GardenerDecision {
                atom_id: atom_id.into(),
                action: DecisionAction::Assign,
                thread_name: Some(thread_name.into()),
                confidence: Some(confidence.into()),
                new_thread_name: None,
                new_thread_scope: None,
                supersede_content: None,
                supersede_reason: None,
                skip_reason: None,
            }],
            thread_maintenance: vec![],
        }
    }

    #[tokio::test]
    async fn assign_records_confidence() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        let atom = seed_atom(&f, "likes tomatoes").await;
        let thread = f
            .threads
            .create("Food", "eating habits", vec![], None, None, ThreadType::Topical)
            .await
            .unwrap();

        let stats = g
            .apply(&assign_decision(&atom.id, "Food", "high"))
            .await
            .unwrap();
        assert_eq!(stats.assigned, 1);
        assert!(f.threads.get(&thread.id).unwrap().memory_ids.contains(&atom.id));
        let atom = f.atoms.get(&atom.id).unwrap();
        assert_eq!(atom.assignment_confidence.get(&thread.id).unwrap(), "high");
    }

    #[tokio::test]
    async fn hard_capped_thread_blocks_assignment() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        let atom = seed_atom(&f, "one more fact").await;
        let ids: Vec<String> = (0..HARD_CAP).map(|i| format!("a{i}")).collect();
        let thread = f
            .threads
            .create("Full", "at capacity", ids, None, None, ThreadType::Topical)
            .await
            .unwrap();

        let stats = g
            .apply(&assign_decision(&atom.id, "Full", "medium"))
            .await
            .unwrap();
        assert_eq!(stats.blocked_by_size, 1);
        assert_eq!(stats.assigned, 0);
        // No mutation.
        assert_eq!(f.threads.get(&thread.id).unwrap().memory_ids.len(), HARD_CAP);
        assert!(f.atoms.get(&atom.id).unwrap().assignment_confidence.is_empty());
    }

    #[tokio::test]
    async fn create_and_assign_reuses_existing_thread() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        let a1 = seed_atom(&f, "first").await;
        let a2 = seed_atom(&f, "second").await;

        let output = GardenerOutput {
            decisions: vec![
                GardenerDecision {
                    atom_id: a1.id.clone(),
                    action: DecisionAction::CreateAndAssign,
                    thread_name: None,
                    confidence: Some("high".into()),
                    new_thread_name: Some("Projects".into()),
                    new_thread_scope: Some("ongoing projects".into()),
                    supersede_content: None,
                    supersede_reason: None,
                    skip_reason: None,
                },
                GardenerDecision {
                    atom_id: a2.id.clone(),
                    action: DecisionAction::CreateAndAssign,
                    thread_name: None,
                    confidence: None,
                    new_thread_name: Some("Projects".into()),
                    new_thread_scope: Some("ongoing projects".into()),
                    supersede_content: None,
                    supersede_reason: None,
                    skip_reason: None,
                },
            ],
            thread_maintenance: vec![],
        };

        let stats = g.apply(&output).await.unwrap();
        assert_eq!(stats.threads_created, 1);
        assert_eq!(stats.assigned, 2);
        let thread = f.threads.get_by_name("Projects").unwrap();
        assert_eq!(thread.memory_ids.len(), 2);
    }

    #[tokio::test]
    async fn supersede_versions_the_atom() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        let atom = seed_atom(&f, "interviewing at the lab").await;

        let output = GardenerOutput {
            decisions: vec![GardenerDecision {
                atom_id: atom.id.clone(),
                action: DecisionAction::Supersede,
                thread_name: None,
                confidence: None,
                new_thread_name: None,
                new_thread_scope: None,
                supersede_content: Some("accepted the lab offer".into()),
                supersede_reason: Some("Status changed".into()),
                skip_reason: None,
            }],
            thread_maintenance: vec![],
        };

        let stats = g.apply(&output).await.unwrap();
        assert_eq!(stats.superseded, 1);
        let updated = f.atoms.get(&atom.id).unwrap();
        assert_eq!(updated.content, "accepted the lab offer");
        assert_eq!(updated.previous_versions.len(), 1);
        assert_eq!(updated.previous_versions[0].content, "interviewing at the lab");
    }

    #[tokio::test]
    async fn maintenance_refuses_conversation_threads() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        f.threads
            .create(
                "Chatlog",
                "conversation",
                vec!["a1".into()],
                Some("room:c1".into()),
                None,
                ThreadType::Conversation,
            )
            .await
            .unwrap();

        let output = GardenerOutput {
            decisions: vec![],
            thread_maintenance: vec![ThreadMaintenance {
                action: MaintenanceAction::Split,
                source_thread: Some("Chatlog".into()),
                new_threads: vec![NewThreadDef {
                    name: "Half".into(),
                    scope: "half".into(),
                    atom_ids: vec!["a1".into()],
                }],
                merge_threads: vec![],
                merged_name: None,
                merged_scope: None,
            }],
        };

        let stats = g.apply(&output).await.unwrap();
        assert_eq!(stats.splits, 0);
        assert!(stats.errors.iter().any(|e| e.contains("conversation")));
    }

    #[tokio::test]
    async fn merge_maintenance_applies() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        f.threads
            .create("One", "d", vec!["x".into()], None, None, ThreadType::Topical)
            .await
            .unwrap();
        f.threads
            .create("Two", "d", vec!["y".into()], None, None, ThreadType::Topical)
            .await
            .unwrap();

        let output = GardenerOutput {
            decisions: vec![],
            thread_maintenance: vec![ThreadMaintenance {
                action: MaintenanceAction::Merge,
                source_thread: None,
                new_threads: vec![],
                merge_threads: vec!["One".into(), "Two".into()],
                merged_name: Some("Both".into()),
                merged_scope: Some("combined".into()),
            }],
        };

        let stats = g.apply(&output).await.unwrap();
        assert_eq!(stats.merges, 1);
        let merged = f.threads.get_by_name("Both").unwrap();
        assert_eq!(merged.memory_ids, vec!["x", "y"]);
        assert!(f.threads.get_by_name("One").is_none());
    }

    #[tokio::test]
    async fn empty_run_reports_empty() {
        let f = fixture().await;
        let g = gardener(&f, vec![]);
        assert!(matches!(g.run(&[], false).await, GardenerRun::Empty));
    }
}
