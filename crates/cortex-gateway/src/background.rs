//! Background pipeline chaining.
//!
//! After each completed exchange the Librarian may run (the buffer and
//! throttle decide). A completed Librarian run chains the Chronicler,
//! targeted at exactly the conversation threads it touched, and the
//! Gardener with the newly created atom ids.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use cortex_pipelines::{ChroniclerRun, GardenerRun, LibrarianRun};

use crate::app::AppState;

/// One pipeline chain at a time; overlapping turns skip rather than queue.
static CHAIN_RUNNING: AtomicBool = AtomicBool::new(false);

/// Fire-and-forget: run a Librarian cycle and its downstream chain when the
/// throttle allows.
pub fn maybe_run_librarian_chain(state: Arc<AppState>) {
    if CHAIN_RUNNING.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        run_chain(&state).await;
        CHAIN_RUNNING.store(false, Ordering::SeqCst);
    });
}

async fn run_chain(state: &Arc<AppState>) {
    match state.librarian.run_cycle().await {
        LibrarianRun::EmptyBuffer => {}
        LibrarianRun::Throttled {
            minutes_remaining, ..
        } => {
            info!(minutes_remaining, "Librarian throttled");
        }
        LibrarianRun::Failed { error } => warn!("Librarian failed: {error}"),
        LibrarianRun::Completed {
            exchanges_processed,
            stats,
            affected_conversation_threads,
            created_atom_ids,
        } => {
            info!(
                exchanges_processed,
                created = stats.memories_created,
                "Librarian completed"
            );

            if !affected_conversation_threads.is_empty() {
                match state
                    .chronicler
                    .run(Some(&affected_conversation_threads))
                    .await
                {
                    ChroniclerRun::Completed {
                        threads_summarized, ..
                    } => info!(threads_summarized, "Chronicler completed"),
                    ChroniclerRun::NoWork => {}
                    ChroniclerRun::Failed { error } => warn!("Chronicler failed: {error}"),
                }
            }

            if !created_atom_ids.is_empty() {
                match state.gardener.run_batched(&created_atom_ids).await {
                    GardenerRun::Completed {
                        atoms_processed,
                        stats,
                        ..
                    } => info!(
                        atoms_processed,
                        assigned = stats.assigned,
                        blocked = stats.blocked_by_size,
                        "Gardener completed"
                    ),
                    GardenerRun::Empty => {}
                    GardenerRun::Failed { error } => warn!("Gardener failed: {error}"),
                }
            }
        }
    }
}
