//! Fired-task routing.
//!
//! The scheduler engine forwards due tasks over a channel; agent tasks go
//! through the invoker in scheduled mode, prompt tasks become automated
//! user turns in their target chat (or the active room).

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use cortex_agents::InvocationMode;
use cortex_scheduler::{TaskFire, TaskType};

use crate::app::AppState;
use crate::turn;

/// Consume fired tasks until the channel closes.
pub async fn run_dispatcher(state: Arc<AppState>, mut fired_rx: mpsc::Receiver<TaskFire>) {
    info!("task dispatcher started");
    while let Some(fire) = fired_rx.recv().await {
        dispatch(&state, fire).await;
    }
    info!("task dispatcher stopped");
}

async fn dispatch(state: &Arc<AppState>, fire: TaskFire) {
    info!(task = %fire.id, kind = ?fire.task_type, silent = fire.silent, "dispatching task");
    match fire.task_type {
        TaskType::Agent => {
            let Some(agent) = fire.agent.clone() else {
                warn!(task = %fire.id, "agent task without an agent name");
                return;
            };
            let outcome = state
                .invoker
                .invoke_agent(
                    &agent,
                    &fire.prompt,
                    InvocationMode::Scheduled,
                    fire.room_id.clone(),
                    None,
                    fire.project.clone(),
                )
                .await;
            info!(task = %fire.id, agent, ?outcome, "scheduled agent dispatched");
        }
        TaskType::Prompt => {
            let chat_id = match fire.room_id.clone().or_else(|| active_room(state)) {
                Some(id) => id,
                None => format!("scheduled-{}", fire.id),
            };
            let msg_id = cortex_core::ids::prefixed_id("msg");
            turn::process_turn(state, &msg_id, &chat_id, &fire.prompt, fire.silent).await;
        }
    }
}

/// The chat the user is currently focused on, persisted by the UI.
fn active_room(state: &Arc<AppState>) -> Option<String> {
    let value: serde_json::Value = cortex_core::files::load_json(
        &state.config.data.active_room_file(),
        serde_json::Value::Null,
    );
    value
        .get("room_id")
        .and_then(serde_json::Value::as_str)
        .map(String::from)
}
