//! Turn processing: one user message through WAL, context assembly, the
//! streaming SDK session, persistence, and the memory pipeline hand-off.
//!
//! Order matters: the WAL write happens before anything else touches the
//! message, streaming text is checkpointed as it arrives, and the exchange
//! only reaches the Librarian buffer after the turn fully persists.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use cortex_agents::sdk::{SdkEvent, SdkLaunch, SdkSession};
use cortex_agents::serialize::{render_tool_call, serialize_tool_call, SerializedToolCall};
use cortex_agents::thinking::thinking_config;
use cortex_chats::{Chat, ChatMessage, MessageRole};
use cortex_memory::retrieval::RetrievalRequest;
use cortex_memory::MemoryContext;
use cortex_notify::should_notify;
use cortex_pipelines::Exchange;

use crate::app::{AppState, TurnHandle};
use crate::background;
use crate::events::ServerEvent;

/// Process a user turn end to end. `silent` suppresses notifications
/// (scheduled maintenance turns).
pub async fn process_turn(
    state: &Arc<AppState>,
    msg_id: &str,
    chat_id: &str,
    content: &str,
    silent: bool,
) {
    // Write-ahead before anything else.
    state.wal.write_message(msg_id, chat_id, content);
    state.broadcast(&ServerEvent::Ack {
        msg_id: msg_id.to_string(),
        chat_id: chat_id.to_string(),
    });
    state.wal.ack_message(msg_id);

    let mut chat = state.chats.load_or_create(chat_id);
    state.wal.start_processing(msg_id, chat_id);

    chat.push_message(ChatMessage::new(MessageRole::User, content));
    if let Err(e) = state.chats.save(&chat) {
        error!(chat = chat_id, "failed to persist user message: {e}");
        state.wal.fail_message(msg_id, &e.to_string());
        return;
    }

    match run_streaming_turn(state, &mut chat, msg_id, content).await {
        Ok(assistant_text) => {
            state.wal.complete_message(msg_id);
            finish_turn(state, &mut chat, content, &assistant_text, silent).await;
        }
        Err(e) => {
            error!(chat = chat_id, "turn failed: {e}");
            state.wal.fail_message(msg_id, &e);
            state.broadcast(&ServerEvent::Error {
                chat_id: chat_id.to_string(),
                message: e,
            });
        }
    }
}

/// Assemble context, drive the SDK session, persist as we go. Returns the
/// assistant's full text.
async fn run_streaming_turn(
    state: &Arc<AppState>,
    chat: &mut Chat,
    msg_id: &str,
    content: &str,
) -> Result<String, String> {
    let chat_id = chat.id.clone();
    let agent = state
        .invoker
        .default_agent()
        .ok_or_else(|| "no default agent configured".to_string())?;

    let system_prompt = assemble_system_prompt(state, chat, &agent, content).await;

    let launch = SdkLaunch {
        command: state.sdk_command.clone(),
        model: agent.model.clone(),
        system_prompt: Some(system_prompt),
        allowed_tools: agent.tools.clone(),
        max_turns: agent.max_turns,
        output_format: None,
        thinking: thinking_config(&agent),
        cwd: None,
        prompt: content.to_string(),
    };
    let mut session = SdkSession::spawn(launch).map_err(|e| e.to_string())?;

    state.live_turns.insert(
        chat_id.clone(),
        TurnHandle {
            inject_tx: session.injector(),
            cancel: session.cancel_token(),
        },
    );
    state.wal.start_streaming(&chat_id, &chat_id, msg_id);

    let outcome = stream_events(state, chat, &mut session).await;

    state.live_turns.remove(&chat_id);
    let record = state.wal.complete_streaming(&chat_id);

    match outcome {
        Ok(()) => Ok(record.map(|r| r.full_text()).unwrap_or_default()),
        Err(e) => Err(e),
    }
}

async fn stream_events(
    state: &Arc<AppState>,
    chat: &mut Chat,
    session: &mut SdkSession,
) -> Result<(), String> {
    let chat_id = chat.id.clone();
    let mut tool_inputs: std::collections::HashMap<String, Value> =
        std::collections::HashMap::new();
    let mut turn_error: Option<String> = None;

    while let Some(event) = session.next_event().await {
        match event {
            SdkEvent::TextDelta { text } => {
                state.wal.append_content(&chat_id, &text, false);
                state.broadcast(&ServerEvent::ContentDelta {
                    chat_id: chat_id.clone(),
                    text,
                });
            }
            SdkEvent::ThinkingDelta { text } => {
                state.broadcast(&ServerEvent::ThinkingDelta {
                    chat_id: chat_id.clone(),
                    text,
                });
            }
            SdkEvent::ToolStart { tool_id, tool_name } => {
                state.wal.set_tool_in_progress(&chat_id, Some(&tool_name));
                state.broadcast(&ServerEvent::ToolStart {
                    chat_id: chat_id.clone(),
                    tool_id,
                    tool_name,
                });
            }
            SdkEvent::ToolUse {
                tool_id,
                tool_name,
                input,
            } => {
                tool_inputs.insert(tool_id.clone(), input.clone());
                state.broadcast(&ServerEvent::ToolUse {
                    chat_id: chat_id.clone(),
                    tool_id,
                    tool_name,
                    input,
                });
            }
            SdkEvent::ToolEnd {
                tool_id,
                tool_name,
                output,
                is_error,
            } => {
                state.wal.new_segment(&chat_id);
                state.wal.set_tool_in_progress(&chat_id, None);

                // Tool calls are first-class history: a hidden message the
                // renderer can compact into later turns.
                let args = tool_inputs.remove(&tool_id).unwrap_or(Value::Null);
                let serialized = serialize_tool_call(&tool_name, &args, &output, is_error);
                chat.push_message(ChatMessage::hidden_tool_call(
                    serialized.to_json().to_string(),
                ));
                if let Err(e) = state.chats.save(chat) {
                    warn!("failed to persist tool call: {e}");
                }

                state.broadcast(&ServerEvent::ToolEnd {
                    chat_id: chat_id.clone(),
                    tool_id,
                    tool_name,
                    output,
                    is_error,
                });
            }
            SdkEvent::SessionInit { session_id } => {
                chat.session_id = Some(session_id.clone());
                state.broadcast(&ServerEvent::SessionInit {
                    chat_id: chat_id.clone(),
                    session_id,
                });
            }
            SdkEvent::ResultMeta {
                session_id,
                is_error,
                result,
                cost_usd,
                duration_ms,
                num_turns,
                usage,
            } => {
                // Make sure the final text is on disk before we report.
                state.wal.append_content(&chat_id, "", true);
                chat.cumulative_usage.cost_usd += cost_usd;
                if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                    chat.cumulative_usage.input_tokens += input;
                }
                if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                    chat.cumulative_usage.output_tokens += output;
                }
                state.broadcast(&ServerEvent::ResultMeta {
                    chat_id: chat_id.clone(),
                    session_id,
                    cost_usd,
                    duration_ms,
                    num_turns,
                    usage,
                });
                if is_error {
                    turn_error = Some(if result.is_empty() {
                        "model returned an error".to_string()
                    } else {
                        result
                    });
                }
            }
        }
    }

    match turn_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Persist the assistant message, feed the Librarian buffer, notify, and
/// chain background maintenance.
async fn finish_turn(
    state: &Arc<AppState>,
    chat: &mut Chat,
    user_content: &str,
    assistant_text: &str,
    silent: bool,
) {
    if !assistant_text.is_empty() {
        chat.push_message(ChatMessage::new(MessageRole::Assistant, assistant_text));
    }
    chat.exchange_count += 1;
    if let Err(e) = state.chats.save(chat) {
        error!(chat = %chat.id, "failed to persist assistant message: {e}");
    }

    if let Err(e) = state.buffer.add(Exchange {
        user_message: user_content.to_string(),
        assistant_message: assistant_text.to_string(),
        timestamp: cortex_core::time::now_iso(),
        session_id: chat.id.clone(),
        buffered_at: 0.0,
    }) {
        warn!("failed to buffer exchange: {e}");
    }

    if !silent {
        let decision = should_notify(
            &chat.id,
            chat.scheduled,
            &state.session_snapshot(),
            false,
            cortex_core::time::now_unix(),
            state.config.gateway.stale_timeout_secs as f64,
        );
        if decision.notify {
            let preview: String = assistant_text.chars().take(200).collect();
            if decision.use_toast {
                state.broadcast(&ServerEvent::NewMessageNotification {
                    chat_id: chat.id.clone(),
                    preview: preview.clone(),
                    critical: false,
                    play_sound: decision.play_sound,
                });
            }
            if decision.use_push {
                let push = state.push.clone();
                let chat_id = chat.id.clone();
                tokio::spawn(async move {
                    push.send_push_notification("New message", &preview, &chat_id, false)
                        .await;
                });
            }
        }
    }

    // One working-memory tick per completed exchange.
    match state.working_memory.advance_exchange() {
        Ok(purged) if !purged.is_empty() => {
            info!(purged = purged.len(), "working memory notes expired")
        }
        Ok(_) => {}
        Err(e) => warn!("working memory tick failed: {e}"),
    }

    background::maybe_run_librarian_chain(state.clone());
    info!(chat = %chat.id, "turn complete");
}

/// Build the system prompt: agent prompt, pending ping notifications,
/// semantic memory, recent memory, and compacted tool-call history.
async fn assemble_system_prompt(
    state: &Arc<AppState>,
    chat: &Chat,
    agent: &cortex_agents::AgentConfig,
    user_content: &str,
) -> String {
    let mut sections = Vec::new();
    if let Some(prompt) = &agent.prompt {
        sections.push(prompt.clone());
    }

    // Ping-mode completions for this chat must be surfaced and acknowledged.
    let pending = state.notifications.get_pending(Some(&chat.id));
    if !pending.is_empty() {
        let mut lines =
            vec!["<agent-notifications>".to_string(),
                 "Background agents you invoked have completed. Acknowledge these results to the user:".to_string()];
        let ids: Vec<String> = pending.iter().map(|n| n.id.clone()).collect();
        for n in &pending {
            lines.push(format!("- [{}] {}", n.agent, n.agent_response));
        }
        lines.push("</agent-notifications>".to_string());
        sections.push(lines.join("\n"));
        if let Err(e) = state.notifications.mark_injected(&ids) {
            warn!("failed to mark notifications injected: {e}");
        }
    }

    // Recent conversations first; their thread ids are excluded from the
    // semantic block to avoid duplication.
    let (recent_threads, recent_ids, _) = state.memory.retrieval.recent_conversation_threads(
        state.config.memory.recent_hours,
        state.config.memory.recent_token_budget,
        Some(&chat.id),
        Some(&chat.id),
        None,
    );
    if !recent_threads.is_empty() {
        sections.push(format!(
            "<recent-memory>\n{}\n</recent-memory>",
            cortex_memory::retrieval::format_recent_memory(
                &recent_threads,
                state.config.memory.recent_hours
            )
        ));
    }

    let memory_block = retrieve_memory(state, chat, user_content, recent_ids).await;
    if let Some(block) = memory_block {
        sections.push(format!("<long-term-memory>\n{block}\n</long-term-memory>"));
    }

    let wm = cortex_agents::working_memory::format_working_memory(&state.working_memory.list());
    if !wm.is_empty() {
        sections.push(format!("<working-memory>\n{wm}\n</working-memory>"));
    }

    let tool_history = render_tool_history(chat);
    if !tool_history.is_empty() {
        sections.push(format!(
            "<recent-tool-calls>\n{tool_history}\n</recent-tool-calls>"
        ));
    }

    sections.join("\n\n")
}

/// Rewrite the user message into queries and run hybrid retrieval for
/// each, splitting the budget by weight.
async fn retrieve_memory(
    state: &Arc<AppState>,
    chat: &Chat,
    user_content: &str,
    exclude_thread_ids: HashSet<String>,
) -> Option<String> {
    let context_pairs: Vec<(String, String)> = chat
        .messages
        .iter()
        .filter(|m| !m.hidden)
        .rev()
        .take(6)
        .map(|m| {
            let role = match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                _ => "system",
            };
            (role.to_string(), m.content.clone())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let rewritten = state.rewriter.rewrite(user_content, &context_pairs).await;
    let total_weight: f64 = rewritten.queries.iter().map(|q| q.weight).sum();
    let budget = state.config.memory.retrieval_token_budget;

    let mut merged: Option<MemoryContext> = None;
    let mut exclude = exclude_thread_ids;
    let mut seen_atoms: HashSet<String> = HashSet::new();

    for query in &rewritten.queries {
        let share = if total_weight > 0.0 {
            ((budget as f64) * query.weight / total_weight) as usize
        } else {
            budget / rewritten.queries.len().max(1)
        };
        let request = RetrievalRequest {
            query: query.text.clone(),
            token_budget: share,
            exclude_session_id: Some(chat.id.clone()),
            session_uncompacted_after: None,
            exclude_thread_ids: exclude.clone(),
        };
        match state.memory.retrieval.get_memory_context(&request).await {
            Ok(context) => {
                for t in &context.threads {
                    exclude.insert(t.id.clone());
                }
                let target = merged.get_or_insert_with(MemoryContext::default);
                for thread in context.threads {
                    for m in &thread.memories {
                        seen_atoms.insert(m.id.clone());
                    }
                    target.threads.push(thread);
                }
                for bonus in context.atomic_memories {
                    if seen_atoms.insert(bonus.id.clone()) {
                        target.atomic_memories.push(bonus);
                    }
                }
                target.total_tokens += context.total_tokens;
            }
            Err(e) => warn!("memory retrieval failed: {e}"),
        }
    }

    merged
        .filter(|m| !m.is_empty())
        .map(|m| m.format_for_prompt())
}

/// Compact one-liners for the chat's recent hidden tool calls.
fn render_tool_history(chat: &Chat) -> String {
    chat.messages
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::ToolCall)
        .take(20)
        .filter_map(|m| {
            serde_json::from_str::<Value>(&m.content)
                .ok()
                .as_ref()
                .and_then(SerializedToolCall::from_json)
                .map(|c| render_tool_call(&c))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_history_renders_compact_lines() {
        let mut chat = Chat::new("c1");
        let call = serialize_tool_call(
            "Bash",
            &serde_json::json!({"command": "ls"}),
            "file.txt",
            false,
        );
        chat.push_message(ChatMessage::hidden_tool_call(call.to_json().to_string()));
        chat.push_message(ChatMessage::new(MessageRole::Assistant, "done"));

        let rendered = render_tool_history(&chat);
        assert!(rendered.starts_with("[Tool: Bash"));
        assert!(rendered.contains("Output: file.txt"));
    }
}
