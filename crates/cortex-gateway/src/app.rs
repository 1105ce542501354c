//! Application state: every store and service, wired once at startup and
//! passed explicitly. No global singletons — tests build an `AppState`
//! over a temp dir with a scripted LLM and a deterministic embedder.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cortex_agents::executions::ExecutionLog;
use cortex_agents::working_memory::WorkingMemoryStore;
use cortex_agents::{AgentInvoker, AgentRegistry, NotificationQueue, ProcessRegistry};
use cortex_chats::{ChatStore, MessageWal};
use cortex_core::CortexConfig;
use cortex_memory::{Embedder, MemoryService};
use cortex_notify::{ClientSession, PushService};
use cortex_pipelines::{
    Chronicler, ExchangeBuffer, Gardener, Librarian, PipelineLlm, QueryRewriter,
};

use crate::events::ServerEvent;

/// A live streaming turn, addressable for interrupt and injection.
pub struct TurnHandle {
    pub inject_tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

pub struct AppState {
    pub config: CortexConfig,
    /// SDK binary used for chat-turn sessions.
    pub sdk_command: String,
    pub memory: MemoryService,
    pub chats: ChatStore,
    pub wal: MessageWal,
    pub invoker: Arc<AgentInvoker>,
    pub process_registry: Arc<ProcessRegistry>,
    pub notifications: Arc<NotificationQueue>,
    pub buffer: Arc<ExchangeBuffer>,
    pub librarian: Arc<Librarian>,
    pub gardener: Arc<Gardener>,
    pub chronicler: Arc<Chronicler>,
    pub rewriter: Arc<QueryRewriter>,
    pub push: Arc<PushService>,
    /// The primary agent's working memory (TTL notes).
    pub working_memory: Arc<WorkingMemoryStore>,
    /// Connected clients: connection id → session state.
    pub client_sessions: DashMap<String, ClientSession>,
    /// Connected clients' outbound event channels.
    pub client_txs: DashMap<String, mpsc::UnboundedSender<ServerEvent>>,
    /// Streaming turns by chat id.
    pub live_turns: DashMap<String, TurnHandle>,
}

impl AppState {
    /// Wire everything over the configured data dir.
    pub async fn build(
        config: CortexConfig,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn PipelineLlm>,
        sdk_command: String,
    ) -> anyhow::Result<Arc<Self>> {
        let data = &config.data;
        std::fs::create_dir_all(&data.dir)?;

        let memory = MemoryService::open(
            data.memory_dir(),
            embedder,
            config.encoder.batch_size,
            config.memory.min_semantic_score,
        )
        .await?;

        let chats = ChatStore::open(data.chats_dir(), data.chats_meta_file())?;
        let wal = MessageWal::open(data.wal_dir())?;

        let process_registry = Arc::new(ProcessRegistry::new(data.process_registry_file()));
        let executions = Arc::new(ExecutionLog::new(data.executions_file()));
        let notifications = Arc::new(NotificationQueue::new(data.notifications_file()));
        let mut registry = AgentRegistry::new(data.agents_dir());
        registry.load_all();
        let invoker = AgentInvoker::new(
            registry,
            process_registry.clone(),
            executions,
            notifications.clone(),
            sdk_command.clone(),
            Some(data.dir.clone()),
        );

        let buffer = Arc::new(ExchangeBuffer::new(
            &data.memory_dir(),
            config.pipelines.buffer_cap,
            config.pipelines.librarian_throttle_secs,
        ));

        let librarian = Arc::new(Librarian::new(
            buffer.clone(),
            memory.atoms.clone(),
            memory.threads.clone(),
            llm.clone(),
            "sonnet".to_string(),
            load_pipeline_prompt(&data.agents_dir(), "librarian"),
            config.pipelines.llm_timeout_secs,
        ));
        let gardener = Arc::new(Gardener::new(
            memory.atoms.clone(),
            memory.threads.clone(),
            buffer.clone(),
            llm.clone(),
            "sonnet".to_string(),
            load_pipeline_prompt(&data.agents_dir(), "gardener"),
            config.pipelines.llm_timeout_secs,
        ));
        let chronicler = Arc::new(Chronicler::new(
            memory.atoms.clone(),
            memory.threads.clone(),
            llm.clone(),
            "haiku".to_string(),
            load_pipeline_prompt(&data.agents_dir(), "chronicler"),
            config.pipelines.llm_timeout_secs,
            data.memory_dir().join("chronicler_state.json"),
        ));
        let rewriter = Arc::new(QueryRewriter::new(llm, "haiku"));

        let push = Arc::new(PushService::new(
            data.vapid_keys_file(),
            data.push_subscriptions_file(),
            config.push.enabled,
        ));

        let primary = invoker
            .default_agent()
            .map(|a| a.name)
            .unwrap_or_else(|| "primary".to_string());
        let working_memory = Arc::new(WorkingMemoryStore::open(
            data.agents_dir().join(&primary).join("working_memory.json"),
        ));

        Ok(Arc::new(Self {
            config,
            sdk_command,
            memory,
            chats,
            wal,
            invoker,
            process_registry,
            notifications,
            buffer,
            librarian,
            gardener,
            chronicler,
            rewriter,
            push,
            working_memory,
            client_sessions: DashMap::new(),
            client_txs: DashMap::new(),
            live_turns: DashMap::new(),
        }))
    }

    /// Fan an event out to every connected client, pruning dead channels.
    pub fn broadcast(&self, event: &ServerEvent) {
        let mut dead = Vec::new();
        for entry in self.client_txs.iter() {
            if entry.value().send(event.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for key in dead {
            self.client_txs.remove(&key);
            self.client_sessions.remove(&key);
        }
    }

    /// Snapshot of client sessions for the notification decision.
    pub fn session_snapshot(&self) -> cortex_notify::types::ClientSessions {
        self.client_sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Startup recovery: clear stale WAL entries and the process registry,
    /// and tell reconnecting clients their previous turn was interrupted.
    pub fn recover_on_startup(&self) {
        let (dropped_pending, dropped_streaming) = self.wal.clear_stale_on_restart();
        if let Err(e) = self.process_registry.clear() {
            tracing::warn!("failed to clear process registry: {e}");
        }
        for msg in dropped_pending {
            if let Some(chat_id) = msg.chat_id.or(Some(msg.session_id)) {
                self.broadcast(&ServerEvent::TurnInterrupted {
                    chat_id,
                    reason: "The server restarted while your message was being processed."
                        .to_string(),
                });
            }
        }
        for resp in dropped_streaming {
            self.broadcast(&ServerEvent::TurnInterrupted {
                chat_id: resp.chat_id,
                reason: "The server restarted mid-response.".to_string(),
            });
        }
        info!("startup recovery complete");
    }
}

/// Background pipeline prompts live next to the background agent configs.
fn load_pipeline_prompt(agents_dir: &PathBuf, name: &str) -> String {
    let path = agents_dir.join("background").join(name).join("prompt.md");
    std::fs::read_to_string(&path).unwrap_or_else(|_| {
        tracing::warn!(agent = name, "missing pipeline prompt, using placeholder");
        format!("You are the {name} maintenance agent.")
    })
}
