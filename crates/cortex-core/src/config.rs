use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (cortex.toml + CORTEX_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CortexConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub pipelines: PipelineConfig,
    #[serde(default)]
    pub push: PushConfig,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            data: DataConfig::default(),
            memory: MemoryConfig::default(),
            encoder: EncoderConfig::default(),
            pipelines: PipelineConfig::default(),
            push: PushConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds after the last heartbeat before a client session is stale.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            stale_timeout_secs: default_stale_timeout(),
        }
    }
}

/// Root of all persisted state. Every store path below derives from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
    /// Path to the script spawned after a self-restart.
    #[serde(default)]
    pub start_script: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
            start_script: None,
        }
    }
}

impl DataConfig {
    pub fn memory_dir(&self) -> PathBuf {
        self.dir.join("memory")
    }
    pub fn embeddings_dir(&self) -> PathBuf {
        self.memory_dir().join("embeddings")
    }
    pub fn chats_dir(&self) -> PathBuf {
        self.dir.join("chats")
    }
    pub fn chats_meta_file(&self) -> PathBuf {
        self.dir.join("chats_meta.json")
    }
    pub fn agents_dir(&self) -> PathBuf {
        self.dir.join("agents")
    }
    pub fn wal_dir(&self) -> PathBuf {
        self.dir.join("wal")
    }
    pub fn notifications_file(&self) -> PathBuf {
        self.dir.join("notifications").join("pending.json")
    }
    pub fn process_registry_file(&self) -> PathBuf {
        self.dir.join("process_registry.json")
    }
    pub fn executions_file(&self) -> PathBuf {
        self.dir.join("executions.json")
    }
    pub fn tasks_file(&self) -> PathBuf {
        self.dir.join("scheduled_tasks.json")
    }
    pub fn active_room_file(&self) -> PathBuf {
        self.dir.join("active_room.json")
    }
    pub fn restart_marker_file(&self) -> PathBuf {
        self.dir.join("restart_continuation.json")
    }
    pub fn vapid_keys_file(&self) -> PathBuf {
        self.dir.join("secrets").join("vapid_keys.json")
    }
    pub fn push_subscriptions_file(&self) -> PathBuf {
        self.dir.join("push_subscriptions.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Token budget for the semantic memory block.
    #[serde(default = "default_retrieval_budget")]
    pub retrieval_token_budget: usize,
    /// Token budget for the recent-memory block.
    #[serde(default = "default_recent_budget")]
    pub recent_token_budget: usize,
    /// Look-back window for the recent-memory block.
    #[serde(default = "default_recent_hours")]
    pub recent_hours: i64,
    /// Cosine floor below which threads/atoms are never retrieved.
    /// Tuned for e5-class encoders; re-tune if the encoder changes.
    #[serde(default = "default_min_score")]
    pub min_semantic_score: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieval_token_budget: default_retrieval_budget(),
            recent_token_budget: default_recent_budget(),
            recent_hours: default_recent_hours(),
            min_semantic_score: default_min_score(),
        }
    }
}

/// Sentence-encoder service reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_url")]
    pub base_url: String,
    #[serde(default = "default_encoder_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_encoder_batch")]
    pub batch_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            base_url: default_encoder_url(),
            timeout_secs: default_encoder_timeout(),
            batch_size: default_encoder_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum seconds between Librarian runs.
    #[serde(default = "default_throttle_secs")]
    pub librarian_throttle_secs: f64,
    /// Exchange buffer cap; overflow trims oldest.
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,
    /// Timeout applied to each pipeline LLM call.
    #[serde(default = "default_pipeline_timeout")]
    pub llm_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            librarian_throttle_secs: default_throttle_secs(),
            buffer_cap: default_buffer_cap(),
            llm_timeout_secs: default_pipeline_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushConfig {
    /// When false, push delivery is a logged no-op.
    #[serde(default)]
    pub enabled: bool,
}

fn default_port() -> u16 {
    8765
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_stale_timeout() -> u64 {
    90
}
fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cortex")
}
fn default_retrieval_budget() -> usize {
    20_000
}
fn default_recent_budget() -> usize {
    4_000
}
fn default_recent_hours() -> i64 {
    24
}
fn default_min_score() -> f32 {
    0.65
}
fn default_encoder_url() -> String {
    "http://localhost:8876".to_string()
}
fn default_encoder_timeout() -> u64 {
    60
}
fn default_encoder_batch() -> usize {
    32
}
fn default_throttle_secs() -> f64 {
    20.0 * 60.0
}
fn default_buffer_cap() -> usize {
    100
}
fn default_pipeline_timeout() -> u64 {
    300
}

impl CortexConfig {
    /// Load config from a TOML file with CORTEX_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CORTEX_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.cortex/cortex.toml")
}
