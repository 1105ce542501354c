//! Agent invocation engine.
//!
//! Four modes share one execution path: foreground awaits the result, ping
//! spawns and queues a notification for the source chat on completion,
//! trust and scheduled spawn and only log. Every invocation registers in
//! the process registry and lands in the execution log; SDK agents with
//! skill access run inside a per-invocation isolated config directory so
//! parallel invocations never race on the shared identity file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::cli::run_cli_agent;
use crate::error::{AgentError, Result};
use crate::executions::ExecutionLog;
use crate::notify_queue::NotificationQueue;
use crate::process::ProcessRegistry;
use crate::registry::{AgentRegistry, VALID_MODELS};
use crate::sdk::{SdkEvent, SdkLaunch, SdkSession};
use crate::thinking::thinking_config;
use crate::types::{
    AgentConfig, AgentInvocation, AgentKind, AgentResult, AgentStatus, InvocationMode,
};

/// The identity-carrying instructions file at the root of the project
/// config dir. Never shared between concurrent invocations.
pub const IDENTITY_FILE: &str = "AGENTS.md";

/// What an invocation returned to its caller.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// Foreground: the finished result.
    Completed(AgentResult),
    /// Ping/trust/scheduled: accepted and running in the background.
    Accepted { agent: String, mode: InvocationMode, message: String },
    /// The request was rejected before execution.
    Rejected { error: String },
}

pub struct AgentInvoker {
    registry: RwLock<AgentRegistry>,
    process_registry: Arc<ProcessRegistry>,
    executions: Arc<ExecutionLog>,
    notifications: Arc<NotificationQueue>,
    /// SDK binary to spawn.
    sdk_command: String,
    /// Project-level config dir (skills, settings, the identity file).
    project_config_dir: Option<PathBuf>,
}

impl AgentInvoker {
    pub fn new(
        registry: AgentRegistry,
        process_registry: Arc<ProcessRegistry>,
        executions: Arc<ExecutionLog>,
        notifications: Arc<NotificationQueue>,
        sdk_command: String,
        project_config_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(registry),
            process_registry,
            executions,
            notifications,
            sdk_command,
            project_config_dir,
        })
    }

    pub fn reload_registry(&self) {
        self.registry.write().unwrap().reload();
    }

    pub fn agent_config(&self, name: &str) -> Option<AgentConfig> {
        self.registry.read().unwrap().get(name).cloned()
    }

    pub fn default_agent(&self) -> Option<AgentConfig> {
        self.registry.read().unwrap().default_agent().cloned()
    }

    /// Invoke an agent. Errors surface as a status, never a panic or a
    /// raised error across this boundary.
    pub async fn invoke_agent(
        self: &Arc<Self>,
        name: &str,
        prompt: &str,
        mode: InvocationMode,
        source_chat_id: Option<String>,
        model_override: Option<String>,
        project: Option<String>,
    ) -> InvokeOutcome {
        let Some(mut config) = self.agent_config(name) else {
            let error = format!("Unknown agent: {name}");
            if mode == InvocationMode::Foreground {
                return InvokeOutcome::Completed(AgentResult::failure(name, Utc::now(), error));
            }
            return InvokeOutcome::Rejected { error };
        };

        if let Some(model) = &model_override {
            if VALID_MODELS.contains(&model.as_str()) {
                config.model = model.clone();
            } else {
                warn!(model, "ignoring invalid model override");
            }
        }

        let mut prompt = prompt.to_string();
        if let Some(project) = &project {
            prompt.push_str(&project_metadata_block(name, project, None));
            info!(agent = name, project, "injected project metadata block");
        }

        let invocation = AgentInvocation {
            agent: name.to_string(),
            prompt: prompt.clone(),
            mode,
            source_chat_id: source_chat_id.clone(),
            model_override,
            project,
            invoked_at: Utc::now(),
        };

        info!(agent = name, mode = ?mode, "invoking agent");

        match mode {
            InvocationMode::Foreground => {
                let result = self.run_agent(&config, &invocation).await;
                self.executions.append(invocation, result.clone());
                InvokeOutcome::Completed(result)
            }
            InvocationMode::Ping => {
                let Some(chat_id) = source_chat_id else {
                    return InvokeOutcome::Rejected {
                        error: "source_chat_id required for ping mode".to_string(),
                    };
                };
                let this = self.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let result = this.run_agent(&config, &invocation).await;
                    let response = match result.status {
                        AgentStatus::Success => result.response.clone(),
                        _ => format!(
                            "Error: {}",
                            result.error.clone().unwrap_or_else(|| "unknown".into())
                        ),
                    };
                    if let Err(e) = this.notifications.add(
                        &config.name,
                        &response,
                        &chat_id,
                        invocation.invoked_at,
                    ) {
                        error!(agent = %config.name, "failed to queue ping notification: {e}");
                    }
                    this.executions.append(invocation, result);
                });
                InvokeOutcome::Accepted {
                    agent: name.to_string(),
                    mode,
                    message: format!(
                        "Agent '{name}' is working on your task. You'll be notified when done."
                    ),
                }
            }
            InvocationMode::Trust | InvocationMode::Scheduled => {
                let this = self.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let result = this.run_agent(&config, &invocation).await;
                    this.executions.append(invocation, result);
                });
                InvokeOutcome::Accepted {
                    agent: name.to_string(),
                    mode,
                    message: format!("Agent '{name}' is working on your task."),
                }
            }
        }
    }

    /// Execute one agent to completion, converting failures into a result
    /// status.
    async fn run_agent(&self, config: &AgentConfig, invocation: &AgentInvocation) -> AgentResult {
        let started_at = Utc::now();
        let outcome = match config.kind {
            AgentKind::Cli => self.run_cli(config, invocation).await,
            AgentKind::Sdk => self.run_sdk(config, invocation).await,
        };
        match outcome {
            Ok(response) => AgentResult {
                agent: config.name.clone(),
                status: AgentStatus::Success,
                response,
                started_at,
                completed_at: Utc::now(),
                error: None,
            },
            Err(AgentError::Timeout { seconds }) => AgentResult {
                agent: config.name.clone(),
                status: AgentStatus::Timeout,
                response: String::new(),
                started_at,
                completed_at: Utc::now(),
                error: Some(format!("Agent timed out after {seconds} seconds")),
            },
            Err(e) => {
                error!(agent = %config.name, "agent failed: {e}");
                AgentResult::failure(&config.name, started_at, e.to_string())
            }
        }
    }

    async fn run_cli(&self, config: &AgentConfig, invocation: &AgentInvocation) -> Result<String> {
        let reg_id = self
            .process_registry
            .register(&config.name, &invocation.prompt, None)
            .ok();

        let result = run_cli_agent(
            &self.sdk_command,
            config,
            &invocation.prompt,
            config.prompt.as_deref(),
        )
        .await;

        if let Some(reg_id) = reg_id {
            if let Err(e) = self.process_registry.deregister(&reg_id) {
                warn!(agent = %config.name, "failed to deregister: {e}");
            }
        }
        result
    }

    async fn run_sdk(&self, config: &AgentConfig, invocation: &AgentInvocation) -> Result<String> {
        let reg_id = self
            .process_registry
            .register(&config.name, &invocation.prompt, None)
            .ok();

        // Concurrency-safe config isolation: a temp dir symlinking the
        // project config minus the identity file, plus a per-invocation
        // stub. Removed on every exit path (symlinks make this safe).
        let isolated = match &self.project_config_dir {
            Some(project_dir) if config.has_skills() && project_dir.join(IDENTITY_FILE).exists() => {
                match build_isolated_config_dir(config, project_dir) {
                    Ok(dir) => Some(dir),
                    Err(e) => {
                        warn!(agent = %config.name, "config isolation failed, running without: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        let launch = SdkLaunch {
            command: self.sdk_command.clone(),
            model: config.model.clone(),
            system_prompt: config.prompt.clone(),
            allowed_tools: config.tools.clone(),
            max_turns: config.max_turns,
            output_format: config.output_format.clone(),
            thinking: thinking_config(config),
            cwd: isolated.as_ref().map(|d| d.path().to_path_buf()),
            prompt: invocation.prompt.clone(),
        };

        let result = consume_sdk_session(launch, config.timeout_seconds).await;

        drop(isolated);
        if let Some(reg_id) = reg_id {
            if let Err(e) = self.process_registry.deregister(&reg_id) {
                warn!(agent = %config.name, "failed to deregister: {e}");
            }
        }
        result
    }
}

/// Drive an SDK session to completion and return its final text.
async fn consume_sdk_session(launch: SdkLaunch, timeout_seconds: u64) -> Result<String> {
    let mut session = SdkSession::spawn(launch)?;

    let consume = async {
        let mut text = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut error_text = String::new();
        while let Some(event) = session.next_event().await {
            match event {
                SdkEvent::TextDelta { text: t } => text.push_str(&t),
                SdkEvent::ResultMeta {
                    result,
                    is_error: err,
                    ..
                } => {
                    is_error = err;
                    error_text = result.clone();
                    final_result = Some(result);
                }
                _ => {}
            }
        }
        if is_error {
            return Err(AgentError::Subprocess(format!(
                "SDK session reported error: {error_text}"
            )));
        }
        Ok(final_result.filter(|r| !r.is_empty()).unwrap_or(text))
    };

    match tokio::time::timeout(std::time::Duration::from_secs(timeout_seconds), consume).await {
        Ok(result) => result,
        Err(_) => {
            session.interrupt();
            Err(AgentError::Timeout {
                seconds: timeout_seconds,
            })
        }
    }
}

/// Build the per-invocation isolated config dir: symlinks to every project
/// config entry except the identity file, plus an agent-scoped stub.
pub fn build_isolated_config_dir(
    config: &AgentConfig,
    project_dir: &Path,
) -> Result<tempfile::TempDir> {
    let temp = tempfile::Builder::new()
        .prefix(&format!("agent_{}_", config.name))
        .tempdir()?;

    for entry in std::fs::read_dir(project_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy() == IDENTITY_FILE {
            continue;
        }
        let target = temp.path().join(&name);
        std::os::unix::fs::symlink(entry.path(), &target)?;
    }

    let stub = format!(
        "# Agent: {}\n\n\
         Your system instructions are provided via the system prompt.\n\
         Follow only those instructions.\n",
        config.name
    );
    std::fs::write(temp.path().join(IDENTITY_FILE), stub)?;
    info!(agent = %config.name, dir = %temp.path().display(), "built isolated config dir");
    Ok(temp)
}

/// The PROJECT METADATA block appended to prompts of project-tagged
/// invocations. The agent is instructed, not policed: output frontmatter
/// and the filename convention are contract, not enforcement.
pub fn project_metadata_block(agent_name: &str, project: &str, task_id: Option<&str>) -> String {
    let today = Utc::now().format("%Y-%m-%d");
    let tid = task_id.unwrap_or("ad-hoc");
    format!(
        "\n\n[PROJECT METADATA]\n\
         project: {project}\n\
         task_id: {tid}\n\n\
         When writing output files, include this YAML frontmatter at the top of the file:\n\
         ---\n\
         agent: {agent_name}\n\
         project: {project}\n\
         date: {today}\n\
         task_id: {tid}\n\
         ---\n\n\
         Use this output filename pattern: inbox/agent_outputs/{today}_{agent_name}_{project}_{{slug}}.md\n\
         (Replace {{slug}} with a short descriptive name for the output content.)\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentKind;

    fn config(name: &str) -> AgentConfig {
        AgentConfig {
            name: name.into(),
            kind: AgentKind::Sdk,
            model: "sonnet".into(),
            description: String::new(),
            tools: vec!["Skill".into()],
            timeout_seconds: 30,
            max_turns: 10,
            output_format: None,
            prompt: None,
            system_prompt_preset: None,
            chattable: false,
            default: false,
            effort: None,
            thinking_budget: None,
        }
    }

    #[test]
    fn isolation_dir_symlinks_all_but_identity_file() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(IDENTITY_FILE), "# primary identity").unwrap();
        std::fs::write(project.path().join("settings.json"), "{}").unwrap();
        std::fs::create_dir(project.path().join("skills")).unwrap();

        let isolated = build_isolated_config_dir(&config("scout"), project.path()).unwrap();

        // Identity file is a fresh stub, not a link.
        let stub_path = isolated.path().join(IDENTITY_FILE);
        assert!(!std::fs::symlink_metadata(&stub_path).unwrap().is_symlink());
        let stub = std::fs::read_to_string(&stub_path).unwrap();
        assert!(stub.contains("Agent: scout"));
        assert!(!stub.contains("primary identity"));

        // Everything else is symlinked through.
        assert!(std::fs::symlink_metadata(isolated.path().join("settings.json"))
            .unwrap()
            .is_symlink());
        assert!(std::fs::symlink_metadata(isolated.path().join("skills"))
            .unwrap()
            .is_symlink());
    }

    #[test]
    fn isolation_dir_cleanup_keeps_originals() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(IDENTITY_FILE), "id").unwrap();
        std::fs::write(project.path().join("data.json"), "{\"k\":1}").unwrap();

        let isolated = build_isolated_config_dir(&config("scout"), project.path()).unwrap();
        let path = isolated.path().to_path_buf();
        drop(isolated);

        assert!(!path.exists());
        // Originals untouched.
        assert_eq!(
            std::fs::read_to_string(project.path().join("data.json")).unwrap(),
            "{\"k\":1}"
        );
    }

    #[test]
    fn metadata_block_carries_frontmatter_keys() {
        let block = project_metadata_block("researcher", "apollo", Some("t-42"));
        assert!(block.contains("[PROJECT METADATA]"));
        assert!(block.contains("agent: researcher"));
        assert!(block.contains("project: apollo"));
        assert!(block.contains("task_id: t-42"));
        assert!(block.contains("{slug}"));
    }

    #[tokio::test]
    async fn unknown_agent_foreground_returns_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(dir.path().join("agents"));
        let invoker = AgentInvoker::new(
            registry,
            Arc::new(ProcessRegistry::new(dir.path().join("procs.json"))),
            Arc::new(ExecutionLog::new(dir.path().join("executions.json"))),
            Arc::new(NotificationQueue::new(dir.path().join("pending.json"))),
            "claude".into(),
            None,
        );
        let outcome = invoker
            .invoke_agent("ghost", "do it", InvocationMode::Foreground, None, None, None)
            .await;
        match outcome {
            InvokeOutcome::Completed(result) => {
                assert_eq!(result.status, AgentStatus::Error);
                assert!(result.error.unwrap().contains("Unknown agent"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_without_source_chat_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("agents");
        std::fs::create_dir_all(agents_dir.join("scout")).unwrap();
        std::fs::write(
            agents_dir.join("scout").join("config.toml"),
            "name = \"scout\"",
        )
        .unwrap();
        let mut registry = AgentRegistry::new(agents_dir);
        registry.load_all();

        let invoker = AgentInvoker::new(
            registry,
            Arc::new(ProcessRegistry::new(dir.path().join("procs.json"))),
            Arc::new(ExecutionLog::new(dir.path().join("executions.json"))),
            Arc::new(NotificationQueue::new(dir.path().join("pending.json"))),
            "claude".into(),
            None,
        );
        let outcome = invoker
            .invoke_agent("scout", "p", InvocationMode::Ping, None, None, None)
            .await;
        assert!(matches!(outcome, InvokeOutcome::Rejected { .. }));
    }
}
