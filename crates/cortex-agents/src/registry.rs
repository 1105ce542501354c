//! Agent discovery and validation.
//!
//! Scans `agents/<name>/` for `config.toml` + `prompt.md`. Background
//! agents (pipeline workers) live under `agents/background/<name>/` and are
//! kept out of the user-facing agent list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::types::{AgentConfig, AgentKind};

/// Models accepted by short alias.
pub const VALID_MODELS: &[&str] = &["sonnet", "opus", "haiku"];

/// Native tools agents may request.
pub const VALID_NATIVE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "Write",
    "Edit",
    "Bash",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "Skill",
];

/// Tools stripped unconditionally — agents may not spawn subagents.
pub const FORBIDDEN_TOOLS: &[&str] = &["Task"];

const SKIP_DIRS: &[&str] = &["notifications"];

pub struct AgentRegistry {
    base_dir: PathBuf,
    agents: HashMap<String, AgentConfig>,
    background_agents: HashMap<String, AgentConfig>,
}

impl AgentRegistry {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            agents: HashMap::new(),
            background_agents: HashMap::new(),
        }
    }

    /// Discover and load all agent configurations. Invalid entries are
    /// logged and skipped; they never take down the registry.
    pub fn load_all(&mut self) {
        self.agents.clear();
        self.background_agents.clear();

        if !self.base_dir.exists() {
            warn!(dir = %self.base_dir.display(), "agents directory does not exist");
            return;
        }

        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') || name.starts_with('.') || SKIP_DIRS.contains(&name.as_str())
            {
                continue;
            }
            if name == "background" {
                self.load_background(&path);
                continue;
            }
            if let Some(config) = load_agent_dir(&path) {
                info!(agent = %config.name, model = %config.model, "loaded agent");
                self.agents.insert(config.name.clone(), config);
            }
        }
    }

    fn load_background(&mut self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') || name.starts_with('.') {
                continue;
            }
            if let Some(config) = load_agent_dir(&path) {
                info!(agent = %config.name, "loaded background agent");
                self.background_agents.insert(config.name.clone(), config);
            }
        }
    }

    /// Lookup by name, chattable agents first, then background agents.
    pub fn get(&self, name: &str) -> Option<&AgentConfig> {
        self.agents
            .get(name)
            .or_else(|| self.background_agents.get(name))
    }

    /// The agent marked `default = true`, used for ordinary chat turns.
    pub fn default_agent(&self) -> Option<&AgentConfig> {
        self.agents.values().find(|a| a.default)
    }

    pub fn list_agents(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn list_background_agents(&self) -> Vec<&str> {
        self.background_agents.keys().map(String::as_str).collect()
    }

    /// Explicit reload — config is immutable between reloads.
    pub fn reload(&mut self) {
        info!("reloading agent configurations");
        self.load_all();
    }
}

fn load_agent_dir(dir: &Path) -> Option<AgentConfig> {
    let config_path = dir.join("config.toml");
    if !config_path.exists() {
        debug!(dir = %dir.display(), "skipping: no config.toml");
        return None;
    }

    let raw = match std::fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(dir = %dir.display(), "failed to read config: {e}");
            return None;
        }
    };
    let mut config: AgentConfig = match toml::from_str(&raw) {
        Ok(c) => c,
        Err(e) => {
            warn!(dir = %dir.display(), "failed to parse config: {e}");
            return None;
        }
    };

    if config.name.is_empty() {
        config.name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
    }

    if !VALID_MODELS.contains(&config.model.as_str()) {
        warn!(
            agent = %config.name,
            model = %config.model,
            "invalid model, falling back to sonnet"
        );
        config.model = "sonnet".to_string();
    }

    config.tools = validate_tools(std::mem::take(&mut config.tools), &config.name);

    let prompt_path = dir.join("prompt.md");
    if prompt_path.exists() {
        match std::fs::read_to_string(&prompt_path) {
            Ok(prompt) => {
                config.prompt = Some(match config.kind {
                    AgentKind::Sdk => with_agent_header(&prompt),
                    AgentKind::Cli => prompt,
                });
            }
            Err(e) => warn!(agent = %config.name, "failed to read prompt.md: {e}"),
        }
    }

    Some(config)
}

/// Context header that keeps a subagent from absorbing project-level
/// instructions meant for the primary agent.
fn with_agent_header(prompt: &str) -> String {
    format!(
        "# AGENT CONTEXT\n\
         You are a focused agent with a specific task. Follow ONLY the instructions below.\n\
         Do NOT read or follow instructions from any external configuration.\n\n\
         ---\n\n{prompt}"
    )
}

fn validate_tools(tools: Vec<String>, agent_name: &str) -> Vec<String> {
    let mut validated = Vec::new();
    for tool in tools {
        if FORBIDDEN_TOOLS.contains(&tool.as_str()) {
            warn!(agent = agent_name, tool = %tool, "removed forbidden tool");
            continue;
        }
        if VALID_NATIVE_TOOLS.contains(&tool.as_str()) || tool.starts_with("mcp__") {
            validated.push(tool);
        } else {
            warn!(agent = agent_name, tool = %tool, "unrecognized tool, including anyway");
            validated.push(tool);
        }
    }
    validated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_agent(base: &Path, name: &str, config: &str, prompt: Option<&str>) {
        let dir = base.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), config).unwrap();
        if let Some(p) = prompt {
            std::fs::write(dir.join("prompt.md"), p).unwrap();
        }
    }

    #[test]
    fn loads_agents_and_background_separately() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "scout",
            "name = \"scout\"\nmodel = \"haiku\"\nchattable = true",
            Some("You gather information."),
        );
        let background = dir.path().join("background");
        write_agent(
            &background,
            "librarian",
            "name = \"librarian\"\nmodel = \"sonnet\"",
            Some("You extract memories."),
        );

        let mut registry = AgentRegistry::new(dir.path().to_path_buf());
        registry.load_all();

        assert!(registry.get("scout").is_some());
        assert!(registry.get("librarian").is_some());
        assert_eq!(registry.list_agents(), vec!["scout"]);
        assert_eq!(registry.list_background_agents(), vec!["librarian"]);
    }

    #[test]
    fn invalid_model_falls_back_to_sonnet() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "odd", "name = \"odd\"\nmodel = \"gpt-9\"", None);
        let mut registry = AgentRegistry::new(dir.path().to_path_buf());
        registry.load_all();
        assert_eq!(registry.get("odd").unwrap().model, "sonnet");
    }

    #[test]
    fn forbidden_tools_are_stripped_mcp_allowed() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "worker",
            "name = \"worker\"\ntools = [\"Task\", \"Read\", \"mcp__brain__search\"]",
            None,
        );
        let mut registry = AgentRegistry::new(dir.path().to_path_buf());
        registry.load_all();
        let tools = &registry.get("worker").unwrap().tools;
        assert_eq!(tools, &["Read", "mcp__brain__search"]);
    }

    #[test]
    fn name_defaults_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "anon", "model = \"opus\"", None);
        let mut registry = AgentRegistry::new(dir.path().to_path_buf());
        registry.load_all();
        assert!(registry.get("anon").is_some());
    }

    #[test]
    fn sdk_prompt_gets_context_header() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "scout",
            "name = \"scout\"",
            Some("Find things."),
        );
        let mut registry = AgentRegistry::new(dir.path().to_path_buf());
        registry.load_all();
        let prompt = registry.get("scout").unwrap().prompt.as_ref().unwrap();
        assert!(prompt.starts_with("# AGENT CONTEXT"));
        assert!(prompt.ends_with("Find things."));
    }

    #[test]
    fn default_agent_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "main",
            "name = \"main\"\ndefault = true\nchattable = true",
            None,
        );
        write_agent(dir.path(), "other", "name = \"other\"", None);
        let mut registry = AgentRegistry::new(dir.path().to_path_buf());
        registry.load_all();
        assert_eq!(registry.default_agent().unwrap().name, "main");
    }
}
