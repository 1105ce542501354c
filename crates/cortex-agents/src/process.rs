//! Process registry — live invocations visible across the system.
//!
//! A shared JSON list updated under an exclusive lock. Entries carry the
//! OS pid when one is known; managed invocations (SDK-owned subprocesses)
//! register with no pid and are never pruned. Readers drop entries whose
//! pid is gone.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cortex_core::files::locked_update;
use cortex_core::ids::short_id;
use cortex_core::time::now_iso;

use crate::error::Result;

const TASK_DESC_CAP: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub id: String,
    pub pid: Option<u32>,
    pub agent: String,
    pub task: String,
    pub started: String,
}

pub struct ProcessRegistry {
    file: PathBuf,
}

impl ProcessRegistry {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    /// Register a running invocation. The agent name is suffixed `_1`,
    /// `_2`, … when the base name is already present. Returns the
    /// registration id for deregistration.
    pub fn register(&self, agent_name: &str, task: &str, pid: Option<u32>) -> Result<String> {
        let reg_id = short_id();
        let task = task.chars().take(TASK_DESC_CAP).collect::<String>();
        let id = reg_id.clone();
        let registered = locked_update(&self.file, Vec::<ProcessEntry>::new(), move |mut entries| {
            let name = unique_agent_name(&entries, agent_name);
            entries.push(ProcessEntry {
                id,
                pid,
                agent: name.clone(),
                task,
                started: now_iso(),
            });
            (entries, name)
        })?;
        info!(agent = %registered, pid = ?pid, reg_id = %reg_id, "registered process");
        Ok(reg_id)
    }

    pub fn deregister(&self, reg_id: &str) -> Result<()> {
        locked_update(&self.file, Vec::<ProcessEntry>::new(), |mut entries| {
            entries.retain(|e| e.id != reg_id);
            (entries, ())
        })?;
        debug!(reg_id, "deregistered process");
        Ok(())
    }

    /// Startup cleanup: previous runs' entries are all stale.
    pub fn clear(&self) -> Result<()> {
        locked_update(&self.file, Vec::<ProcessEntry>::new(), |_| (Vec::new(), ()))?;
        info!("cleared process registry");
        Ok(())
    }

    /// Current entries with dead pids pruned. Entries without a pid are
    /// managed processes and always kept. The prune happens under the same
    /// lock as the read so it never clobbers a concurrent registration.
    pub fn list(&self) -> Vec<ProcessEntry> {
        locked_update(&self.file, Vec::<ProcessEntry>::new(), |entries| {
            let alive: Vec<ProcessEntry> = entries
                .into_iter()
                .filter(|e| match e.pid {
                    None => true,
                    Some(pid) => pid_alive(pid),
                })
                .collect();
            (alive.clone(), alive)
        })
        .unwrap_or_default()
    }
}

fn unique_agent_name(entries: &[ProcessEntry], base: &str) -> String {
    let existing: std::collections::HashSet<&str> =
        entries.iter().map(|e| e.agent.as_str()).collect();
    if !existing.contains(base) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{base}_{i}");
        if !existing.contains(candidate.as_str()) {
            return candidate;
        }
        i += 1;
    }
}

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence without touching the process.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
