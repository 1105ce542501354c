//! Bounded execution log: the last 100 `{invocation, result}` pairs,
//! appended under an exclusive lock with an atomic write.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use cortex_core::files::locked_update;

use crate::types::{AgentInvocation, AgentResult};

const MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub invocation: AgentInvocation,
    pub result: AgentResult,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExecutionsFile {
    #[serde(default)]
    executions: Vec<ExecutionEntry>,
}

pub struct ExecutionLog {
    file: PathBuf,
}

impl ExecutionLog {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    pub fn append(&self, invocation: AgentInvocation, result: AgentResult) {
        let outcome = locked_update(&self.file, ExecutionsFile::default(), move |mut data| {
            data.executions.push(ExecutionEntry { invocation, result });
            let len = data.executions.len();
            if len > MAX_ENTRIES {
                data.executions.drain(..len - MAX_ENTRIES);
            }
            (data, ())
        });
        if let Err(e) = outcome {
            warn!("failed to log execution: {e}");
        }
    }

    pub fn recent(&self) -> Vec<ExecutionEntry> {
        let data: ExecutionsFile = cortex_core::files::load_json(&self.file, ExecutionsFile::default());
        data.executions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentStatus, InvocationMode};
    use chrono::Utc;

    fn entry(n: usize) -> (AgentInvocation, AgentResult) {
        (
            AgentInvocation::new("probe", format!("task {n}"), InvocationMode::Trust),
            AgentResult {
                agent: "probe".into(),
                status: AgentStatus::Success,
                response: format!("done {n}"),
                started_at: Utc::now(),
                completed_at: Utc::now(),
                error: None,
            },
        )
    }

    #[test]
    fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(dir.path().join("executions.json"));
        let (inv, res) = entry(1);
        log.append(inv, res);
        assert_eq!(log.recent().len(), 1);
    }

    #[test]
    fn keeps_only_last_100() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(dir.path().join("executions.json"));
        for n in 0..105 {
            let (inv, res) = entry(n);
            log.append(inv, res);
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].invocation.prompt, "task 5");
        assert_eq!(recent[99].invocation.prompt, "task 104");
    }
}
